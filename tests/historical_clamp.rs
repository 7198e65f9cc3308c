//! Historical client against a scripted in-process HTTP upstream: when the
//! requested end exceeds available data, the client clamps to the advertised
//! boundary and retries exactly once.

use barstream::domain::ports::HistoricalBarSource;
use barstream::infrastructure::feed::historical::HistoricalFeedClient;
use rust_decimal_macros::dec;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const BASE: i64 = 1704067200000;
const MIN: i64 = 60_000;

/// Serves one request per connection and records the request line. The
/// client reconnects between attempts because each response closes the
/// connection.
async fn serve_responses(
    listener: TcpListener,
    responses: Vec<(u16, String)>,
    requests: Arc<Mutex<Vec<String>>>,
) {
    for (status, body) in responses {
        let (mut sock, _) = listener.accept().await.unwrap();

        let mut raw = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = sock.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&buf[..n]);
            if raw.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        let request_line = String::from_utf8_lossy(&raw)
            .lines()
            .next()
            .unwrap_or_default()
            .to_string();
        requests.lock().unwrap().push(request_line);

        let reason = if status == 200 { "OK" } else { "Bad Request" };
        let response = format!(
            "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        sock.write_all(response.as_bytes()).await.unwrap();
        sock.shutdown().await.ok();
    }
}

fn bar_line(minute: i64) -> String {
    format!(
        "{{\"ts_event\":{},\"open\":100000000000,\"high\":101000000000,\"low\":99000000000,\"close\":100500000000,\"volume\":5}}",
        BASE + minute * MIN
    )
}

#[tokio::test]
async fn test_end_beyond_available_clamps_and_retries_once() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));

    let available_end = BASE + 2 * MIN;
    let error_body = format!(
        "{{\"detail\":\"end beyond available range\",\"available_end\":{available_end}}}"
    );
    let ndjson = format!("{}\n{}\n{}\n", bar_line(0), bar_line(1), bar_line(2));

    let server = tokio::spawn(serve_responses(
        listener,
        vec![(400, error_body), (200, ndjson)],
        requests.clone(),
    ));

    let client = HistoricalFeedClient::new(
        format!("http://{addr}"),
        "ks-testkeyABCDE".to_string(),
        "GLBX.MDP3".to_string(),
    );

    let bars = client
        .fetch_range("ESM5", BASE, BASE + 60 * MIN)
        .await
        .unwrap();

    // Data through the advertised boundary, nothing beyond it
    assert_eq!(bars.len(), 3);
    assert_eq!(bars[0].timestamp, BASE);
    assert_eq!(bars[0].open, dec!(100));
    assert_eq!(bars[2].timestamp, available_end);
    assert!(bars.iter().all(|b| b.timestamp <= available_end));

    server.await.unwrap();

    // Exactly two requests: the original, then one retry with the clamped end
    let seen = requests.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen[0].contains(&format!("end={}", BASE + 60 * MIN)));
    assert!(seen[1].contains(&format!("end={available_end}")));
}

#[tokio::test]
async fn test_plain_error_body_fails_without_retry() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));

    // No available_end in the body: nothing to clamp to
    let server = tokio::spawn(serve_responses(
        listener,
        vec![(400, "{\"detail\":\"unknown dataset\"}".to_string())],
        requests.clone(),
    ));

    let client = HistoricalFeedClient::new(
        format!("http://{addr}"),
        "ks-testkeyABCDE".to_string(),
        "GLBX.MDP3".to_string(),
    );

    let result = client.fetch_range("ESM5", BASE, BASE + 60 * MIN).await;
    assert!(result.is_err());

    server.await.unwrap();
    assert_eq!(requests.lock().unwrap().len(), 1);
}
