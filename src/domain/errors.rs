use thiserror::Error;

/// Errors raised by the live streaming socket and its protocol layer
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Connection lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("Authentication rejected by upstream: {reason}")]
    AuthRejected { reason: String },

    #[error("Protocol violation in state {state}: {line}")]
    ProtocolViolation { state: String, line: String },

    #[error("Malformed record: {reason}")]
    MalformedRecord { reason: String },
}

/// Errors for malformed client requests; rejected synchronously with no
/// state mutation.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Invalid range: start {start} is not before end {end}")]
    InvalidRange { start: i64, end: i64 },

    #[error("Unknown instrument: {instrument}")]
    UnknownInstrument { instrument: String },

    #[error("No data available for {instrument} in [{start}, {end}]")]
    NoDataAvailable {
        instrument: String,
        start: i64,
        end: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_error_formatting() {
        let err = FeedError::ProtocolViolation {
            state: "AuthSent".to_string(),
            line: "success=0".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("AuthSent"));
        assert!(msg.contains("success=0"));
    }

    #[test]
    fn test_request_error_formatting() {
        let err = RequestError::InvalidRange {
            start: 200,
            end: 100,
        };
        assert!(err.to_string().contains("200"));
        assert!(err.to_string().contains("100"));
    }
}
