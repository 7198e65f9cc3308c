// Candle pipeline modules
pub mod aggregator;
pub mod reconciler;
pub mod session;
