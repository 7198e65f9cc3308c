pub mod engine;
pub mod market_data;
