pub mod database;
pub mod repositories;

pub use repositories::SqliteCandleStore;
