// Market data domain
pub mod market;

// Port interfaces for upstream data sources
pub mod ports;

// Repository traits
pub mod repositories;

// Domain-specific error types
pub mod errors;
