pub mod historical;
pub mod live;
pub mod protocol;
