pub mod decoder;
pub mod frame;
pub mod hotcue;

/// Process-unique identity of one accepted producer connection.
pub type ConnectionId = u64;
