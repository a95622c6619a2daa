pub mod delivery;
pub mod triggers;
