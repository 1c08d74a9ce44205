pub mod fleet;
pub mod job;
