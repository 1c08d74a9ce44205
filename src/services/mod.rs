pub mod autoscaler;
pub mod classifier;
pub mod correlation;
pub mod fleet;
pub mod gateway;
pub mod memory;
pub mod queue;
pub mod storage;
pub mod worker;
