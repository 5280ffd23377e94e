pub mod asset;
pub mod generation;
pub mod job;
pub mod mode;
