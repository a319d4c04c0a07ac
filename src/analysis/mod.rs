pub mod benchmark;
pub mod metrics;
