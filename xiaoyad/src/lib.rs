pub mod config;
pub mod daemon;
pub mod schedule;
pub mod sync;
