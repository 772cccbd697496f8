pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod phase;
pub mod schedule;
pub mod store;
pub mod types;
pub mod workload;
