// Common library for the fleet scheduler and node runner

pub mod config;
pub mod datacenter;
pub mod errors;
pub mod job;
pub mod leader;
pub mod lock;
pub mod models;
pub mod registry;
pub mod repositories;
pub mod runner;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod substitution;
pub mod supervisor;
pub mod telemetry;
pub mod watch;
