//! Library crate for proxy-probe-rs exposing reusable modules.
pub mod config;
pub mod engine;
pub mod events;
pub mod export;
pub mod ingest;
pub mod merge;
pub mod parser;
pub mod presets;
pub mod probe;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod types;
