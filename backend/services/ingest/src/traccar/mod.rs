pub mod account_sync;
pub mod actions;
pub mod client;
pub mod config;
pub mod device_sync;
pub mod models;
pub mod sequencer;
