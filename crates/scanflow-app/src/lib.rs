pub mod cleanup;
pub mod cli;
pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod job;
pub mod meta;
pub mod orchestrate;
pub mod paths;
pub mod state;
pub mod tables;
pub mod throttle;
