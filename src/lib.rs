pub mod chat;
pub mod cli;
pub mod commands;
pub mod config;
pub mod engine;
pub mod events;
pub mod jobs;
pub mod logging;
pub mod platform;
pub mod ports;
pub mod process;
pub mod state;
pub mod topic;
pub mod watchdog;
