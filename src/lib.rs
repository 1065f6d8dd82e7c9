pub mod cli;
pub mod client;
pub mod config;
pub mod document;
pub mod error;
pub mod orchestrator;
pub mod pool;
pub mod progress;
pub mod retry;
pub mod storage;
pub mod tuner;
