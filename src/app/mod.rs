pub mod adb;
pub mod automation;
pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod features;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod plan;
pub mod registry;
pub mod scheduler;
pub mod startup;
pub mod state;
#[cfg(test)]
pub mod testing;
