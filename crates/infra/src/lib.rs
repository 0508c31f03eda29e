//! Infrastructure layer: failed-event stores, retry orchestration, sweeps, config.

pub mod config;
pub mod event_bus;
pub mod failed_events;

#[cfg(test)]
mod integration_tests;
