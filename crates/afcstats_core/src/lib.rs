pub mod api;
pub mod chart;
pub mod classify;
pub mod config;
pub mod fetch;
pub mod history;
pub mod migrate;
pub mod notes;
pub mod reconcile;
pub mod runtime;
pub mod schedule;
pub mod store;
pub mod task;

#[cfg(test)]
mod test_support;
