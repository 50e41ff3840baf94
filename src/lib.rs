#![doc = include_str!("../docs/rustdoc.md")]

/// Live event stream aggregator and its consumer handle.
pub mod aggregator;
/// Bounded event buffer and batch accumulator.
pub mod buffer;
/// Command-line argument definitions.
pub mod cli;
/// Runtime configuration model.
pub mod config;
/// Error types used across the crate.
pub mod error;
/// Notifications from the aggregator to the UI.
pub mod events;
/// Terminal output formatters.
pub mod formatter;
/// Stream state, batching and buffer invariants.
pub mod live_state;
/// Metrics and health status structures.
pub mod monitoring;
/// Cancellable push connection.
pub mod subscription;
/// Tracing/logging initialization.
pub mod tracing_setup;
/// HTTP transport for the stream and stats endpoints.
pub mod transport;
/// Live event data model.
pub mod types;
/// UI controller and stdin controls.
pub mod ui;

/// Primary crate error type.
pub use error::LiveEventsError;
pub use aggregator::{LiveEventsAggregator, LiveEventsHandle};
