//! callscribe - A staged, queue-driven transcription pipeline for recorded calls
//!
//! A request enters through the ingress stage, travels through dispatch,
//! speech-to-text, tagging and tagging QA, and ends at completion. Each stage
//! is an HTTP worker fed by a durable task queue; the request record is
//! persisted with merge-writes at every hop.

pub mod cli;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod recognition;
pub mod server;
pub mod stages;
pub mod storage;
pub mod tagging;

pub use error::{PipelineError, Result};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "callscribe";
