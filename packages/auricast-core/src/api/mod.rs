//! Control API.
//!
//! A small HTTP surface over the engine: apply a desired state, read back
//! the applied shadow, fetch metrics, negotiate WebRTC sinks. The data
//! plane never depends on this module.

pub mod http;

pub use http::{build_router, start_server};

use std::sync::Arc;

use crate::engine::AudioEngine;
use crate::reconciler::Reconciler;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<AudioEngine>,
    pub reconciler: Arc<Reconciler>,
}

impl AppState {
    pub fn new(engine: Arc<AudioEngine>, reconciler: Arc<Reconciler>) -> Self {
        Self { engine, reconciler }
    }
}
