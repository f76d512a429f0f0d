//! Serializable metrics snapshots.
//!
//! Every pipeline stage exposes a point-in-time snapshot; the engine facade
//! aggregates them into one [`EngineStats`] document served by the control
//! API. Snapshots are plain data so taking one never blocks the data plane
//! beyond the per-stream critical section.

use serde::Serialize;

/// Per-receiver ingest counters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverStats {
    pub name: String,
    pub port: u16,
    pub packets_received: u64,
    pub packets_malformed: u64,
    pub socket_reopens: u64,
}

/// One consumer of a timeshift stream.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerStats {
    pub processor_id: String,
    /// Packets buffered ahead of this consumer's read position.
    pub read_lag: u64,
    pub queue_len: usize,
    pub queue_dropped: u64,
}

/// Per-stream timeshift state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStats {
    pub source_tag: String,
    pub buffer_depth: usize,
    pub smoothed_jitter_ms: f64,
    pub unified_delay_ms: f64,
    pub late_packets: u64,
    pub consumers: Vec<ConsumerStats>,
}

/// Per-sink mixer counters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkStats {
    pub sink_id: String,
    pub chunks_mixed: u64,
    pub underruns: u64,
    pub muted_sources: usize,
    pub connected_paths: usize,
    pub send_errors: u64,
}

/// Aggregated engine snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub receivers: Vec<ReceiverStats>,
    pub streams: Vec<StreamStats>,
    pub sinks: Vec<SinkStats>,
}
