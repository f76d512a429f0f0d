//! Auricast Core - low-latency network audio routing engine.
//!
//! This crate ingests raw PCM audio streams from the network (legacy Scream,
//! per-process Scream, RTP with SAP discovery), runs per-source signal
//! processing (volume, 18-band EQ, delay, timeshift, speaker-layout
//! remapping, sample-rate conversion) and emits re-encoded audio to many
//! sinks over Scream UDP, RTP or WebRTC/Opus. Every sink mixes its own
//! subset of transformed source streams.
//!
//! # Architecture
//!
//! Data flows receiver -> timeshift manager -> source processor(s) -> sink
//! mixer(s) -> network sender(s), one Tokio task per stage:
//!
//! - [`receiver`]: UDP ingest, wire parsing, clock-paced staging
//! - [`clock`]: shared per-format metronomes for paced delivery
//! - [`timeshift`]: per-source rolling buffers with one unified adaptive
//!   playout delay per stream
//! - [`processor`]: per-path DSP chain producing fixed-size chunks
//! - [`mixer`]: per-sink summing, clipping, wire conversion
//! - [`sync`]: optional cross-sink tick alignment
//! - [`sender`]: Scream / RTP / WebRTC transmit paths
//! - [`engine`]: the owning facade the control plane mutates
//! - [`reconciler`]: declarative desired-state application with a shadow
//! - [`api`]: HTTP control surface
//!
//! Control flow is separate: the reconciler mutates the set of sources,
//! processors, sinks and connections while the data plane keeps running.

#![warn(clippy::all)]

pub mod api;
pub mod clock;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod format;
pub mod mixer;
pub mod packet;
pub mod processor;
pub mod protocol_constants;
pub mod queue;
pub mod receiver;
pub mod reconciler;
pub mod sender;
pub mod state;
pub mod stats;
pub mod sync;
pub mod timeshift;

// Re-export commonly used types at the crate root
pub use engine::{AudioEngine, EngineConfig};
pub use error::{ErrorCode, RouteError, RouteResult};
pub use format::AudioFormat;
pub use packet::{PacketError, TaggedAudioPacket};
pub use reconciler::{ApplyReport, OpReport, Reconciler};
pub use state::{
    DesiredEngineState, EngineTuning, SinkProtocol, SinkSpec, SourceParameterUpdates,
    SourcePathSpec, SpeakerLayout,
};
pub use stats::EngineStats;

// Re-export API types
pub use api::{build_router, start_server, AppState};
