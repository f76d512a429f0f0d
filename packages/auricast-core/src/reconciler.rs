//! Configuration applier.
//!
//! Turns a declarative [`DesiredEngineState`] into incremental operations on
//! the live engine, keeping a shadow copy of what is actually applied. The
//! shadow is updated only after an engine call succeeds, so after a partial
//! failure the next apply retries exactly the missing pieces, and applying
//! the same state twice is a no-op.
//!
//! Entry is single-flight through an async mutex. WebRTC senders cannot
//! re-enter `apply_state` from their cleanup callbacks; instead their
//! requests queue up in the engine and are drained at the start of the next
//! cycle.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::engine::AudioEngine;
use crate::error::{RouteError, RouteResult};
use crate::state::{DesiredEngineState, SinkSpec, SourcePathSpec};

/// One executed engine operation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpReport {
    pub op: &'static str,
    pub target: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of one apply cycle. A failed item never aborts the rest.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyReport {
    pub ops: Vec<OpReport>,
}

impl ApplyReport {
    fn record(&mut self, op: &'static str, target: &str, result: RouteResult<()>) -> bool {
        let success = result.is_ok();
        if let Err(err) = &result {
            log::warn!("[Reconciler] {op} '{target}' failed: {err}");
        }
        self.ops.push(OpReport {
            op,
            target: target.to_string(),
            success,
            error: result.err().map(|e| e.to_string()),
        });
        success
    }

    /// True when the cycle changed nothing (idempotent re-apply).
    pub fn is_noop(&self) -> bool {
        self.ops.is_empty()
    }
}

#[derive(Default)]
struct Shadow {
    sinks: HashMap<String, SinkSpec>,
    paths: HashMap<String, SourcePathSpec>,
}

/// Applies desired-state documents to an [`AudioEngine`].
pub struct Reconciler {
    engine: Arc<AudioEngine>,
    shadow: tokio::sync::Mutex<Shadow>,
}

impl Reconciler {
    pub fn new(engine: Arc<AudioEngine>) -> Self {
        Self {
            engine,
            shadow: tokio::sync::Mutex::new(Shadow::default()),
        }
    }

    /// The currently applied state, reconstructed from the shadow.
    pub async fn applied_state(&self) -> DesiredEngineState {
        let shadow = self.shadow.lock().await;
        let mut sinks: Vec<SinkSpec> = shadow.sinks.values().cloned().collect();
        let mut source_paths: Vec<SourcePathSpec> = shadow.paths.values().cloned().collect();
        sinks.sort_by(|a, b| a.sink_id.cmp(&b.sink_id));
        source_paths.sort_by(|a, b| a.path_id.cmp(&b.path_id));
        DesiredEngineState {
            sinks,
            source_paths,
        }
    }

    /// Diffs `desired` against the shadow and sequences engine operations:
    /// remove paths, remove sinks, add paths, add sinks, update paths,
    /// update sink connections.
    pub async fn apply_state(&self, desired: DesiredEngineState) -> RouteResult<ApplyReport> {
        validate(&desired)?;
        let mut shadow = self.shadow.lock().await;
        let mut report = ApplyReport::default();

        // Serialized WebRTC cleanup requests from the engine
        for sink_id in self.engine.drain_cleanup_requests() {
            if shadow.sinks.contains_key(&sink_id) {
                let result = self.engine.remove_sink(&sink_id).await;
                if report.record("reap_sink", &sink_id, ignore_not_found(result)) {
                    shadow.sinks.remove(&sink_id);
                }
            }
        }

        let desired_sinks: HashMap<String, &SinkSpec> = desired
            .sinks
            .iter()
            .map(|s| (s.sink_id.clone(), s))
            .collect();
        let desired_paths: HashMap<String, &SourcePathSpec> = desired
            .source_paths
            .iter()
            .map(|p| (p.path_id.clone(), p))
            .collect();

        // ── Partition source paths ──────────────────────────────────────
        let mut paths_to_remove: Vec<String> = Vec::new();
        let mut paths_to_add: Vec<&SourcePathSpec> = Vec::new();
        let mut paths_to_update: Vec<&SourcePathSpec> = Vec::new();

        for path_id in shadow.paths.keys() {
            match desired_paths.get(path_id) {
                None => paths_to_remove.push(path_id.clone()),
                Some(want) => {
                    let have = &shadow.paths[path_id];
                    if want.fundamental_changed(have) {
                        // Re-created with a fresh processor instance
                        paths_to_remove.push(path_id.clone());
                        paths_to_add.push(want);
                    } else if want.parametric_changed(have) {
                        paths_to_update.push(want);
                    }
                }
            }
        }
        for path in &desired.source_paths {
            if !shadow.paths.contains_key(&path.path_id) {
                paths_to_add.push(path);
            }
        }

        // ── Partition sinks ─────────────────────────────────────────────
        let mut sinks_to_remove: Vec<String> = Vec::new();
        let mut sinks_to_add: Vec<&SinkSpec> = Vec::new();
        let mut sinks_to_update: Vec<&SinkSpec> = Vec::new();

        for sink_id in shadow.sinks.keys() {
            match desired_sinks.get(sink_id) {
                None => sinks_to_remove.push(sink_id.clone()),
                Some(want) => {
                    let have = &shadow.sinks[sink_id];
                    if want.engine_config_changed(have) {
                        sinks_to_remove.push(sink_id.clone());
                        sinks_to_add.push(want);
                    } else if want.connections_changed(have) {
                        sinks_to_update.push(want);
                    }
                }
            }
        }
        for sink in &desired.sinks {
            if !shadow.sinks.contains_key(&sink.sink_id) {
                sinks_to_add.push(sink);
            }
        }

        // ── 1. Remove source paths ──────────────────────────────────────
        for path_id in &paths_to_remove {
            let result = self.engine.remove_source_path(path_id).await;
            if report.record("remove_path", path_id, ignore_not_found(result)) {
                shadow.paths.remove(path_id);
            }
        }

        // ── 2. Remove sinks ─────────────────────────────────────────────
        for sink_id in &sinks_to_remove {
            let result = self.engine.remove_sink(sink_id).await;
            if report.record("remove_sink", sink_id, ignore_not_found(result)) {
                shadow.sinks.remove(sink_id);
            }
        }

        // ── 3. Add source paths ─────────────────────────────────────────
        for path in paths_to_add {
            // The chunk shape comes from the desired sink spec so a path
            // can be created ahead of its sink
            let chunk_size = self.engine.tuning().chunk_size_bytes;
            let result = match frames_per_chunk_for(path, chunk_size, &desired_sinks, &shadow.sinks)
            {
                Ok(frames) => self
                    .engine
                    .add_source_path(path, frames)
                    .map(|_instance| ()),
                Err(err) => Err(err),
            };
            if report.record("add_path", &path.path_id, result) {
                shadow.paths.insert(path.path_id.clone(), path.clone());
                // Re-attach to already-live sinks that list this path
                for sink in shadow.sinks.values() {
                    if sink
                        .connected_source_path_ids
                        .iter()
                        .any(|id| id == &path.path_id)
                    {
                        let result = self.engine.connect(&path.path_id, &sink.sink_id);
                        report.record("connect", &path.path_id, result);
                    }
                }
            }
        }

        // ── 4. Add sinks (then their connections) ───────────────────────
        for sink in sinks_to_add {
            let result = self.engine.add_sink(sink).await;
            if report.record("add_sink", &sink.sink_id, result) {
                shadow.sinks.insert(sink.sink_id.clone(), sink.clone());
                for path_id in &sink.connected_source_path_ids {
                    if shadow.paths.contains_key(path_id) {
                        let result = self.engine.connect(path_id, &sink.sink_id);
                        report.record("connect", path_id, result);
                    }
                }
            }
        }

        // ── 5. Update source paths (parametric) ─────────────────────────
        for path in paths_to_update {
            let result = self
                .engine
                .update_source_path(&path.path_id, path.as_parameter_updates());
            if report.record("update_path", &path.path_id, result) {
                shadow.paths.insert(path.path_id.clone(), path.clone());
            }
        }

        // ── 6. Update sink connections (symmetric difference) ───────────
        for sink in sinks_to_update {
            let have = shadow.sinks.get(&sink.sink_id).cloned();
            let Some(have) = have else { continue };

            let mut all_ok = true;
            for path_id in &have.connected_source_path_ids {
                if !sink.connected_source_path_ids.contains(path_id) {
                    let result = self.engine.disconnect(path_id, &sink.sink_id);
                    all_ok &= report.record("disconnect", path_id, result);
                }
            }
            for path_id in &sink.connected_source_path_ids {
                if !have.connected_source_path_ids.contains(path_id) {
                    let result = self.engine.connect(path_id, &sink.sink_id);
                    all_ok &= report.record("connect", path_id, result);
                }
            }
            if all_ok {
                shadow.sinks.insert(sink.sink_id.clone(), sink.clone());
            }
        }

        Ok(report)
    }
}

/// Removal of something already gone is success for shadow purposes: the
/// shadow must reflect reality, not intent.
fn ignore_not_found(result: RouteResult<()>) -> RouteResult<()> {
    match result {
        Err(RouteError::SinkNotFound(_)) | Err(RouteError::PathNotFound(_)) => Ok(()),
        other => other,
    }
}

/// Chunk frame count for a path, from its target sink's wire format.
fn frames_per_chunk_for(
    path: &SourcePathSpec,
    chunk_size_bytes: usize,
    desired_sinks: &HashMap<String, &SinkSpec>,
    shadow_sinks: &HashMap<String, SinkSpec>,
) -> RouteResult<usize> {
    let sink: &SinkSpec = desired_sinks
        .get(&path.target_sink_id)
        .copied()
        .or_else(|| shadow_sinks.get(&path.target_sink_id))
        .ok_or_else(|| {
            RouteError::InvalidState(format!(
                "path '{}' targets unknown sink '{}'",
                path.path_id, path.target_sink_id
            ))
        })?;

    if path.target_output_channels != sink.channels
        || path.target_output_samplerate != sink.samplerate
    {
        return Err(RouteError::InvalidState(format!(
            "path '{}' target format does not match sink '{}'",
            path.path_id, sink.sink_id
        )));
    }

    let bytes_per_frame = (sink.bitdepth as usize / 8) * sink.channels as usize;
    if bytes_per_frame == 0 {
        return Err(RouteError::InvalidState(format!(
            "sink '{}' has a zero-sized frame",
            sink.sink_id
        )));
    }
    Ok(chunk_size_bytes / bytes_per_frame)
}

fn validate(desired: &DesiredEngineState) -> RouteResult<()> {
    let mut sink_ids = std::collections::HashSet::new();
    for sink in &desired.sinks {
        if !sink_ids.insert(&sink.sink_id) {
            return Err(RouteError::InvalidState(format!(
                "duplicate sink id '{}'",
                sink.sink_id
            )));
        }
    }
    let mut path_ids = std::collections::HashSet::new();
    for path in &desired.source_paths {
        if !path_ids.insert(&path.path_id) {
            return Err(RouteError::InvalidState(format!(
                "duplicate path id '{}'",
                path.path_id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::protocol_constants::EQ_BANDS;
    use crate::state::{EngineTuning, SinkProtocol};
    use std::collections::HashMap as StdHashMap;
    use std::net::{IpAddr, Ipv4Addr};

    fn engine() -> Arc<AudioEngine> {
        let engine = AudioEngine::new(EngineConfig {
            tuning: EngineTuning::default(),
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            scream_port: None,
            per_process_port: None,
            rtp_port: None,
            sap_enabled: false,
        });
        engine.start().unwrap();
        engine
    }

    fn sink(id: &str, paths: &[&str]) -> SinkSpec {
        SinkSpec {
            sink_id: id.into(),
            protocol: SinkProtocol::LegacyScream,
            ip: "127.0.0.1".into(),
            port: 14010,
            samplerate: 48000,
            bitdepth: 16,
            channels: 2,
            chlayout1: 0,
            chlayout2: 0,
            mp3_enabled: false,
            mp3_payload_type: 14,
            connected_source_path_ids: paths.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn path(id: &str, sink: &str) -> SourcePathSpec {
        SourcePathSpec {
            path_id: id.into(),
            source_tag: "10.0.0.1      ".into(),
            target_sink_id: sink.into(),
            volume: 1.0,
            eq_values: [1.0; EQ_BANDS],
            eq_normalization: false,
            volume_normalization: false,
            delay_ms: 0,
            timeshift_sec: 0.0,
            speaker_layouts_map: StdHashMap::new(),
            target_output_channels: 2,
            target_output_samplerate: 48000,
        }
    }

    fn state(sinks: Vec<SinkSpec>, paths: Vec<SourcePathSpec>) -> DesiredEngineState {
        DesiredEngineState {
            sinks,
            source_paths: paths,
        }
    }

    #[tokio::test]
    async fn apply_is_idempotent() {
        let engine = engine();
        let reconciler = Reconciler::new(Arc::clone(&engine));

        let desired = state(vec![sink("s1", &["p1"])], vec![path("p1", "s1")]);
        let first = reconciler.apply_state(desired.clone()).await.unwrap();
        assert!(!first.is_noop());
        assert!(first.ops.iter().all(|op| op.success), "{:?}", first.ops);

        // Property: a second apply of the same document issues no ops
        let second = reconciler.apply_state(desired).await.unwrap();
        assert!(second.is_noop(), "expected no-op, got {:?}", second.ops);

        engine.stop().await;
    }

    #[tokio::test]
    async fn removal_tears_down_only_the_removed_sink() {
        let engine = engine();
        let reconciler = Reconciler::new(Arc::clone(&engine));

        let full = state(
            vec![sink("a", &["p1"]), sink("b", &[])],
            vec![path("p1", "a")],
        );
        reconciler.apply_state(full).await.unwrap();
        assert_eq!(engine.stats().sinks.len(), 2);

        let reduced = state(vec![sink("a", &["p1"])], vec![path("p1", "a")]);
        let report = reconciler.apply_state(reduced).await.unwrap();
        assert!(report
            .ops
            .iter()
            .any(|op| op.op == "remove_sink" && op.target == "b" && op.success));
        assert_eq!(engine.stats().sinks.len(), 1);
        // Sink A's path connection survives untouched
        assert_eq!(engine.stats().sinks[0].connected_paths, 1);

        engine.stop().await;
    }

    #[tokio::test]
    async fn parametric_change_updates_without_recreating() {
        let engine = engine();
        let reconciler = Reconciler::new(Arc::clone(&engine));

        reconciler
            .apply_state(state(vec![sink("s1", &["p1"])], vec![path("p1", "s1")]))
            .await
            .unwrap();
        let instance_before = engine.path_instance_id("p1").unwrap();

        let mut updated = path("p1", "s1");
        updated.volume = 0.5;
        let report = reconciler
            .apply_state(state(vec![sink("s1", &["p1"])], vec![updated]))
            .await
            .unwrap();

        assert!(report
            .ops
            .iter()
            .any(|op| op.op == "update_path" && op.success));
        assert_eq!(
            engine.path_instance_id("p1").unwrap(),
            instance_before,
            "parametric change must not mint a new instance"
        );

        engine.stop().await;
    }

    #[tokio::test]
    async fn fundamental_change_recreates_the_processor() {
        let engine = engine();
        let reconciler = Reconciler::new(Arc::clone(&engine));

        reconciler
            .apply_state(state(vec![sink("s1", &["p1"])], vec![path("p1", "s1")]))
            .await
            .unwrap();
        let instance_before = engine.path_instance_id("p1").unwrap();

        let mut moved = path("p1", "s1");
        moved.source_tag = "10.0.0.2      ".into();
        reconciler
            .apply_state(state(vec![sink("s1", &["p1"])], vec![moved]))
            .await
            .unwrap();

        let instance_after = engine.path_instance_id("p1").unwrap();
        assert_ne!(instance_before, instance_after);

        engine.stop().await;
    }

    #[tokio::test]
    async fn connection_diff_applies_symmetric_difference() {
        let engine = engine();
        let reconciler = Reconciler::new(Arc::clone(&engine));

        reconciler
            .apply_state(state(
                vec![sink("s1", &["p1"])],
                vec![path("p1", "s1"), path("p2", "s1")],
            ))
            .await
            .unwrap();
        assert_eq!(engine.stats().sinks[0].connected_paths, 1);

        let report = reconciler
            .apply_state(state(
                vec![sink("s1", &["p2"])],
                vec![path("p1", "s1"), path("p2", "s1")],
            ))
            .await
            .unwrap();

        let connects: Vec<_> = report.ops.iter().filter(|op| op.op == "connect").collect();
        let disconnects: Vec<_> = report
            .ops
            .iter()
            .filter(|op| op.op == "disconnect")
            .collect();
        assert_eq!(connects.len(), 1);
        assert_eq!(disconnects.len(), 1);
        assert_eq!(engine.stats().sinks[0].connected_paths, 1);

        engine.stop().await;
    }

    #[tokio::test]
    async fn failed_item_does_not_abort_the_cycle() {
        let engine = engine();
        let reconciler = Reconciler::new(Arc::clone(&engine));

        // p-bad targets a sink that exists nowhere; s1/p1 still applies
        let report = reconciler
            .apply_state(state(
                vec![sink("s1", &["p1"])],
                vec![path("p1", "s1"), path("p-bad", "ghost")],
            ))
            .await
            .unwrap();

        assert!(report
            .ops
            .iter()
            .any(|op| op.op == "add_path" && op.target == "p-bad" && !op.success));
        assert!(report
            .ops
            .iter()
            .any(|op| op.op == "add_sink" && op.target == "s1" && op.success));
        assert!(engine.path_instance_id("p1").is_some());
        assert!(engine.path_instance_id("p-bad").is_none());

        engine.stop().await;
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected_before_any_op() {
        let engine = engine();
        let reconciler = Reconciler::new(Arc::clone(&engine));
        let result = reconciler
            .apply_state(state(vec![sink("s1", &[]), sink("s1", &[])], vec![]))
            .await;
        assert!(result.is_err());
        assert_eq!(engine.stats().sinks.len(), 0);
        engine.stop().await;
    }
}
