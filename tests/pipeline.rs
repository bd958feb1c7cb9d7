//! Descriptor-driven runs: loading from disk, builtin handlers, invocation
//! logs, worker processes, and the bootstrap stage.

use framewire::runtime::bootstrap::Bootstrap;
use framewire::runtime::FailureReason;
use framewire::{
    load_file, load_str, EngineConfig, EngineError, ExecutionEngine, ExecutionState,
    HandlerRegistry, Node, RoutingError,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn demo_descriptor() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/media_pipeline.json")
}

#[tokio::test]
async fn demo_pipeline_tolerates_missing_music_track() {
    let graph = Arc::new(load_file(demo_descriptor()).unwrap());
    let engine = ExecutionEngine::new(
        EngineConfig::builtin().with_skip_build(true),
        HandlerRegistry::with_builtins(),
    );

    let report = engine.execute(Arc::clone(&graph)).await.unwrap();

    assert_eq!(report.state("music-generator"), Some(ExecutionState::Failed));
    assert_eq!(
        report.node("music-generator").unwrap().error.as_deref(),
        Some("music API quota exhausted")
    );
    assert_eq!(report.state("result-logger"), Some(ExecutionState::Completed));

    let summary = &report.node("result-logger").unwrap().outputs["summary"];
    assert_eq!(
        summary,
        &json!({
            "inputs": {
                "video_frame_in": { "text": "a quiet harbour at dawn", "duration": 5 }
            },
            "missing": ["music_track_in"]
        })
    );

    let text = report.to_string();
    assert!(text.contains("  music-generator: Failed (music API quota exhausted)\n"));
    assert!(text.ends_with("1 of 4 node(s) failed"));
}

#[tokio::test]
async fn write_log_nodes_append_invocation_records() {
    let logs = tempfile::tempdir().unwrap();
    let graph = Arc::new(load_file(demo_descriptor()).unwrap());
    let engine = ExecutionEngine::new(
        EngineConfig::builtin()
            .with_skip_build(true)
            .with_log_dir(logs.path()),
        HandlerRegistry::with_builtins(),
    );

    engine.execute(Arc::clone(&graph)).await.unwrap();

    let contents = std::fs::read_to_string(logs.path().join("video-generator.jsonl")).unwrap();
    let records: Vec<Value> = contents
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["phase"], "start");
    assert_eq!(records[1]["phase"], "finish");
    assert_eq!(records[1]["produced"], json!(["videos"]));

    // Nodes without WRITE_LOG leave no file behind
    assert!(!logs.path().join("music-generator.jsonl").exists());
}

#[tokio::test]
async fn descriptor_file_from_disk_round_trips_through_a_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dataflow.json");
    std::fs::write(
        &path,
        r#"{
            "nodes": [
                { "id": "seed", "path": "builtin:constant", "outputs": ["n"], "env": { "VALUE": 7 } },
                { "id": "echo", "path": "builtin:passthrough", "inputs": { "n": "seed/n" }, "outputs": ["n"] },
                { "id": "sink", "path": "builtin:collect", "inputs": { "n": "echo/n" }, "outputs": ["all"],
                  "env": { "IS_DATAFLOW_END": "true" } }
            ]
        }"#,
    )
    .unwrap();

    let graph = Arc::new(load_file(&path).unwrap());
    let engine = ExecutionEngine::new(
        EngineConfig::builtin().with_skip_build(true),
        HandlerRegistry::with_builtins(),
    );
    let report = engine.execute(Arc::clone(&graph)).await.unwrap();

    assert!(report.is_success());
    assert_eq!(
        report.node("sink").unwrap().outputs["all"],
        json!({ "inputs": { "n": 7 }, "missing": [] })
    );
    assert!(report.failed_reachable_from_entry(&graph).is_empty());
}

#[tokio::test]
async fn failed_build_aborts_before_any_node_runs() {
    let graph = Arc::new(
        load_str(
            r#"{ "nodes": [
                { "id": "a", "path": "builtin:constant", "outputs": ["o"], "build": "exit 3" }
            ] }"#,
        )
        .unwrap(),
    );
    let engine = ExecutionEngine::new(EngineConfig::builtin(), HandlerRegistry::with_builtins());

    let result = engine.execute(graph).await;

    assert!(matches!(result, Err(EngineError::Bootstrap { ref node, .. }) if node == "a"));
}

/// Records which nodes it was asked to build instead of running anything
#[derive(Default)]
struct RecordingBootstrap {
    built: std::sync::Mutex<Vec<(String, String)>>,
}

#[async_trait::async_trait]
impl Bootstrap for RecordingBootstrap {
    async fn prepare(&self, node: &Node, build: &str) -> anyhow::Result<()> {
        self.built
            .lock()
            .unwrap()
            .push((node.id.clone(), build.to_string()));
        Ok(())
    }
}

#[tokio::test]
async fn custom_bootstrap_sees_only_nodes_with_a_build_step() {
    let graph = Arc::new(
        load_str(
            r#"{ "nodes": [
                { "id": "a", "path": "builtin:constant", "outputs": ["o"], "build": "make a" },
                { "id": "b", "path": "builtin:passthrough", "inputs": { "o": "a/o" }, "outputs": ["o"] }
            ] }"#,
        )
        .unwrap(),
    );
    let bootstrap = Arc::new(RecordingBootstrap::default());
    let engine = ExecutionEngine::new(EngineConfig::builtin(), HandlerRegistry::with_builtins())
        .with_bootstrap(Arc::clone(&bootstrap) as Arc<dyn Bootstrap>);

    let report = engine.execute(graph).await.unwrap();

    assert!(report.is_success());
    assert_eq!(
        *bootstrap.built.lock().unwrap(),
        vec![("a".to_string(), "make a".to_string())]
    );
}

#[cfg(unix)]
mod workers {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    // Worker scenarios share one test so no other test forks while a script
    // is still open for writing
    #[tokio::test]
    async fn worker_processes_speak_json_over_stdio() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "render.sh",
            r#"read -r request
echo "{\"clip\": {\"request\": $request, \"style\": \"$STYLE\"}}""#,
        );
        write_script(
            dir.path(),
            "broken.sh",
            "cat >/dev/null\necho 'renderer crashed' >&2\nexit 4",
        );
        write_script(dir.path(), "marker.sh", "cat >/dev/null\necho '{\"done\": true}'");
        write_script(
            dir.path(),
            "chatty.sh",
            r#"cat >/dev/null
echo '{"clip": 1, "thumb": 2, "debug": 3}'"#,
        );

        let graph = Arc::new(
            load_str(
                r#"{ "nodes": [
                    { "id": "seed", "path": "builtin:constant", "outputs": ["o"], "env": { "VALUE": "frame-1" } },
                    { "id": "render", "path": "render.sh", "inputs": { "frame": "seed/o" },
                      "outputs": ["clip"], "env": { "STYLE": "noir" } },
                    { "id": "broken", "path": "broken.sh", "inputs": { "frame": "seed/o" }, "outputs": ["clip"] },
                    { "id": "marker", "path": "marker.sh", "outputs": ["status"], "build": "touch built.flag" }
                ] }"#,
            )
            .unwrap(),
        );
        let engine = ExecutionEngine::new(
            EngineConfig::builtin().with_workdir(dir.path()),
            HandlerRegistry::with_builtins(),
        );

        let report = engine.execute(Arc::clone(&graph)).await.unwrap();

        assert!(dir.path().join("built.flag").exists());
        assert_eq!(
            report.node("render").unwrap().outputs["clip"],
            json!({ "request": { "frame": "frame-1" }, "style": "noir" })
        );

        let broken = report.node("broken").unwrap();
        assert_eq!(broken.state, ExecutionState::Failed);
        assert!(matches!(broken.reason, Some(FailureReason::Invocation { .. })));
        assert!(broken.error.as_deref().unwrap().contains("renderer crashed"));

        // Single-output worker printing its payload directly
        assert_eq!(
            report.node("marker").unwrap().outputs["status"],
            json!({ "done": true })
        );

        // A worker keying a port it never declared aborts the run
        let graph = Arc::new(
            load_str(
                r#"{ "nodes": [
                    { "id": "chatty", "path": "chatty.sh", "outputs": ["clip", "thumb"] }
                ] }"#,
            )
            .unwrap(),
        );
        let result = engine.execute(graph).await;

        assert!(matches!(
            result,
            Err(EngineError::Routing(RoutingError::UndeclaredOutput { ref node, ref port }))
                if node == "chatty" && port == "debug"
        ));
    }
}
