// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Post-turn side effects
//!
//! After a successful turn the running app is reloaded, then its source tree
//! is archived as a new snapshot version and, when enabled, a web bundle is
//! exported for that version. Every step is recorded as a side-effect run.
//! Nothing here can fail the turn.

use std::sync::Arc;
use std::time::Duration;

use af_domain_types::{SideEffectKind, SideEffectRun};
use af_event_store::SideEffectLog;
use async_trait::async_trait;
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::object_store::{self, ObjectStore};
use crate::sandbox::{Sandbox, SandboxCommand};
use crate::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TriggerResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: None,
            error: Some(error.into()),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[async_trait]
pub trait ReloadTrigger: Send + Sync {
    async fn reload(&self, task_id: &str) -> TriggerResult;
}

/// POSTs to the bundler control endpoint
#[derive(Debug, Clone)]
pub struct HttpReloadTrigger {
    http_client: reqwest::Client,
    url: String,
}

impl HttpReloadTrigger {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ReloadTrigger for HttpReloadTrigger {
    async fn reload(&self, task_id: &str) -> TriggerResult {
        let response = self
            .http_client
            .post(&self.url)
            .json(&json!({ "task_id": task_id, "action": "reload" }))
            .send()
            .await;
        match response {
            Ok(r) if r.status().is_success() => TriggerResult::ok(),
            Ok(r) => TriggerResult::failed(format!("reload endpoint returned {}", r.status())),
            Err(e) => TriggerResult::failed(e.to_string()),
        }
    }
}

/// Used when no bundler control endpoint is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReloadTrigger;

#[async_trait]
impl ReloadTrigger for NoopReloadTrigger {
    async fn reload(&self, _task_id: &str) -> TriggerResult {
        TriggerResult::ok().with_detail("no reload endpoint configured")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub task_id: String,
    pub owner_id: String,
    pub source_dir: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotReceipt {
    pub success: bool,
    pub version: Option<u64>,
    pub file_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SnapshotReceipt {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait SnapshotTrigger: Send + Sync {
    async fn snapshot(&self, sandbox: &dyn Sandbox, request: SnapshotRequest) -> SnapshotReceipt;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleRequest {
    pub task_id: String,
    pub owner_id: String,
    pub working_dir: String,
    /// Snapshot version the bundle belongs to
    pub version: u64,
}

#[async_trait]
pub trait BundleExporter: Send + Sync {
    async fn export(&self, sandbox: &dyn Sandbox, request: BundleRequest) -> TriggerResult;
}

/// Gzip-compressed tar of `(relative path, contents)` pairs
pub async fn build_archive(files: Vec<(String, Vec<u8>)>) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let mtime = Utc::now().timestamp().max(0) as u64;
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (path, contents) in &files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(mtime);
            header.set_cksum();
            builder.append_data(&mut header, path, contents.as_slice())?;
        }
        let encoder = builder.into_inner()?;
        Ok(encoder.finish()?)
    })
    .await
    .map_err(|e| Error::ObjectStore(format!("archive task failed: {}", e)))?
}

async fn collect_files(
    sandbox: &dyn Sandbox,
    root: &str,
    excludes: &[String],
) -> Result<Vec<(String, Vec<u8>)>> {
    let root = root.trim_end_matches('/');
    let mut files = Vec::new();
    for rel in sandbox.list_files(root, excludes).await? {
        let contents = sandbox.read_file(&format!("{}/{}", root, rel)).await?;
        files.push((rel, contents));
    }
    Ok(files)
}

#[derive(Debug, Deserialize)]
struct LatestPointer {
    version: u64,
}

/// Versioned tarball snapshots in the object store
///
/// Layout: `snapshots/<owner>/<task>/v<N>.tar.gz` plus a `latest.json`
/// pointer written after the archive.
pub struct ArchiveSnapshotter {
    store: Arc<dyn ObjectStore>,
    excludes: Vec<String>,
}

impl ArchiveSnapshotter {
    pub fn new(store: Arc<dyn ObjectStore>, excludes: Vec<String>) -> Self {
        Self { store, excludes }
    }

    async fn next_version(&self, prefix: &str) -> Result<u64> {
        let latest = self.store.get(&format!("{}/latest.json", prefix)).await?;
        Ok(match latest {
            Some(bytes) => serde_json::from_slice::<LatestPointer>(&bytes)?.version + 1,
            None => 1,
        })
    }

    async fn try_snapshot(
        &self,
        sandbox: &dyn Sandbox,
        request: &SnapshotRequest,
    ) -> Result<SnapshotReceipt> {
        let files = collect_files(sandbox, &request.source_dir, &self.excludes).await?;
        let file_count = files.len();
        let archive = build_archive(files).await?;

        let prefix = format!("snapshots/{}/{}", request.owner_id, request.task_id);
        let version = self.next_version(&prefix).await?;
        self.store
            .put(
                &format!("{}/v{}.tar.gz", prefix, version),
                archive,
                "application/gzip",
            )
            .await?;
        let pointer = json!({
            "version": version,
            "file_count": file_count,
            "description": request.description,
            "created_at": Utc::now(),
        });
        self.store
            .put(
                &format!("{}/latest.json", prefix),
                serde_json::to_vec(&pointer)?,
                "application/json",
            )
            .await?;

        Ok(SnapshotReceipt {
            success: true,
            version: Some(version),
            file_count,
            error: None,
        })
    }
}

#[async_trait]
impl SnapshotTrigger for ArchiveSnapshotter {
    async fn snapshot(&self, sandbox: &dyn Sandbox, request: SnapshotRequest) -> SnapshotReceipt {
        match self.try_snapshot(sandbox, &request).await {
            Ok(receipt) => receipt,
            Err(e) => SnapshotReceipt::failed(e.to_string()),
        }
    }
}

/// Runs the web export in the sandbox and uploads its output
pub struct SandboxBundleExporter {
    store: Arc<dyn ObjectStore>,
    command: String,
    output_dir: String,
}

impl SandboxBundleExporter {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        command: impl Into<String>,
        output_dir: impl Into<String>,
    ) -> Self {
        Self {
            store,
            command: command.into(),
            output_dir: output_dir.into(),
        }
    }

    async fn try_export(&self, sandbox: &dyn Sandbox, request: &BundleRequest) -> Result<String> {
        let output = sandbox
            .run(SandboxCommand::new(self.command.clone()).cwd(request.working_dir.clone()))
            .await?;
        if !output.success() {
            return Err(Error::sandbox(format!(
                "export exited with {:?}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        let root = format!(
            "{}/{}",
            request.working_dir.trim_end_matches('/'),
            self.output_dir
        );
        let files = collect_files(sandbox, &root, &[]).await?;
        if files.is_empty() {
            return Err(Error::sandbox(format!("export produced no files in {}", root)));
        }
        let archive = build_archive(files).await?;
        let key = format!(
            "bundles/{}/{}/v{}.tar.gz",
            request.owner_id, request.task_id, request.version
        );
        self.store.put(&key, archive, "application/gzip").await?;
        Ok(key)
    }
}

#[async_trait]
impl BundleExporter for SandboxBundleExporter {
    async fn export(&self, sandbox: &dyn Sandbox, request: BundleRequest) -> TriggerResult {
        match self.try_export(sandbox, &request).await {
            Ok(key) => TriggerResult::ok().with_detail(key),
            Err(e) => TriggerResult::failed(e.to_string()),
        }
    }
}

/// Context a side-effect run needs about its turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideEffectContext {
    pub task_id: String,
    pub owner_id: String,
    pub working_dir: String,
    pub description: Option<String>,
}

/// Reload, snapshot and bundle export in order, each recorded
#[derive(Clone)]
pub struct SideEffects {
    reload: Arc<dyn ReloadTrigger>,
    snapshot: Arc<dyn SnapshotTrigger>,
    bundle: Option<Arc<dyn BundleExporter>>,
    log: Arc<dyn SideEffectLog>,
}

impl SideEffects {
    pub fn new(
        reload: Arc<dyn ReloadTrigger>,
        snapshot: Arc<dyn SnapshotTrigger>,
        log: Arc<dyn SideEffectLog>,
    ) -> Self {
        Self {
            reload,
            snapshot,
            bundle: None,
            log,
        }
    }

    pub fn with_bundle_exporter(mut self, exporter: Arc<dyn BundleExporter>) -> Self {
        self.bundle = Some(exporter);
        self
    }

    /// Triggers described by the configuration
    pub fn from_config(config: &PipelineConfig, log: Arc<dyn SideEffectLog>) -> Result<Self> {
        let reload: Arc<dyn ReloadTrigger> = match &config.reload.url {
            Some(url) => Arc::new(HttpReloadTrigger::new(
                url.clone(),
                Duration::from_secs(config.reload.timeout_secs.unwrap_or(10)),
            )?),
            None => Arc::new(NoopReloadTrigger),
        };
        let store = object_store::from_config(&config.object_store)?;
        let snapshot = Arc::new(ArchiveSnapshotter::new(
            Arc::clone(&store),
            config.snapshot.excludes.clone(),
        ));
        let mut effects = Self::new(reload, snapshot, log);
        if config.bundle.enabled {
            effects = effects.with_bundle_exporter(Arc::new(SandboxBundleExporter::new(
                store,
                config.bundle.command.clone(),
                config.bundle.output_dir.clone(),
            )));
        }
        Ok(effects)
    }

    async fn record(&self, run: SideEffectRun, runs: &mut Vec<SideEffectRun>) {
        if let Err(e) = self.log.record(&run).await {
            warn!(
                task_id = %run.task_id,
                kind = %run.kind.as_str(),
                "Failed to record side-effect run: {}",
                e
            );
        }
        runs.push(run);
    }

    /// Run every trigger once; never fails
    pub async fn run_after_success(
        &self,
        sandbox: &dyn Sandbox,
        ctx: &SideEffectContext,
    ) -> Vec<SideEffectRun> {
        let task_id = ctx.task_id.as_str();
        let mut runs = Vec::new();

        self.record(SideEffectRun::started(task_id, SideEffectKind::Reload), &mut runs)
            .await;
        let reload = self.reload.reload(task_id).await;
        let run = if reload.success {
            info!(task_id, "App reloaded");
            SideEffectRun::completed(task_id, SideEffectKind::Reload, reload.detail)
        } else {
            let error = reload.error.unwrap_or_else(|| "reload failed".into());
            warn!(task_id, "Reload failed: {}", error);
            SideEffectRun::failed(task_id, SideEffectKind::Reload, error)
        };
        self.record(run, &mut runs).await;

        self.record(SideEffectRun::started(task_id, SideEffectKind::Snapshot), &mut runs)
            .await;
        let receipt = self
            .snapshot
            .snapshot(
                sandbox,
                SnapshotRequest {
                    task_id: ctx.task_id.clone(),
                    owner_id: ctx.owner_id.clone(),
                    source_dir: ctx.working_dir.clone(),
                    description: ctx.description.clone(),
                },
            )
            .await;
        let version = match (receipt.success, receipt.version) {
            (true, version) => {
                info!(task_id, ?version, files = receipt.file_count, "Snapshot stored");
                let detail = version.map(|v| format!("v{} ({} files)", v, receipt.file_count));
                self.record(
                    SideEffectRun::completed(task_id, SideEffectKind::Snapshot, detail),
                    &mut runs,
                )
                .await;
                version
            }
            (false, _) => {
                let error = receipt.error.unwrap_or_else(|| "snapshot failed".into());
                warn!(task_id, "Snapshot failed: {}", error);
                self.record(
                    SideEffectRun::failed(task_id, SideEffectKind::Snapshot, error),
                    &mut runs,
                )
                .await;
                None
            }
        };

        if let (Some(exporter), Some(version)) = (&self.bundle, version) {
            self.record(
                SideEffectRun::started(task_id, SideEffectKind::BundleExport),
                &mut runs,
            )
            .await;
            let result = exporter
                .export(
                    sandbox,
                    BundleRequest {
                        task_id: ctx.task_id.clone(),
                        owner_id: ctx.owner_id.clone(),
                        working_dir: ctx.working_dir.clone(),
                        version,
                    },
                )
                .await;
            let run = if result.success {
                SideEffectRun::completed(task_id, SideEffectKind::BundleExport, result.detail)
            } else {
                let error = result.error.unwrap_or_else(|| "bundle export failed".into());
                warn!(task_id, "Bundle export failed: {}", error);
                SideEffectRun::failed(task_id, SideEffectKind::BundleExport, error)
            };
            self.record(run, &mut runs).await;
        }

        runs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::FsObjectStore;
    use crate::testing::{CountingReload, ScriptedSandbox};
    use af_domain_types::RunStatus;
    use af_event_store::MemoryStore;
    use flate2::read::GzDecoder;

    fn sandbox_with_app() -> ScriptedSandbox {
        ScriptedSandbox::new()
            .with_file("/app/App.tsx", "export default function App() {}")
            .with_file("/app/src/Home.tsx", "export const Home = () => null;")
            .with_file("/app/node_modules/react/index.js", "module.exports = {}")
            .with_file("/app/.git/HEAD", "ref: refs/heads/main")
    }

    fn request() -> SnapshotRequest {
        SnapshotRequest {
            task_id: "task-1".into(),
            owner_id: "owner-1".into(),
            source_dir: "/app".into(),
            description: Some("login screen".into()),
        }
    }

    #[tokio::test]
    async fn test_snapshot_versions_increase_and_skip_excludes() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(FsObjectStore::new(dir.path()));
        let snapshotter = ArchiveSnapshotter::new(
            store.clone(),
            crate::config::SnapshotConfig::default().excludes,
        );
        let sandbox = sandbox_with_app();

        let first = snapshotter.snapshot(&sandbox, request()).await;
        assert!(first.success, "{:?}", first.error);
        assert_eq!(first.version, Some(1));
        assert_eq!(first.file_count, 2);
        let second = snapshotter.snapshot(&sandbox, request()).await;
        assert_eq!(second.version, Some(2));

        let archive = store
            .get("snapshots/owner-1/task-1/v2.tar.gz")
            .await
            .unwrap()
            .unwrap();
        let mut tar = tar::Archive::new(GzDecoder::new(archive.as_slice()));
        let mut names: Vec<String> = tar
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["App.tsx".to_string(), "src/Home.tsx".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_reload_does_not_stop_snapshot() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(FsObjectStore::new(dir.path()));
        let log = Arc::new(MemoryStore::new());
        let reload = Arc::new(CountingReload::failing("bundler not running"));
        let effects = SideEffects::new(
            reload.clone(),
            Arc::new(ArchiveSnapshotter::new(store, Vec::new())),
            log.clone(),
        );
        let ctx = SideEffectContext {
            task_id: "task-1".into(),
            owner_id: "owner-1".into(),
            working_dir: "/app".into(),
            description: None,
        };

        let runs = effects.run_after_success(&sandbox_with_app(), &ctx).await;
        let summary: Vec<(SideEffectKind, RunStatus)> =
            runs.iter().map(|r| (r.kind, r.status)).collect();
        assert_eq!(
            summary,
            vec![
                (SideEffectKind::Reload, RunStatus::Started),
                (SideEffectKind::Reload, RunStatus::Failed),
                (SideEffectKind::Snapshot, RunStatus::Started),
                (SideEffectKind::Snapshot, RunStatus::Completed),
            ]
        );
        assert_eq!(reload.calls(), 1);
        assert_eq!(log.list_runs("task-1").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_bundle_export_uploads_output_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(FsObjectStore::new(dir.path()));
        let exporter = SandboxBundleExporter::new(store.clone(), "npx expo export", "dist");
        let sandbox = sandbox_with_app().with_file("/app/dist/index.html", "<html></html>");

        let result = exporter
            .export(
                &sandbox,
                BundleRequest {
                    task_id: "task-1".into(),
                    owner_id: "owner-1".into(),
                    working_dir: "/app".into(),
                    version: 3,
                },
            )
            .await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.detail.as_deref(), Some("bundles/owner-1/task-1/v3.tar.gz"));
        assert!(store
            .get("bundles/owner-1/task-1/v3.tar.gz")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_bundle_export_without_output_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let exporter = SandboxBundleExporter::new(
            Arc::new(FsObjectStore::new(dir.path())),
            "npx expo export",
            "dist",
        );
        let result = exporter
            .export(
                &sandbox_with_app(),
                BundleRequest {
                    task_id: "task-1".into(),
                    owner_id: "owner-1".into(),
                    working_dir: "/app".into(),
                    version: 1,
                },
            )
            .await;
        assert!(!result.success);
    }
}
