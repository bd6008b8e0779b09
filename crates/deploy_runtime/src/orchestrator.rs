//! Orchestrator
//!
//! Routes a deploy request to the plugin instance for each selected target
//! and aggregates the per-target outcomes into one [`DeployReport`].
//!
//! # Policy
//!
//! - One plugin instance per target type, created on first use
//! - Deploys against the same target are serialized (FIFO)
//! - Deploys against distinct targets run concurrently
//! - Every target runs under a child of the caller's cancel signal

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use chrono::Utc;
use dashmap::DashMap;
use deploy_types::{
    ConfigError, DeployConfig, DeployError, DeployReport, FileCompletion, PluginInfo,
    TargetDescriptor, TargetReport, WorkspaceCompletion,
};
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use uuid::Uuid;
use wildmatch::WildMatch;

use crate::cancel::CancelSignal;
use crate::context::DeployContext;
use crate::events::{GlobalEvent, ListenerId};
use crate::plugin::{DeployOptions, DeployPlugin, PluginRegistry, dispatch};

/// Emitted before any target starts: `[operation, [target names]]`
pub const EVENT_STARTED: &str = "deploy.started";
/// Emitted after every target completed: `[report]`
pub const EVENT_COMPLETED: &str = "deploy.completed";
/// Listened to by [`Orchestrator::listen`]: `[files, targets]`
pub const EVENT_DEPLOY_FILES: &str = "deploy.files";

#[derive(Clone, Copy)]
enum Request<'a> {
    File(&'a Path),
    Workspace(&'a [PathBuf]),
}

/// A target paired with the plugin instance that handles it
struct Selected {
    target: TargetDescriptor,
    plugin: Arc<dyn DeployPlugin>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Orchestrator
// ─────────────────────────────────────────────────────────────────────────────

/// Dispatches deploy requests to plugins
pub struct Orchestrator {
    context: Arc<DeployContext>,
    registry: PluginRegistry,
    config: RwLock<DeployConfig>,
    instances: DashMap<String, Arc<dyn DeployPlugin>>,
    target_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    session: CancelSignal,
    listener: Mutex<Option<ListenerId>>,
}

impl Orchestrator {
    /// Create an orchestrator with a fresh deploy context for `config`
    pub fn new(config: DeployConfig, registry: PluginRegistry) -> Self {
        let context = DeployContext::new_shared(config.root(), &config.module_paths);
        Self::with_context(context, config, registry)
    }

    /// Create an orchestrator around an existing context
    pub fn with_context(context: Arc<DeployContext>, config: DeployConfig, registry: PluginRegistry) -> Self {
        tracing::info!(
            root = %context.workspace_root().display(),
            targets = config.targets.len(),
            plugins = ?registry.types(),
            "Orchestrator created"
        );

        Self {
            context,
            registry,
            config: RwLock::new(config),
            instances: DashMap::new(),
            target_locks: DashMap::new(),
            session: CancelSignal::new(),
            listener: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &Arc<DeployContext> {
        &self.context
    }

    /// Configured targets, in configuration order
    pub fn targets(&self) -> Vec<TargetDescriptor> {
        self.config.read().targets.clone()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Deploy
    // ─────────────────────────────────────────────────────────────────────────

    /// Deploy one file to every target matched by `targets`
    ///
    /// An empty `targets` selects all configured targets. Configuration
    /// errors are returned before any target starts.
    pub async fn deploy_file(
        &self,
        file: &Path,
        targets: &[String],
        cancel: &CancelSignal,
    ) -> Result<DeployReport, DeployError> {
        self.run(Request::File(file), targets, cancel).await
    }

    /// Deploy a set of files to every target matched by `targets`
    pub async fn deploy_workspace(
        &self,
        files: &[PathBuf],
        targets: &[String],
        cancel: &CancelSignal,
    ) -> Result<DeployReport, DeployError> {
        self.run(Request::Workspace(files), targets, cancel).await
    }

    async fn run(
        &self,
        request: Request<'_>,
        targets: &[String],
        cancel: &CancelSignal,
    ) -> Result<DeployReport, DeployError> {
        let selected = self.resolve_targets(targets)?;
        let operation = Uuid::new_v4();
        let started_at = Utc::now();

        let names: Vec<&str> = selected.iter().map(|s| s.target.name.as_str()).collect();
        tracing::info!(%operation, targets = ?names, "Deploy started");
        self.context
            .emit_global(EVENT_STARTED, vec![json!(operation.to_string()), json!(names)]);

        // Child hooks are fired by the plugin boundary once the token trips
        let runs = selected
            .into_iter()
            .map(|selected| self.run_target(request, selected, cancel.child()));
        let reports = futures::future::join_all(runs).await;

        let report = DeployReport {
            operation,
            started_at,
            finished_at: Utc::now(),
            targets: reports,
        };

        tracing::info!(
            %operation,
            success = report.is_success(),
            canceled = report.was_canceled(),
            failed = report.failures().count(),
            "Deploy finished"
        );
        match serde_json::to_value(&report) {
            Ok(value) => {
                self.context.emit_global(EVENT_COMPLETED, vec![value]);
            }
            Err(e) => tracing::warn!(%operation, error = %e, "Could not encode deploy report"),
        }

        Ok(report)
    }

    async fn run_target(&self, request: Request<'_>, selected: Selected, cancel: CancelSignal) -> TargetReport {
        let Selected { target, plugin } = selected;
        let plugin_type = target.plugin_type.clone();
        let lock = self.target_lock(&target.name);

        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(target = %target.name, "Canceled before start");
                return canceled_report(request, &target);
            }
            guard = lock.lock() => guard,
        };

        let opts = DeployOptions::new(self.context.workspace_root()).with_cancel(cancel);

        match request {
            Request::File(file) => {
                let completion = dispatch::deploy_file(
                    plugin.as_ref(),
                    file,
                    &target,
                    &opts,
                    Some(Box::new(|info: &PluginInfo, c: &FileCompletion| {
                        tracing::debug!(
                            plugin = %info.plugin_type,
                            target = %c.target,
                            file = %c.file.display(),
                            canceled = c.canceled,
                            error = ?c.error,
                            "File deploy completed"
                        );
                    })),
                )
                .await;
                TargetReport::from_file(&plugin_type, completion)
            }
            Request::Workspace(files) => {
                let completion = dispatch::deploy_workspace(
                    plugin.as_ref(),
                    files,
                    &target,
                    &opts,
                    Some(Box::new(|info: &PluginInfo, c: &WorkspaceCompletion| {
                        tracing::debug!(
                            plugin = %info.plugin_type,
                            target = %c.target,
                            files = c.files.len(),
                            canceled = c.canceled,
                            error = ?c.error,
                            "Workspace deploy completed"
                        );
                    })),
                )
                .await;
                TargetReport::from_workspace(&plugin_type, completion)
            }
        }
    }

    /// Match target names/patterns against the configuration
    fn resolve_targets(&self, patterns: &[String]) -> Result<Vec<Selected>, DeployError> {
        let config = self.config.read();
        if config.targets.is_empty() {
            return Err(DeployError::NoTargets);
        }

        let mut chosen: Vec<&TargetDescriptor> = Vec::new();
        if patterns.is_empty() {
            chosen.extend(config.targets.iter());
        } else {
            for pattern in patterns {
                let matcher = WildMatch::new(pattern);
                let mut matched = false;
                for target in config.targets.iter().filter(|t| matcher.matches(&t.name)) {
                    matched = true;
                    if !chosen.iter().any(|c| c.name == target.name) {
                        chosen.push(target);
                    }
                }
                if !matched {
                    return Err(DeployError::UnknownTarget(pattern.clone()));
                }
            }
        }

        chosen
            .into_iter()
            .map(|target| -> Result<Selected, DeployError> {
                let plugin = self
                    .plugin(&target.plugin_type)
                    .ok_or_else(|| DeployError::UnknownPluginType {
                        target: target.name.clone(),
                        plugin_type: target.plugin_type.clone(),
                    })?;
                Ok(Selected {
                    target: target.clone(),
                    plugin,
                })
            })
            .collect()
    }

    /// The instance for a plugin type, created on first use
    fn plugin(&self, plugin_type: &str) -> Option<Arc<dyn DeployPlugin>> {
        if let Some(existing) = self.instances.get(plugin_type) {
            return Some(Arc::clone(existing.value()));
        }

        let created = self.registry.create(plugin_type, Arc::clone(&self.context))?;
        tracing::debug!(plugin = %plugin_type, "Plugin instance created");
        let entry = self.instances.entry(plugin_type.to_string()).or_insert(created);
        Some(Arc::clone(entry.value()))
    }

    fn target_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.target_locks.entry(name.to_string()).or_default().value())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Configuration
    // ─────────────────────────────────────────────────────────────────────────

    /// Replace the configuration and reset all plugin session state
    pub fn reload_config(&self, config: DeployConfig) -> Result<(), ConfigError> {
        config.validate()?;

        *self.config.write() = config.clone();
        self.context.modules().clear();

        let instances: Vec<Arc<dyn DeployPlugin>> =
            self.instances.iter().map(|e| Arc::clone(e.value())).collect();
        for instance in &instances {
            instance.on_config_reloaded(&config);
        }

        tracing::info!(
            targets = config.targets.len(),
            plugins = instances.len(),
            "Configuration reloaded"
        );
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Event-triggered deploys
    // ─────────────────────────────────────────────────────────────────────────

    /// Deploy whenever `deploy.files` is emitted on the context's bus
    ///
    /// Must be called from within a tokio runtime; deploys run as tasks on
    /// it and are canceled by [`Orchestrator::shutdown`].
    pub fn listen(self: &Arc<Self>) -> Result<ListenerId, DeployError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|e| DeployError::Runtime(e.to_string()))?;
        let weak: Weak<Self> = Arc::downgrade(self);

        let id = self.context.events().on(EVENT_DEPLOY_FILES, move |event: &GlobalEvent| {
            let Some(this) = weak.upgrade() else {
                return Ok(());
            };
            let files: Vec<PathBuf> = string_list(event.arg(0))
                .ok_or_else(|| anyhow::anyhow!("{EVENT_DEPLOY_FILES} expects a file or file list"))?
                .into_iter()
                .map(PathBuf::from)
                .collect();
            let targets = string_list(event.arg(1)).unwrap_or_default();

            handle.spawn(async move {
                let cancel = this.session.child();
                match this.deploy_workspace(&files, &targets, &cancel).await {
                    Ok(report) => {
                        tracing::info!(operation = %report.operation, success = report.is_success(), "Event deploy finished")
                    }
                    Err(e) => tracing::warn!(error = %e, "Event deploy rejected"),
                }
            });
            Ok(())
        });

        if let Some(previous) = self.listener.lock().replace(id) {
            self.context.events().off(previous);
        }
        Ok(id)
    }

    /// Stop reacting to `deploy.files`
    pub fn unlisten(&self) -> bool {
        match self.listener.lock().take() {
            Some(id) => self.context.events().off(id),
            None => false,
        }
    }

    /// End the session: cancel event-triggered deploys and drop all listeners
    pub fn shutdown(&self) {
        self.session.cancel();
        self.unlisten();
        self.context.close();
        tracing::info!("Orchestrator shut down");
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("context", &self.context)
            .field("registry", &self.registry)
            .field("instances", &self.instances.len())
            .finish()
    }
}

fn canceled_report(request: Request<'_>, target: &TargetDescriptor) -> TargetReport {
    match request {
        Request::File(file) => TargetReport::from_file(&target.plugin_type, FileCompletion::canceled(file, target)),
        Request::Workspace(files) => {
            let skipped = files.iter().map(|file| FileCompletion::canceled(file, target)).collect();
            TargetReport::from_workspace(&target.plugin_type, WorkspaceCompletion::from_files(target, skipped))
        }
    }
}

/// A string or an array of strings
fn string_list(value: Option<&Value>) -> Option<Vec<String>> {
    match value? {
        Value::String(s) => Some(vec![s.clone()]),
        Value::Array(items) => Some(items.iter().filter_map(Value::as_str).map(String::from).collect()),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Stub {
        calls: AtomicUsize,
        reloads: AtomicUsize,
        active: Mutex<HashMap<String, usize>>,
        max_active_per_target: AtomicUsize,
        delay_ms: u64,
        barrier: Option<Arc<tokio::sync::Barrier>>,
    }

    #[async_trait]
    impl DeployPlugin for Stub {
        fn info(&self) -> PluginInfo {
            PluginInfo::new("stub", "Test stub")
        }

        async fn deploy_file(&self, file: &Path, target: &TargetDescriptor, opts: &DeployOptions) -> FileCompletion {
            if opts.cancel.is_cancelled() {
                return FileCompletion::canceled(file, target);
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            {
                let mut active = self.active.lock();
                let count = active.entry(target.name.clone()).or_default();
                *count += 1;
                self.max_active_per_target.fetch_max(*count, Ordering::SeqCst);
            }

            let stopped = Arc::new(AtomicBool::new(false));
            let flag = stopped.clone();
            self.on_cancelling(Box::new(move || flag.store(true, Ordering::SeqCst)), opts);

            let mut outcome = FileCompletion::succeeded(file, target);
            if let Some(barrier) = &self.barrier {
                if tokio::time::timeout(Duration::from_secs(2), barrier.wait()).await.is_err() {
                    outcome = FileCompletion::failed(file, target, DeployError::Plugin("barrier timed out".into()));
                }
            }
            for _ in 0..(self.delay_ms / 5) {
                if stopped.load(Ordering::SeqCst) {
                    outcome = FileCompletion::canceled(file, target);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }

            *self.active.lock().entry(target.name.clone()).or_default() -= 1;
            outcome
        }

        fn on_config_reloaded(&self, _config: &DeployConfig) {
            self.reloads.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(targets: &[(&str, &str)]) -> DeployConfig {
        DeployConfig {
            targets: targets
                .iter()
                .map(|(name, plugin_type)| TargetDescriptor::new(*name, *plugin_type))
                .collect(),
            ..Default::default()
        }
    }

    fn orchestrator(stub: Arc<Stub>, targets: &[(&str, &str)]) -> Arc<Orchestrator> {
        let registry = PluginRegistry::new().with("stub", move |_| stub.clone() as Arc<dyn DeployPlugin>);
        Arc::new(Orchestrator::new(config(targets), registry))
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_configuration_errors_before_start() {
        let stub = Arc::new(Stub::default());
        let orch = orchestrator(stub.clone(), &[("a", "stub"), ("b", "ftp")]);
        let cancel = CancelSignal::new();

        let err = orch.deploy_file(Path::new("x"), &names(&["missing"]), &cancel).await.unwrap_err();
        assert_eq!(err, DeployError::UnknownTarget("missing".into()));

        let err = orch.deploy_file(Path::new("x"), &names(&["a", "b"]), &cancel).await.unwrap_err();
        assert!(matches!(err, DeployError::UnknownPluginType { ref plugin_type, .. } if plugin_type == "ftp"));
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);

        let empty = orchestrator(stub, &[]);
        let err = empty.deploy_file(Path::new("x"), &[], &cancel).await.unwrap_err();
        assert_eq!(err, DeployError::NoTargets);
    }

    #[tokio::test]
    async fn test_pattern_selects_targets() {
        let stub = Arc::new(Stub::default());
        let orch = orchestrator(stub.clone(), &[("prod-eu", "stub"), ("prod-us", "stub"), ("staging", "stub")]);

        let report = orch
            .deploy_file(Path::new("x"), &names(&["prod-*", "prod-eu"]), &CancelSignal::new())
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.targets.len(), 2);
        assert!(report.target("staging").is_none());
        assert_eq!(stub.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_same_target_is_serialized() {
        let stub = Arc::new(Stub {
            delay_ms: 30,
            ..Default::default()
        });
        let orch = orchestrator(stub.clone(), &[("a", "stub")]);
        let targets = names(&["a"]);
        let cancel = CancelSignal::new();

        let (first, second) = tokio::join!(
            orch.deploy_file(Path::new("1"), &targets, &cancel),
            orch.deploy_file(Path::new("2"), &targets, &cancel),
        );

        assert!(first.unwrap().is_success());
        assert!(second.unwrap().is_success());
        assert_eq!(stub.calls.load(Ordering::SeqCst), 2);
        assert_eq!(stub.max_active_per_target.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_targets_run_concurrently() {
        // Both targets must be inside the plugin at the same time to pass the barrier
        let stub = Arc::new(Stub {
            barrier: Some(Arc::new(tokio::sync::Barrier::new(2))),
            ..Default::default()
        });
        let orch = orchestrator(stub.clone(), &[("a", "stub"), ("b", "stub")]);

        let report = orch.deploy_file(Path::new("x"), &[], &CancelSignal::new()).await.unwrap();

        assert!(report.is_success(), "{:?}", report.failures().collect::<Vec<_>>());
        assert_eq!(report.targets.len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_reaches_in_flight_plugins() {
        let stub = Arc::new(Stub {
            delay_ms: 2_000,
            ..Default::default()
        });
        let orch = orchestrator(stub.clone(), &[("a", "stub"), ("b", "stub")]);
        let cancel = CancelSignal::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let report = orch.deploy_file(Path::new("x"), &[], &cancel).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(report.targets.iter().all(|t| t.canceled && t.error.is_none()));
        assert_eq!(stub.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reused_signal_keeps_no_hooks() {
        let stub = Arc::new(Stub::default());
        let orch = orchestrator(stub.clone(), &[("a", "stub"), ("b", "stub")]);
        let cancel = CancelSignal::new();

        for i in 0..5 {
            let report = orch.deploy_file(Path::new(&format!("{i}")), &[], &cancel).await.unwrap();
            assert!(report.is_success());
        }

        assert_eq!(cancel.pending_hooks(), 0);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_cancel_while_queued_skips_plugin() {
        let stub = Arc::new(Stub {
            delay_ms: 200,
            ..Default::default()
        });
        let orch = orchestrator(stub.clone(), &[("a", "stub")]);

        let first = {
            let orch = orch.clone();
            tokio::spawn(async move {
                orch.deploy_file(Path::new("1"), &["a".to_string()], &CancelSignal::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let cancel = CancelSignal::new();
        let second = {
            let orch = orch.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { orch.deploy_file(Path::new("2"), &["a".to_string()], &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let second = second.await.unwrap().unwrap();
        assert!(second.was_canceled());

        let first = first.await.unwrap().unwrap();
        assert!(first.is_success());
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reload_resets_instances() {
        let stub = Arc::new(Stub::default());
        let orch = orchestrator(stub.clone(), &[("a", "stub")]);

        orch.deploy_file(Path::new("x"), &[], &CancelSignal::new()).await.unwrap();
        orch.reload_config(config(&[("a", "stub"), ("c", "stub")])).unwrap();

        assert_eq!(stub.reloads.load(Ordering::SeqCst), 1);
        assert_eq!(orch.targets().len(), 2);

        let invalid = config(&[("a", "stub"), ("a", "stub")]);
        assert!(orch.reload_config(invalid).is_err());
        assert_eq!(orch.targets().len(), 2);
    }

    #[tokio::test]
    async fn test_lifecycle_events() {
        let stub = Arc::new(Stub::default());
        let orch = orchestrator(stub, &[("a", "stub")]);
        let seen = Arc::new(Mutex::new(Vec::new()));

        for name in [EVENT_STARTED, EVENT_COMPLETED] {
            let seen = seen.clone();
            orch.context().events().on(name, move |event| {
                seen.lock().push(event.clone());
                Ok(())
            });
        }

        let report = orch.deploy_file(Path::new("x"), &[], &CancelSignal::new()).await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].name, EVENT_STARTED);
        assert_eq!(seen[0].args[0], json!(report.operation.to_string()));
        assert_eq!(seen[0].args[1], json!(["a"]));
        assert_eq!(seen[1].name, EVENT_COMPLETED);
        assert_eq!(seen[1].args[0]["targets"][0]["target"], "a");
    }

    #[tokio::test]
    async fn test_deploy_files_event() {
        let stub = Arc::new(Stub::default());
        let orch = orchestrator(stub.clone(), &[("a", "stub"), ("b", "stub")]);
        orch.listen().unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        orch.context().events().on(EVENT_COMPLETED, move |event| {
            let _ = tx.send(event.args[0].clone());
            Ok(())
        });

        assert!(orch.context().emit_global(EVENT_DEPLOY_FILES, vec![json!(["x.txt", "y.txt"]), json!("a")]));

        let report = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report["targets"].as_array().unwrap().len(), 1);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 2);

        assert!(orch.unlisten());
        assert!(!orch.context().emit_global(EVENT_DEPLOY_FILES, vec![json!("z.txt")]));
    }

    #[tokio::test]
    async fn test_shutdown_clears_listeners() {
        let orch = orchestrator(Arc::new(Stub::default()), &[("a", "stub")]);
        orch.listen().unwrap();
        assert_eq!(orch.context().events().listener_count(EVENT_DEPLOY_FILES), 1);

        orch.shutdown();
        assert_eq!(orch.context().events().listener_count(EVENT_DEPLOY_FILES), 0);
    }
}
