//! Plugin Boundary
//!
//! Calls into a plugin always go through these functions. They guarantee that
//! the completion is produced exactly once and that a panicking plugin turns
//! into a failed completion. An operation cancelled before it starts never
//! reaches the plugin. Once started, `onCancelling` hooks run as soon as
//! cancellation is requested.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};

use deploy_types::{DeployError, FileCompletion, TargetDescriptor, WorkspaceCompletion};
use futures::{FutureExt, StreamExt, stream};

use super::{DeployOptions, DeployPlugin, OnCompleted};
use crate::cancel::CancelSignal;

/// Deploy one file through the plugin boundary
pub async fn deploy_file<P: DeployPlugin + ?Sized>(
    plugin: &P,
    file: &Path,
    target: &TargetDescriptor,
    opts: &DeployOptions,
    on_completed: Option<OnCompleted<FileCompletion>>,
) -> FileCompletion {
    if opts.cancel.is_cancelled() {
        let completion = FileCompletion::canceled(file, target);
        deliver(plugin, on_completed, &completion);
        return completion;
    }

    let work = AssertUnwindSafe(plugin.deploy_file(file, target, opts)).catch_unwind();

    let completion = match watch_cancellation(work, &opts.cancel).await {
        Ok(completion) => completion,
        Err(panic) => {
            let message = panic_message(panic);
            tracing::error!(target = %target.name, file = %file.display(), %message, "Plugin panicked");
            FileCompletion::failed(file, target, DeployError::Panicked(message))
        }
    };

    deliver(plugin, on_completed, &completion);
    completion
}

/// Deploy a set of files through the plugin boundary
pub async fn deploy_workspace<P: DeployPlugin + ?Sized>(
    plugin: &P,
    files: &[PathBuf],
    target: &TargetDescriptor,
    opts: &DeployOptions,
    on_completed: Option<OnCompleted<WorkspaceCompletion>>,
) -> WorkspaceCompletion {
    if opts.cancel.is_cancelled() {
        let skipped = files.iter().map(|file| FileCompletion::canceled(file, target)).collect();
        let completion = WorkspaceCompletion::from_files(target, skipped);
        deliver(plugin, on_completed, &completion);
        return completion;
    }

    let work = AssertUnwindSafe(plugin.deploy_workspace(files, target, opts)).catch_unwind();

    let completion = match watch_cancellation(work, &opts.cancel).await {
        Ok(completion) => completion,
        Err(panic) => {
            let message = panic_message(panic);
            tracing::error!(target = %target.name, %message, "Plugin panicked");
            WorkspaceCompletion::failed(target, DeployError::Panicked(message))
        }
    };

    deliver(plugin, on_completed, &completion);
    completion
}

/// Default workspace strategy: one `deploy_file` per file
///
/// Runs up to `max_parallel_files` files at once. Every file is attempted
/// even when an earlier one failed; files not yet started when cancellation
/// is observed complete as canceled. Returns only after every file has
/// completed.
pub async fn deploy_each_file<P: DeployPlugin + ?Sized>(
    plugin: &P,
    files: &[PathBuf],
    target: &TargetDescriptor,
    opts: &DeployOptions,
) -> WorkspaceCompletion {
    let parallel = plugin.max_parallel_files().max(1);

    let completions: Vec<FileCompletion> = stream::iter(0..files.len())
        .map(move |i| {
            let file = &files[i];
            async move {
                let completion = if opts.cancel.is_cancelled() {
                    FileCompletion::canceled(file, target)
                } else {
                    if let Some(hook) = &opts.on_before_deploy_file {
                        hook(file, target);
                    }
                    deploy_file(plugin, file, target, opts, None).await
                };

                if let Some(hook) = &opts.on_file_completed {
                    hook(&completion);
                }
                completion
            }
        })
        .buffered(parallel)
        .collect()
        .await;

    let completion = WorkspaceCompletion::from_files(target, completions);
    tracing::debug!(
        target = %target.name,
        files = files.len(),
        failed = completion.files.iter().filter(|f| f.error.is_some()).count(),
        canceled = completion.canceled,
        "Workspace deploy aggregated"
    );
    completion
}

/// Await `work`, firing the cancel hooks the moment cancellation arrives
async fn watch_cancellation<F: Future>(work: F, cancel: &CancelSignal) -> F::Output {
    tokio::pin!(work);
    tokio::select! {
        biased;
        output = &mut work => output,
        _ = cancel.cancelled() => {
            cancel.fire_hooks();
            work.await
        }
    }
}

fn deliver<P: DeployPlugin + ?Sized, T>(plugin: &P, on_completed: Option<OnCompleted<T>>, completion: &T) {
    let Some(callback) = on_completed else {
        return;
    };

    let info = plugin.info();
    if std::panic::catch_unwind(AssertUnwindSafe(|| callback(&info, completion))).is_err() {
        tracing::warn!(plugin = %info.plugin_type, "Completion callback panicked");
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use deploy_types::PluginInfo;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Fails on files named in `fail`, panics on files named in `panic`
    #[derive(Default)]
    struct RecordingPlugin {
        attempted: Mutex<Vec<PathBuf>>,
        fail: Vec<&'static str>,
        panic: Vec<&'static str>,
        parallel: usize,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    #[async_trait]
    impl DeployPlugin for RecordingPlugin {
        fn info(&self) -> PluginInfo {
            PluginInfo::new("recording", "Records attempted files")
        }

        async fn deploy_file(
            &self,
            file: &Path,
            target: &TargetDescriptor,
            opts: &DeployOptions,
        ) -> FileCompletion {
            if opts.cancel.is_cancelled() {
                return FileCompletion::canceled(file, target);
            }
            self.attempted.lock().push(file.to_path_buf());

            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            let name = file.to_string_lossy();
            if self.panic.iter().any(|p| *p == name) {
                panic!("exploded on {name}");
            }
            if self.fail.iter().any(|f| *f == name) {
                return FileCompletion::failed(file, target, DeployError::Plugin(format!("cannot deploy {name}")));
            }
            FileCompletion::succeeded(file, target)
        }

        fn max_parallel_files(&self) -> usize {
            self.parallel
        }
    }

    fn files(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    #[tokio::test]
    async fn test_completion_callback_fires_once() {
        let plugin = RecordingPlugin::default();
        let target = TargetDescriptor::new("t", "recording");
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        let completion = deploy_file(
            &plugin,
            Path::new("a.txt"),
            &target,
            &DeployOptions::new("/work"),
            Some(Box::new(move |info: &PluginInfo, completion: &FileCompletion| {
                assert_eq!(info.plugin_type, "recording");
                assert!(completion.is_success());
                c.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .await;

        assert!(completion.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panic_becomes_failed_completion() {
        let plugin = RecordingPlugin {
            panic: vec!["boom.txt"],
            ..Default::default()
        };
        let target = TargetDescriptor::new("t", "recording");
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        let completion = deploy_file(
            &plugin,
            Path::new("boom.txt"),
            &target,
            &DeployOptions::new("/work"),
            Some(Box::new(move |_: &PluginInfo, _: &FileCompletion| {
                c.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .await;

        assert!(matches!(completion.error, Some(DeployError::Panicked(ref msg)) if msg.contains("boom.txt")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_default_aggregation_attempts_every_file() {
        let plugin = RecordingPlugin {
            fail: vec!["2.txt"],
            ..Default::default()
        };
        let target = TargetDescriptor::new("t", "recording");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        let opts = DeployOptions::new("/work").on_file_completed(move |c| s.lock().push(c.file.clone()));

        let completion = deploy_workspace(
            &plugin,
            &files(&["1.txt", "2.txt", "3.txt", "4.txt"]),
            &target,
            &opts,
            None,
        )
        .await;

        assert_eq!(plugin.attempted.lock().len(), 4);
        assert_eq!(seen.lock().len(), 4);
        assert!(matches!(completion.error, Some(DeployError::Plugin(ref m)) if m.contains("2.txt")));
        assert!(completion.files[0].is_success());
        assert!(completion.files[2].is_success());
    }

    #[tokio::test]
    async fn test_parallel_policy_is_respected() {
        let plugin = RecordingPlugin {
            parallel: 2,
            ..Default::default()
        };
        let target = TargetDescriptor::new("t", "recording");

        let completion = deploy_workspace(
            &plugin,
            &files(&["a", "b", "c", "d", "e"]),
            &target,
            &DeployOptions::new("/work"),
            None,
        )
        .await;

        assert!(completion.is_success());
        assert_eq!(completion.files.len(), 5);
        assert!(plugin.max_active.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_cancel_before_start_runs_no_plugin_code() {
        let plugin = RecordingPlugin::default();
        let target = TargetDescriptor::new("t", "recording");
        let opts = DeployOptions::new("/work");
        opts.cancel.cancel();

        let completion = deploy_workspace(&plugin, &files(&["a", "b"]), &target, &opts, None).await;

        assert!(completion.canceled);
        assert!(completion.error.is_none());
        assert!(plugin.attempted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_operation_never_reaches_plugin() {
        /// Ignores cancellation entirely
        #[derive(Default)]
        struct CountingPlugin {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl DeployPlugin for CountingPlugin {
            fn info(&self) -> PluginInfo {
                PluginInfo::new("counting", "Counts calls")
            }

            async fn deploy_file(
                &self,
                file: &Path,
                target: &TargetDescriptor,
                _opts: &DeployOptions,
            ) -> FileCompletion {
                self.calls.fetch_add(1, Ordering::SeqCst);
                FileCompletion::succeeded(file, target)
            }

            async fn deploy_workspace(
                &self,
                _files: &[PathBuf],
                target: &TargetDescriptor,
                _opts: &DeployOptions,
            ) -> WorkspaceCompletion {
                self.calls.fetch_add(1, Ordering::SeqCst);
                WorkspaceCompletion::succeeded(target)
            }
        }

        let plugin = CountingPlugin::default();
        let target = TargetDescriptor::new("t", "counting");
        let opts = DeployOptions::new("/work");
        opts.cancel.cancel();

        let delivered = Arc::new(AtomicUsize::new(0));
        let d = delivered.clone();
        let file = deploy_file(
            &plugin,
            Path::new("a"),
            &target,
            &opts,
            Some(Box::new(move |_: &PluginInfo, c: &FileCompletion| {
                assert!(c.canceled);
                d.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .await;
        let workspace = deploy_workspace(&plugin, &files(&["a", "b"]), &target, &opts, None).await;

        assert_eq!(plugin.calls.load(Ordering::SeqCst), 0);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert!(file.canceled && file.error.is_none());
        assert!(workspace.canceled && workspace.error.is_none());
        assert_eq!(workspace.files.len(), 2);
    }

    #[tokio::test]
    async fn test_before_hook_fires_per_started_file() {
        let plugin = RecordingPlugin::default();
        let target = TargetDescriptor::new("t", "recording");
        let started = Arc::new(Mutex::new(Vec::new()));

        let cancel = crate::CancelSignal::new();
        let s = started.clone();
        let trigger = cancel.clone();
        let opts = DeployOptions::new("/work")
            .with_cancel(cancel)
            .on_before_deploy_file(move |file, target| {
                assert_eq!(target.name, "t");
                s.lock().push(file.to_path_buf());
                if file == Path::new("b") {
                    trigger.cancel();
                }
            });

        let completion = deploy_workspace(&plugin, &files(&["a", "b", "c"]), &target, &opts, None).await;

        assert_eq!(*started.lock(), files(&["a", "b"]));
        assert_eq!(*plugin.attempted.lock(), files(&["a"]));
        assert!(completion.canceled);
        assert!(completion.files[0].is_success());
        assert!(completion.files[1].canceled);
        assert!(completion.files[2].canceled);
    }

    #[tokio::test]
    async fn test_hooks_fire_while_plugin_works() {
        struct SlowPlugin {
            flag: Arc<AtomicBool>,
        }

        #[async_trait]
        impl DeployPlugin for SlowPlugin {
            fn info(&self) -> PluginInfo {
                PluginInfo::new("slow", "Waits for cancellation")
            }

            async fn deploy_file(
                &self,
                file: &Path,
                target: &TargetDescriptor,
                opts: &DeployOptions,
            ) -> FileCompletion {
                let flag = self.flag.clone();
                self.on_cancelling(Box::new(move || flag.store(true, Ordering::SeqCst)), opts);

                for _ in 0..200 {
                    if self.flag.load(Ordering::SeqCst) {
                        return FileCompletion::canceled(file, target);
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                FileCompletion::succeeded(file, target)
            }
        }

        let plugin = SlowPlugin {
            flag: Arc::new(AtomicBool::new(false)),
        };
        let target = TargetDescriptor::new("t", "slow");
        let parent = crate::CancelSignal::new();
        let opts = DeployOptions::new("/work").with_cancel(parent.child());

        let canceller = parent.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let completion = deploy_file(&plugin, Path::new("a"), &target, &opts, None).await;
        assert!(completion.canceled);
        assert!(completion.error.is_none());
    }
}
