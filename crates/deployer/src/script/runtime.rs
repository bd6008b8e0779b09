//! QuickJS Runtime Wrapper
//!
//! One [`ScriptRuntime`] is created per invocation, so no script state can
//! leak between runs except through the host's explicit stores.

use std::sync::Arc;
use std::time::{Duration, Instant};

use deploy_runtime::{CancelSignal, ModuleSource};
use deploy_types::DeployError;
use rquickjs::{Context, Ctx, Function, Object, Runtime, Value as JsValue};
use serde::Deserialize;

use super::host::ScriptHost;

const PRELUDE: &str = include_str!("prelude.js");
const OUTCOME: &str = "__deployOutcome";

// ─────────────────────────────────────────────────────────────────────────────
// Script Module
// ─────────────────────────────────────────────────────────────────────────────

/// Exported entry points of a deploy script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    DeployFile,
    DeployWorkspace,
}

impl Entry {
    pub fn export_name(self) -> &'static str {
        match self {
            Entry::DeployFile => "deployFile",
            Entry::DeployWorkspace => "deployWorkspace",
        }
    }
}

/// The functions a loaded script exports, checked at the call site
pub struct ScriptModule<'js> {
    pub deploy_file: Option<Function<'js>>,
    pub deploy_workspace: Option<Function<'js>>,
}

impl<'js> ScriptModule<'js> {
    fn from_exports(exports: &JsValue<'js>) -> Self {
        let export = |name: &str| {
            exports
                .as_object()
                .and_then(|object| object.get::<_, JsValue>(name).ok())
                .and_then(JsValue::into_function)
        };

        Self {
            deploy_file: export(Entry::DeployFile.export_name()),
            deploy_workspace: export(Entry::DeployWorkspace.export_name()),
        }
    }

    fn entry(&self, entry: Entry) -> Option<&Function<'js>> {
        match entry {
            Entry::DeployFile => self.deploy_file.as_ref(),
            Entry::DeployWorkspace => self.deploy_workspace.as_ref(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outcome
// ─────────────────────────────────────────────────────────────────────────────

/// Error value a script rejected with
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ThrownError {
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
}

/// How an invocation settled
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// The entry point returned or its promise resolved
    Resolved { canceled: bool },
    /// It threw or its promise rejected; `None` when rejected without a value
    Rejected { error: Option<ThrownError> },
    /// The script does not export the requested entry point
    #[serde(skip)]
    MissingExport,
    /// Cancellation aborted the script before it settled
    #[serde(skip)]
    Interrupted,
}

// ─────────────────────────────────────────────────────────────────────────────
// Script Runtime
// ─────────────────────────────────────────────────────────────────────────────

/// How long a script may keep running after cancellation before it is
/// interrupted
pub const INTERRUPT_GRACE: Duration = Duration::from_millis(500);

/// Slice of a timer wait between cancellation checks
const WAIT_SLICE: Duration = Duration::from_millis(10);

/// Tracks how long cancellation has been pending
struct CancelWatch {
    cancel: CancelSignal,
    since: Option<Instant>,
}

impl CancelWatch {
    fn new(cancel: CancelSignal) -> Self {
        Self { cancel, since: None }
    }

    /// Whether the grace period after cancellation has run out
    fn expired(&mut self) -> bool {
        if !self.cancel.is_cancelled() {
            return false;
        }
        self.since.get_or_insert_with(Instant::now).elapsed() >= INTERRUPT_GRACE
    }
}

/// Whether the entry point was called
enum Started {
    Running,
    Missing,
    Interrupted,
}

/// A QuickJS runtime with the deploy prelude installed
pub struct ScriptRuntime {
    runtime: Runtime,
    context: Context,
    cancel: CancelSignal,
}

impl ScriptRuntime {
    /// Create a runtime whose `console`, `require` and state accessors are
    /// served by `host`
    ///
    /// Script code still running [`INTERRUPT_GRACE`] after the host's cancel
    /// signal fired is aborted.
    pub fn new(host: Arc<ScriptHost>) -> Result<Self, DeployError> {
        let runtime = Runtime::new().map_err(|e| DeployError::Runtime(e.to_string()))?;
        let context = Context::full(&runtime).map_err(|e| DeployError::Runtime(e.to_string()))?;

        let cancel = host.cancel().clone();
        let mut watch = CancelWatch::new(cancel.clone());
        runtime.set_interrupt_handler(Some(Box::new(move || watch.expired())));

        context.with(|ctx| {
            let install = || -> rquickjs::Result<()> {
                let host_object = host.to_js(&ctx)?;
                let prelude: Function = ctx.eval(PRELUDE)?;
                prelude.call::<_, ()>((host_object,))
            };
            install().map_err(|e| DeployError::Runtime(format!("script prelude failed: {}", describe(&ctx, e))))
        })?;

        Ok(Self {
            runtime,
            context,
            cancel,
        })
    }

    /// Load `module` as CommonJS and run its `entry` export with `request`
    ///
    /// `script` names the module in errors. Promise jobs and timers are
    /// driven until the entry point settles, nothing is left to run, or
    /// the script is interrupted after cancellation.
    pub fn invoke(
        &self,
        module: &ModuleSource,
        script: &str,
        entry: Entry,
        request: &serde_json::Value,
    ) -> Result<Outcome, DeployError> {
        let started = self.context.with(|ctx| -> Result<Started, DeployError> {
            let deploy: Object = ctx
                .globals()
                .get("__deploy")
                .map_err(|e| runtime_error(&ctx, e))?;

            let load: Function = deploy.get("load").map_err(|e| runtime_error(&ctx, e))?;
            let loaded: rquickjs::Result<JsValue> = load.call((
                module.path.to_string_lossy().into_owned(),
                module.directory.to_string_lossy().into_owned(),
                module.source.as_str(),
            ));
            let exports = match loaded {
                Ok(exports) => exports,
                Err(_) if self.cancel.is_cancelled() => {
                    ctx.catch();
                    return Ok(Started::Interrupted);
                }
                Err(e) => {
                    return Err(DeployError::ScriptLoad {
                        script: script.to_string(),
                        message: describe(&ctx, e),
                    });
                }
            };

            let exported = ScriptModule::from_exports(&exports);
            let Some(function) = exported.entry(entry) else {
                return Ok(Started::Missing);
            };

            let invoke: Function = deploy.get("invoke").map_err(|e| runtime_error(&ctx, e))?;
            match invoke.call::<_, ()>((function.clone(), request.to_string())) {
                Ok(()) => Ok(Started::Running),
                Err(_) if self.cancel.is_cancelled() => {
                    ctx.catch();
                    Ok(Started::Interrupted)
                }
                Err(e) => Err(runtime_error(&ctx, e)),
            }
        })?;

        match started {
            Started::Running => {}
            Started::Missing => return Ok(Outcome::MissingExport),
            Started::Interrupted => return Ok(Outcome::Interrupted),
        }

        let mut watch = CancelWatch::new(self.cancel.clone());
        loop {
            self.run_pending_jobs();

            if let Some(json) = self.outcome()? {
                return serde_json::from_str(&json)
                    .map_err(|e| DeployError::Runtime(format!("malformed script outcome: {e}")));
            }
            if watch.expired() {
                return Ok(Outcome::Interrupted);
            }

            let Some(delay) = self.next_timer()? else {
                if self.cancel.is_cancelled() {
                    return Ok(Outcome::Interrupted);
                }
                return Err(DeployError::Unsettled {
                    script: script.to_string(),
                });
            };
            if !self.wait(delay, &mut watch) {
                return Ok(Outcome::Interrupted);
            }
            self.run_timers()?;
        }
    }

    /// Drive promise jobs until the queue is empty
    fn run_pending_jobs(&self) {
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(_) => tracing::warn!("Pending script job raised an exception"),
            }
        }
    }

    /// The settled outcome as JSON, if the entry point settled
    fn outcome(&self) -> Result<Option<String>, DeployError> {
        self.context
            .with(|ctx| ctx.globals().get(OUTCOME).map_err(|e| runtime_error(&ctx, e)))
    }

    /// Delay until the earliest pending timer
    fn next_timer(&self) -> Result<Option<Duration>, DeployError> {
        self.context.with(|ctx| {
            let deploy: Object = ctx.globals().get("__deploy").map_err(|e| runtime_error(&ctx, e))?;
            let next: Function = deploy.get("nextTimer").map_err(|e| runtime_error(&ctx, e))?;
            let millis: f64 = next.call(()).map_err(|e| runtime_error(&ctx, e))?;
            Ok((millis >= 0.0).then(|| Duration::from_millis(millis as u64)))
        })
    }

    /// Sleep for `delay`; false when the cancel grace ran out first
    fn wait(&self, delay: Duration, watch: &mut CancelWatch) -> bool {
        let until = Instant::now() + delay;
        loop {
            if watch.expired() {
                return false;
            }
            let now = Instant::now();
            if now >= until {
                return true;
            }
            std::thread::sleep(WAIT_SLICE.min(until - now));
        }
    }

    fn run_timers(&self) -> Result<(), DeployError> {
        self.context.with(|ctx| {
            let deploy: Object = ctx.globals().get("__deploy").map_err(|e| runtime_error(&ctx, e))?;
            let run: Function = deploy.get("runTimers").map_err(|e| runtime_error(&ctx, e))?;
            match run.call::<_, ()>(()) {
                Ok(()) => Ok(()),
                // The next loop turn reports the interruption
                Err(_) if self.cancel.is_cancelled() => {
                    ctx.catch();
                    Ok(())
                }
                Err(e) => Err(runtime_error(&ctx, e)),
            }
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

fn runtime_error(ctx: &Ctx<'_>, error: rquickjs::Error) -> DeployError {
    DeployError::Runtime(describe(ctx, error))
}

/// Readable text for an error, including the thrown value of an exception
fn describe(ctx: &Ctx<'_>, error: rquickjs::Error) -> String {
    if !matches!(error, rquickjs::Error::Exception) {
        return error.to_string();
    }

    let thrown = ctx.catch();
    if let Some(object) = thrown.as_object() {
        let name: Option<String> = object.get("name").ok();
        let message: Option<String> = object.get("message").ok();
        match (name, message) {
            (Some(name), Some(message)) => return format!("{name}: {message}"),
            (None, Some(message)) => return message,
            _ => {}
        }
    }
    if let Some(text) = thrown.as_string().and_then(|s| s.to_string().ok()) {
        return text;
    }
    "uncaught exception".to_string()
}
