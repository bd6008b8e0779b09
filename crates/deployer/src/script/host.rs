//! Script Host Functions
//!
//! Rust functions exposed to the prelude as its `host` object. Everything
//! crosses the boundary as strings; structured values are JSON, and the
//! empty string stands for `undefined`.

use std::path::PathBuf;
use std::sync::Arc;

use deploy_runtime::{CancelSignal, DeployContext, SessionState};
use rquickjs::{Ctx, Function, Object, Result as JsResult};
use serde_json::{Value, json};

/// Log target for script `console` output
pub const SCRIPT_LOG_TARGET: &str = "deployer.script";

/// Capabilities of one script invocation
pub struct ScriptHost {
    context: Arc<DeployContext>,
    state: Arc<SessionState>,
    /// Resolved script path, the key of the module state
    script: PathBuf,
    cancel: CancelSignal,
}

impl ScriptHost {
    pub fn new(
        context: Arc<DeployContext>,
        state: Arc<SessionState>,
        script: PathBuf,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            context,
            state,
            script,
            cancel,
        }
    }

    pub fn context(&self) -> &Arc<DeployContext> {
        &self.context
    }

    pub fn cancel(&self) -> &CancelSignal {
        &self.cancel
    }

    /// Build the `host` object handed to the prelude
    pub fn to_js<'js>(self: &Arc<Self>, ctx: &Ctx<'js>) -> JsResult<Object<'js>> {
        let object = Object::new(ctx.clone())?;

        let host = Arc::clone(self);
        object.set(
            "log",
            Function::new(ctx.clone(), move |level: String, message: String| host.log(&level, &message))?,
        )?;

        let host = Arc::clone(self);
        object.set(
            "require",
            Function::new(ctx.clone(), move |id: String, dir: String| host.require(&id, &dir))?,
        )?;

        let host = Arc::clone(self);
        object.set(
            "getState",
            Function::new(ctx.clone(), move || encode(host.state.module(&host.script).as_ref()))?,
        )?;

        let host = Arc::clone(self);
        object.set(
            "setState",
            Function::new(ctx.clone(), move |text: String| match decode(&text) {
                Some(value) => host.state.set_module(&host.script, value),
                None => {
                    host.state.remove_module(&host.script);
                }
            })?,
        )?;

        let host = Arc::clone(self);
        object.set(
            "getGlobalState",
            Function::new(ctx.clone(), move || encode(Some(&host.state.global())))?,
        )?;

        let host = Arc::clone(self);
        object.set(
            "setGlobalState",
            Function::new(ctx.clone(), move |text: String| {
                host.state.set_global(decode(&text).unwrap_or_else(|| json!({})))
            })?,
        )?;

        let host = Arc::clone(self);
        object.set(
            "getGlobal",
            Function::new(ctx.clone(), move |key: String| encode(host.context.globals().get(&key).as_ref()))?,
        )?;

        let host = Arc::clone(self);
        object.set(
            "setGlobal",
            Function::new(ctx.clone(), move |key: String, text: String| match decode(&text) {
                Some(value) => {
                    host.context.globals().set(key, value);
                }
                None => {
                    host.context.globals().remove(&key);
                }
            })?,
        )?;

        let host = Arc::clone(self);
        object.set(
            "emitGlobal",
            Function::new(ctx.clone(), move |name: String, args: String| host.emit_global(&name, &args))?,
        )?;

        let host = Arc::clone(self);
        object.set(
            "fs",
            Function::new(ctx.clone(), move |op: String, args: String| {
                super::fs::call(host.context.workspace_root(), &op, &args)
            })?,
        )?;

        let host = Arc::clone(self);
        object.set(
            "workspaceRoot",
            Function::new(ctx.clone(), move || host.context.workspace_root().to_string_lossy().into_owned())?,
        )?;

        let host = Arc::clone(self);
        object.set(
            "isCancelled",
            Function::new(ctx.clone(), move || host.cancel.is_cancelled())?,
        )?;

        Ok(object)
    }

    fn log(&self, level: &str, message: &str) {
        let script = self.script.display();
        match level {
            "error" => tracing::error!(target: SCRIPT_LOG_TARGET, %script, "{message}"),
            "warn" => tracing::warn!(target: SCRIPT_LOG_TARGET, %script, "{message}"),
            "debug" => tracing::debug!(target: SCRIPT_LOG_TARGET, %script, "{message}"),
            "trace" => tracing::trace!(target: SCRIPT_LOG_TARGET, %script, "{message}"),
            _ => tracing::info!(target: SCRIPT_LOG_TARGET, %script, "{message}"),
        }
    }

    /// Resolve and load a module; `dir` is the requiring module's directory
    fn require(&self, id: &str, dir: &str) -> String {
        let loaded = if dir.is_empty() {
            self.context.require(id)
        } else {
            self.context.require_from(id, &PathBuf::from(dir))
        };

        let reply = match loaded {
            Ok(module) => json!({
                "path": module.path.to_string_lossy(),
                "dir": module.directory.to_string_lossy(),
                "source": module.source,
            }),
            Err(e) => json!({ "error": format!("Cannot find module '{id}': {e}") }),
        };
        reply.to_string()
    }

    fn emit_global(&self, name: &str, args: &str) -> bool {
        let args = match serde_json::from_str::<Vec<Value>>(args) {
            Ok(args) => args,
            Err(e) => {
                tracing::warn!(event = %name, error = %e, "Dropping malformed event arguments");
                Vec::new()
            }
        };
        self.context.emit_global(name, args)
    }
}

fn encode(value: Option<&Value>) -> String {
    value.map(Value::to_string).unwrap_or_default()
}

fn decode(text: &str) -> Option<Value> {
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str(text) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(error = %e, "Script passed a value that is not JSON");
            None
        }
    }
}
