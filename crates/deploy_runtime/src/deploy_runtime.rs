//! Deploy Runtime - Plugin orchestration engine
//!
//! This crate contains the deploy context handed to every plugin, the plugin
//! contract with its boundary dispatch, and the orchestrator that routes a
//! deploy request to the right plugin instance per target.

pub use deploy_types;

pub mod cancel;
pub mod context;
pub mod events;
pub mod orchestrator;
pub mod plugin;

pub use cancel::CancelSignal;
pub use context::{DeployContext, GlobalStore, ModuleLoader, ModuleSource};
pub use events::{EventBus, GlobalEvent, Listener, ListenerId};
pub use orchestrator::Orchestrator;
pub use plugin::*;
