//! Deploy Types - Shared data model for the deployment engine
//!
//! Leaf data only: target descriptors, configuration, completion records and
//! the error taxonomy. Nothing in here performs a deployment.

mod completion;
mod config;
mod error;
mod target;

pub use completion::*;
pub use config::*;
pub use error::*;
pub use target::*;
