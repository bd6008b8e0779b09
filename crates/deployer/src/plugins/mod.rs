//! Built-in plugins besides `script`

pub mod local;

pub use local::LocalPlugin;
pub use test::TestPlugin;
