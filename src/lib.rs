//! HTTP/1.1 load generation.
//!
//! A [`run::Run`] drives a pool of pipelined [`connection::Connection`]s
//! against one or more targets and folds what they report into
//! [`stats::RunResult`]s. Shards are independent runs whose results merge
//! exactly.

pub mod config;
pub mod connection;
pub mod error;
pub mod hooks;
pub mod request;
pub mod run;
pub mod stats;

pub use config::{Config, Settings};
pub use error::{Error, Result};
pub use hooks::HookRegistry;
pub use run::{Run, RunEvent, RunHandle, RunState};
pub use stats::{RunResult, ShardReport};
