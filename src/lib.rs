//! # nsrvm
//!
//! Node-service supervisor: a parent process that launches, monitors,
//! restarts, and brokers RPC between long-running child services
//! described by a declarative JSON config file.
//!
//! ## Overview
//!
//! The supervisor loads `services-config.json`, spawns one child process
//! per configured service, and converges the running set whenever the
//! file changes. Each service gets a private random api key, a
//! request/reply channel to the supervisor over its own stdin/stdout, and
//! a capability-checked control plane (`getApiKey`, `restartService`,
//! `stopService`, `startService`, `restartServer`, `getServicesList`).
//! A privileged service may also spawn and govern its own sub-services
//! through `setChildServices`.
//!
//! ## Halves
//!
//! - [`supervisor::Supervisor`]: the parent-side kernel (the `nsrvm`
//!   binary wraps it).
//! - [`service::ServiceClient`]: the child-side client a supervised
//!   service links against.
//!
//! Both halves share the wire types in [`ipc`], so a service written in
//! Rust speaks the same protocol the supervisor brokers.

pub mod api;
pub mod broker;
pub mod config;
pub mod control;
pub mod error;
pub mod ipc;
pub mod keys;
pub mod service;
pub mod state;
pub mod supervisor;
pub mod watcher;

pub use api::ApiMethod;
pub use config::{HookCommand, ServiceConfig, ServicesConfig};
pub use control::SUPERVISOR_CAPABILITY;
pub use error::{NsrvmError, Result};
pub use ipc::{ApiKeyReply, ConfigReply, ServiceRow, ServicesListReply, StatusRow};
pub use service::ServiceClient;
pub use supervisor::Supervisor;
