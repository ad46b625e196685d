//! Services-config store: load, validate, and normalize the on-disk
//! `services-config.json` document.
//!
//! All wire names are camelCase for compatibility with existing config
//! files and with the child-side protocol.

use std::collections::HashMap;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{NsrvmError, Result};

/// One desired service, keyed by `name` in the config document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Unique service name; forced to the map key on load.
    #[serde(default)]
    pub name: String,

    /// Relative module-path hint; the service name is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_path: Option<String>,

    /// Port the service will listen on. A change forces a restart.
    pub api_port: u16,

    /// Capability set: peer names this service may address, plus the
    /// literal `"nsrvm"` for the supervisor control plane.
    #[serde(rename = "allowedAPI", default)]
    pub allowed_api: Vec<String>,

    /// Name of the parent service that registered this config, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    /// Upper bound on sub-services this service may declare.
    #[serde(default)]
    pub max_childs: usize,

    /// Interpreter/binary to run the module with; the module is executed
    /// directly when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_path: Option<String>,

    /// Extra environment for the child.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Arguments passed to `execPath` ahead of the module path.
    #[serde(default)]
    pub exec_argv: Vec<String>,

    /// Hook commands run before spawn, in order.
    #[serde(default)]
    pub run_before_start: Vec<HookCommand>,

    /// Hook commands run after an unexpected exit, in order.
    #[serde(default)]
    pub run_after_exit: Vec<HookCommand>,

    /// Milliseconds to pause between the pre-start hooks and the spawn.
    #[serde(default)]
    pub wait_before_start: u64,

    /// Milliseconds to pause after the post-exit hooks.
    #[serde(default)]
    pub wait_after_exit: u64,
}

/// An external command run around a service's lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HookCommand {
    pub app: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Await completion before proceeding.
    #[serde(default)]
    pub wait_for_close: bool,
    /// Milliseconds until the hook is forcibly terminated; 0 = no limit.
    #[serde(default)]
    pub run_timeout: u64,
}

/// The desired-state snapshot: the full config document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicesConfig {
    #[serde(default)]
    pub services: IndexMap<String, ServiceConfig>,
    #[serde(default)]
    pub restart_cmd: String,
}

impl ServicesConfig {
    /// Load and normalize the config document.
    ///
    /// Any failure (unreadable file, invalid JSON, missing `services`
    /// object) logs an error and yields the empty snapshot so startup
    /// proceeds with zero services.
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::error!("cannot load config {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Load the config document, surfacing errors to the caller.
    pub fn try_load(path: &Path) -> Result<Self> {
        let src = std::fs::read_to_string(path)?;
        let doc: serde_json::Value = serde_json::from_str(&src)?;
        if !doc.is_object() {
            return Err(NsrvmError::Config(format!(
                "{}: top level must be an object",
                path.display()
            )));
        }
        if !doc.get("services").map_or(false, |s| s.is_object()) {
            return Err(NsrvmError::Config(format!(
                "{}: missing 'services' object",
                path.display()
            )));
        }
        let mut cfg: ServicesConfig = serde_json::from_value(doc)?;
        cfg.normalize();
        Ok(cfg)
    }

    /// Force each service's `name` to its map key. `maxChilds` and the
    /// other optional fields already default through serde.
    pub fn normalize(&mut self) {
        for (name, svc) in self.services.iter_mut() {
            svc.name = name.clone();
        }
    }
}
