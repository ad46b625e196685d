use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::timeout;

use crate::config::{HookCommand, ServiceConfig};
use crate::error::{NsrvmError, Result};

/// Resolve the module a service runs from.
///
/// Probes, first match wins: `<dir>/<name>/index.mjs`,
/// `<dir>/<name>/index.js`, `<dir>/<name>` as a regular file,
/// `<dir>/<name>.mjs`, `<dir>/<name>.js`. `name` is the `modulePath`
/// hint when present, the service name otherwise.
pub fn resolve_module(services_dir: &Path, cfg: &ServiceConfig) -> Option<PathBuf> {
    let name = cfg.module_path.as_deref().unwrap_or(&cfg.name);
    let base = services_dir.join(name);
    if base.is_dir() {
        for index in ["index.mjs", "index.js"] {
            let candidate = base.join(index);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    } else if base.is_file() {
        return Some(base);
    }
    for ext in ["mjs", "js"] {
        let candidate = services_dir.join(format!("{name}.{ext}"));
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Run a hook sequence in order.
///
/// A hook with `waitForClose` is awaited, under its `runTimeout` when one
/// is set; exceeding the timeout kills the hook and is logged, not an
/// error. Spawn failures are logged and the sequence continues.
pub async fn run_hooks(service: &str, hooks: &[HookCommand]) {
    for hook in hooks {
        let mut cmd = Command::new(&hook.app);
        cmd.args(&hook.args);

        if !hook.wait_for_close {
            if let Err(e) = cmd.spawn() {
                tracing::warn!("[{service}] hook '{}' failed to start: {e}", hook.app);
            }
            continue;
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("[{service}] hook '{}' failed to start: {e}", hook.app);
                continue;
            }
        };

        if hook.run_timeout > 0 {
            match timeout(Duration::from_millis(hook.run_timeout), child.wait()).await {
                Ok(Ok(status)) if !status.success() => {
                    tracing::warn!("[{service}] hook '{}' exited with {status}", hook.app);
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    tracing::warn!("[{service}] hook '{}' wait failed: {e}", hook.app);
                }
                Err(_) => {
                    tracing::warn!(
                        "[{service}] hook '{}' exceeded {}ms, killing it",
                        hook.app,
                        hook.run_timeout
                    );
                    let _ = child.kill().await;
                }
            }
        } else if let Err(e) = child.wait().await {
            tracing::warn!("[{service}] hook '{}' wait failed: {e}", hook.app);
        }
    }
}

/// Spawn a service process.
///
/// With `execPath` set the module runs under that interpreter, after any
/// `execArgv`; otherwise the module file is executed directly. Stdin and
/// stdout carry the message protocol; stderr is the service's log stream.
pub fn spawn_service(cfg: &ServiceConfig, module: &Path) -> Result<Child> {
    let mut cmd = match &cfg.exec_path {
        Some(exec) => {
            let mut c = Command::new(exec);
            c.args(&cfg.exec_argv);
            c.arg(module);
            c
        }
        None => Command::new(module),
    };
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .envs(&cfg.env)
        .kill_on_drop(true);

    cmd.spawn().map_err(|e| NsrvmError::Process {
        service: cfg.name.clone(),
        msg: e.to_string(),
    })
}
