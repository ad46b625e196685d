//! The supervisor kernel: owns the live service set, converges it to the
//! desired config, and drives each service's lifecycle.
//!
//! All shared state lives in one [`SupervisorState`] behind a single
//! `RwLock`; control operations release it at every await, so at most one
//! mutation is in flight at a time. Child-process events never touch the
//! maps directly: exit monitors report over an mpsc channel consumed by
//! the kernel's event loop.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::{JoinHandle, JoinSet};

use crate::api::ApiMethod;
use crate::broker;
use crate::config::{ServiceConfig, ServicesConfig};
use crate::error::{NsrvmError, Result};
use crate::ipc::{ApiKeyReply, ConfigReply, ServiceRow, StatusRow};
use crate::keys::ApiKeyRegistry;
use crate::state::ServiceState;

use lifecycle::{ExitEvent, GRACEFUL_STOP_TIMEOUT, RESTART_DELAY};

pub mod lifecycle;
pub mod spawn;

/// Supervisor-side record owning one service.
pub struct ServiceHandle {
    pub config: ServiceConfig,
    pub state: ServiceState,
    /// Self-advertised public method catalogue.
    pub api: Vec<ApiMethod>,
    /// Scheduled crash-restart, cancellable by a stop.
    pending_restart: Option<JoinHandle<()>>,
    /// Line sender to the child's stdin; dropped once the service dies.
    outbound: Option<mpsc::Sender<String>>,
    /// Hard-kill trigger for the exit monitor.
    kill_tx: Option<oneshot::Sender<()>>,
}

/// Bookkeeping for a stop in flight: the handle has already left the
/// service map, the process has not exited yet.
struct StopWait {
    waiters: Vec<oneshot::Sender<()>>,
    kill_timer: JoinHandle<()>,
}

#[derive(Default)]
pub(crate) struct SupervisorState {
    pub(crate) services: IndexMap<String, ServiceHandle>,
    /// Sub-service configs registered by each parent; outlives the
    /// parent's handle across restarts.
    pub(crate) childs: HashMap<String, Vec<ServiceConfig>>,
    pub(crate) keys: ApiKeyRegistry,
    /// Current desired snapshot.
    pub(crate) config: ServicesConfig,
    stopping: HashMap<String, StopWait>,
    starting: HashSet<String>,
}

pub struct Supervisor {
    config_path: PathBuf,
    services_dir: PathBuf,
    pub(crate) state: RwLock<SupervisorState>,
    events: mpsc::UnboundedSender<ExitEvent>,
}

impl Supervisor {
    pub fn new(config_path: PathBuf, services_dir: PathBuf) -> Arc<Self> {
        let (events, rx) = mpsc::unbounded_channel();
        let sup = Arc::new(Self {
            config_path,
            services_dir,
            state: RwLock::new(SupervisorState::default()),
            events,
        });
        tokio::spawn(Self::exit_loop(sup.clone(), rx));
        sup
    }

    async fn exit_loop(sup: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ExitEvent>) {
        while let Some(event) = rx.recv().await {
            sup.handle_exit(event).await;
        }
    }

    /// Reload the config document and converge to it.
    ///
    /// Sub-services registered dynamically survive the reload as long as
    /// their parent is still desired; the parent's capability grants for
    /// them are re-applied on top of the file config.
    pub async fn reload_config(self: &Arc<Self>) {
        let mut snapshot = ServicesConfig::load(&self.config_path);
        {
            let mut st = self.state.write().await;
            let parents: Vec<String> = st.childs.keys().cloned().collect();
            for parent in parents {
                if !snapshot.services.contains_key(&parent) {
                    st.childs.remove(&parent);
                    continue;
                }
                for child_cfg in st.childs[&parent].clone() {
                    if let Some(p) = snapshot.services.get_mut(&parent) {
                        if !p.allowed_api.contains(&child_cfg.name) {
                            p.allowed_api.push(child_cfg.name.clone());
                        }
                    }
                    snapshot.services.insert(child_cfg.name.clone(), child_cfg);
                }
            }
            st.config = snapshot;
        }
        self.reconcile().await;
    }

    /// Converge the live service set to the desired config.
    pub async fn reconcile(self: &Arc<Self>) {
        // Stop phase: gone from the desired map, or apiPort changed.
        let to_stop: Vec<String> = {
            let st = self.state.read().await;
            st.services
                .iter()
                .filter(|(name, handle)| match st.config.services.get(*name) {
                    None => true,
                    Some(cfg) => cfg.api_port != handle.config.api_port,
                })
                .map(|(name, _)| name.clone())
                .collect()
        };
        if !to_stop.is_empty() {
            let mut stops = JoinSet::new();
            for name in to_stop {
                let sup = self.clone();
                stops.spawn(async move { sup.stop_service(&name).await });
            }
            while stops.join_next().await.is_some() {}
        }

        // Refresh phase: overwrite live configs in place, mint missing keys.
        {
            let mut st = self.state.write().await;
            let desired: Vec<(String, ServiceConfig)> = st
                .config
                .services
                .iter()
                .map(|(n, c)| (n.clone(), c.clone()))
                .collect();
            for (name, cfg) in desired {
                if let Some(handle) = st.services.get_mut(&name) {
                    handle.config = cfg;
                }
                if !st.keys.contains(&name) && st.keys.mint(&name).is_err() {
                    tracing::error!("[{name}] token generation failed");
                }
            }
        }

        // Start phase: anything desired without a live non-dead handle.
        let to_start: Vec<String> = {
            let st = self.state.read().await;
            st.config
                .services
                .keys()
                .filter(|name| {
                    st.services
                        .get(*name)
                        .map_or(true, |handle| handle.state.is_dead())
                })
                .cloned()
                .collect()
        };
        if !to_start.is_empty() {
            let mut starts = JoinSet::new();
            for name in to_start {
                let sup = self.clone();
                starts.spawn(async move {
                    if let Err(e) = sup.start_service(&name).await {
                        tracing::error!("[{name}] start failed: {e}");
                    }
                });
            }
            while starts.join_next().await.is_some() {}
        }
    }

    /// Start one desired service: pre-start hooks, optional delay, module
    /// resolution, spawn. A missing module or failed spawn is logged and
    /// leaves the desired entry pending for the next reconciliation.
    pub async fn start_service(self: &Arc<Self>, name: &str) -> Result<()> {
        let cfg = {
            let mut st = self.state.write().await;
            if st.starting.contains(name) {
                return Ok(());
            }
            if st
                .services
                .get(name)
                .is_some_and(|handle| !handle.state.is_dead())
            {
                return Ok(());
            }
            let Some(cfg) = st.config.services.get(name).cloned() else {
                return Err(NsrvmError::UnknownService(name.to_string()));
            };
            st.starting.insert(name.to_string());
            cfg
        };
        let result = self.launch(name, cfg).await;
        self.state.write().await.starting.remove(name);
        result
    }

    async fn launch(self: &Arc<Self>, name: &str, cfg: ServiceConfig) -> Result<()> {
        spawn::run_hooks(name, &cfg.run_before_start).await;
        if cfg.wait_before_start > 0 {
            tokio::time::sleep(Duration::from_millis(cfg.wait_before_start)).await;
        }

        let Some(module) = spawn::resolve_module(&self.services_dir, &cfg) else {
            tracing::error!(
                "[{name}] no module found under {}",
                self.services_dir.display()
            );
            return Ok(());
        };
        let mut child = match spawn::spawn_service(&cfg, &module) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!("[{name}] spawn failed: {e}");
                return Ok(());
            }
        };
        let pid = child.id().unwrap_or(0);

        let stdin = child.stdin.take().ok_or_else(|| NsrvmError::Process {
            service: name.to_string(),
            msg: "child has no stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| NsrvmError::Process {
            service: name.to_string(),
            msg: "child has no stdout".into(),
        })?;
        if let Some(stderr) = child.stderr.take() {
            broker::attach_stderr(name.to_string(), stderr);
        }

        let outbound = broker::spawn_writer(stdin);
        let (kill_tx, kill_rx) = oneshot::channel();

        // The handle must be in the map before the reader can dispatch a
        // message or the monitor report an exit; early child traffic and
        // instant deaths both race the insert otherwise.
        {
            let mut st = self.state.write().await;
            if st.keys.mint(name).is_err() {
                tracing::error!("[{name}] token generation failed");
            }
            // The desired config may have been refreshed while hooks ran.
            let cfg = st.config.services.get(name).cloned().unwrap_or(cfg);
            st.services.insert(
                name.to_string(),
                ServiceHandle {
                    config: cfg,
                    state: ServiceState::Running {
                        pid,
                        since: Instant::now(),
                    },
                    api: Vec::new(),
                    pending_restart: None,
                    outbound: Some(outbound),
                    kill_tx: Some(kill_tx),
                },
            );
        }
        broker::spawn_reader(name.to_string(), stdout, self.clone());
        tokio::spawn(lifecycle::monitor(
            name.to_string(),
            child,
            kill_rx,
            self.events.clone(),
        ));
        tracing::info!("[{name}] running (pid {pid})");
        Ok(())
    }

    /// Stop one service: the entry leaves the service map immediately,
    /// the interrupt is delivered, and the call resolves once the process
    /// has actually exited (force-killed after the graceful timeout).
    pub async fn stop_service(&self, name: &str) {
        let waiter = {
            let mut st = self.state.write().await;
            if let Some(stop) = st.stopping.get_mut(name) {
                let (tx, rx) = oneshot::channel();
                stop.waiters.push(tx);
                Some(rx)
            } else if let Some(mut handle) = st.services.shift_remove(name) {
                if let Some(timer) = handle.pending_restart.take() {
                    timer.abort();
                }
                match handle.state.pid() {
                    None => {
                        tracing::debug!("[{name}] stop of dead service");
                        None
                    }
                    Some(pid) => {
                        tracing::info!("[{name}] stopping (pid {pid})");
                        if let Some(outbound) = handle.outbound.take() {
                            lifecycle::send_interrupt(name, pid, &outbound);
                        }
                        let kill_tx = handle.kill_tx.take();
                        let kill_timer = tokio::spawn(async move {
                            tokio::time::sleep(GRACEFUL_STOP_TIMEOUT).await;
                            if let Some(kill) = kill_tx {
                                let _ = kill.send(());
                            }
                        });
                        let (tx, rx) = oneshot::channel();
                        st.stopping.insert(
                            name.to_string(),
                            StopWait {
                                waiters: vec![tx],
                                kill_timer,
                            },
                        );
                        Some(rx)
                    }
                }
            } else {
                None
            }
        };
        if let Some(rx) = waiter {
            let _ = rx.await;
        }
    }

    /// Stop followed by start, in that order.
    pub async fn restart_service(self: &Arc<Self>, name: &str) -> Result<()> {
        self.stop_service(name).await;
        self.start_service(name).await
    }

    /// Register the sub-services declared by `parent` and maintain the
    /// parent's capability grants; the caller reconciles afterwards.
    ///
    /// The whole list is rejected when it exceeds the parent's
    /// `maxChilds`. A name already owned by someone else is logged and
    /// skipped without touching any state.
    pub async fn register_child_services(
        &self,
        parent: &str,
        mut list: Vec<ServiceConfig>,
    ) -> Result<()> {
        let mut st = self.state.write().await;
        let max = st
            .services
            .get(parent)
            .map(|handle| handle.config.max_childs)
            .or_else(|| st.config.services.get(parent).map(|cfg| cfg.max_childs))
            .ok_or_else(|| NsrvmError::UnknownService(parent.to_string()))?;
        if list.len() > max {
            return Err(NsrvmError::TooManyChilds {
                requested: list.len(),
                max,
            });
        }

        // Drop children no longer declared, revoking the parent's grant.
        let current = st.childs.get(parent).cloned().unwrap_or_default();
        for old in &current {
            if !list.iter().any(|cfg| cfg.name == old.name) {
                st.config.services.shift_remove(&old.name);
                if let Some(p) = st.config.services.get_mut(parent) {
                    p.allowed_api.retain(|n| n != &old.name);
                }
                if let Some(handle) = st.services.get_mut(parent) {
                    handle.config.allowed_api.retain(|n| n != &old.name);
                }
            }
        }
        let mut retained: Vec<ServiceConfig> = current
            .into_iter()
            .filter(|cfg| list.iter().any(|new| new.name == cfg.name))
            .collect();

        for mut cfg in list.drain(..) {
            if cfg.name.is_empty() {
                tracing::warn!("[{parent}] unnamed child config skipped");
                continue;
            }
            if let Some(existing) = st.config.services.get(&cfg.name) {
                if existing.parent.as_deref() != Some(parent) {
                    tracing::warn!(
                        "[{parent}] service '{}' already belongs elsewhere, skipping",
                        cfg.name
                    );
                    continue;
                }
            }
            cfg.parent = Some(parent.to_string());
            match retained.iter_mut().find(|c| c.name == cfg.name) {
                Some(slot) => *slot = cfg.clone(),
                None => retained.push(cfg.clone()),
            }
            if let Some(p) = st.config.services.get_mut(parent) {
                if !p.allowed_api.contains(&cfg.name) {
                    p.allowed_api.push(cfg.name.clone());
                }
            }
            if let Some(handle) = st.services.get_mut(parent) {
                if !handle.config.allowed_api.contains(&cfg.name) {
                    handle.config.allowed_api.push(cfg.name.clone());
                }
            }
            st.config.services.insert(cfg.name.clone(), cfg);
        }
        st.childs.insert(parent.to_string(), retained);
        Ok(())
    }

    /// Stop everything and clear the desired state. Used by the full
    /// shutdown path; callable on its own for tests and embedding.
    pub async fn stop_all_and_clear(self: &Arc<Self>) {
        let names: Vec<String> = {
            let mut st = self.state.write().await;
            st.config = ServicesConfig::default();
            st.services.keys().cloned().collect()
        };
        let mut stops = JoinSet::new();
        for name in names {
            let sup = self.clone();
            stops.spawn(async move { sup.stop_service(&name).await });
        }
        while stops.join_next().await.is_some() {}
    }

    /// Full shutdown: stop all children, then exit 0. Relaunch is the
    /// host process manager's responsibility.
    pub async fn restart_server(self: &Arc<Self>) {
        tracing::info!("supervisor shutting down");
        self.stop_all_and_clear().await;
        std::process::exit(0);
    }

    async fn handle_exit(self: &Arc<Self>, event: ExitEvent) {
        let mut st = self.state.write().await;

        // A requested stop completing.
        if let Some(stop) = st.stopping.remove(&event.name) {
            stop.kill_timer.abort();
            for waiter in stop.waiters {
                let _ = waiter.send(());
            }
            tracing::info!("[{}] stopped", event.name);
            return;
        }

        let Some(handle) = st.services.get_mut(&event.name) else {
            tracing::debug!("[{}] exit of unmanaged process ignored", event.name);
            return;
        };
        handle.state = ServiceState::Dead {
            exit_code: event.code,
        };
        handle.outbound = None;
        handle.kill_tx = None;

        if event.code == Some(0) {
            tracing::info!("[{}] exited cleanly", event.name);
            return;
        }

        tracing::warn!(
            "[{}] exited unexpectedly (code={}), restart in {}ms",
            event.name,
            event
                .code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".into()),
            RESTART_DELAY.as_millis()
        );
        let cfg = handle.config.clone();
        let sup = self.clone();
        let name = event.name.clone();
        let restart = tokio::spawn(async move {
            spawn::run_hooks(&name, &cfg.run_after_exit).await;
            if cfg.wait_after_exit > 0 {
                tokio::time::sleep(Duration::from_millis(cfg.wait_after_exit)).await;
            }
            tokio::time::sleep(RESTART_DELAY).await;
            if let Err(e) = sup.start_service(&name).await {
                tracing::error!("[{name}] restart failed: {e}");
            }
        });
        if let Some(stale) = handle.pending_restart.replace(restart) {
            stale.abort();
        }
    }

    // Inspection & broker support ------------------------------------------

    /// One row per desired service, for inspection and embedding.
    pub async fn status_rows(&self) -> Vec<StatusRow> {
        let st = self.state.read().await;
        st.config
            .services
            .iter()
            .map(|(name, cfg)| {
                let handle = st.services.get(name);
                let state = match handle {
                    Some(h) => h.state.label().to_string(),
                    None if st.stopping.contains_key(name) => "stopping".into(),
                    None => "pending".into(),
                };
                StatusRow {
                    name: name.clone(),
                    state,
                    pid: handle.and_then(|h| h.state.pid()),
                    api_port: cfg.api_port,
                }
            })
            .collect()
    }

    /// `getServicesList` rows: advertised api plus liveness per service.
    pub async fn service_rows(&self) -> Vec<ServiceRow> {
        let st = self.state.read().await;
        st.config
            .services
            .keys()
            .map(|name| {
                let handle = st.services.get(name);
                ServiceRow {
                    service_name: name.clone(),
                    api: handle.map(|h| h.api.clone()).unwrap_or_default(),
                    status: handle.is_some_and(|h| !h.state.is_dead()),
                }
            })
            .collect()
    }

    pub(crate) async fn config_reply(&self, name: &str) -> Option<ConfigReply> {
        let st = self.state.read().await;
        let handle = st.services.get(name)?;
        Some(ConfigReply {
            config: handle.config.clone(),
            api_key: st.keys.get(name).unwrap_or("").to_string(),
        })
    }

    pub(crate) async fn api_key_reply(&self, target: &str) -> ApiKeyReply {
        let st = self.state.read().await;
        match st.config.services.get(target) {
            Some(cfg) => ApiKeyReply {
                service_name: target.to_string(),
                api_port: Some(cfg.api_port),
                api_key: st.keys.get(target).unwrap_or("").to_string(),
            },
            None => ApiKeyReply {
                service_name: target.to_string(),
                api_port: None,
                api_key: String::new(),
            },
        }
    }

    /// The key handed to `name` via `getConfig`, when one has been minted.
    pub async fn api_key(&self, name: &str) -> Option<String> {
        let st = self.state.read().await;
        st.keys.get(name).map(|k| k.to_string())
    }

    pub(crate) async fn allowed_api_of(&self, name: &str) -> Option<Vec<String>> {
        let st = self.state.read().await;
        st.services
            .get(name)
            .map(|handle| handle.config.allowed_api.clone())
    }

    pub(crate) async fn set_public_api(&self, name: &str, api: Vec<ApiMethod>) {
        let mut st = self.state.write().await;
        if let Some(handle) = st.services.get_mut(name) {
            handle.api = api;
        }
    }

    /// Line sender toward a child, gated on the handle still being live.
    pub(crate) async fn outbound_for(&self, name: &str) -> Option<mpsc::Sender<String>> {
        let st = self.state.read().await;
        st.services
            .get(name)
            .filter(|handle| !handle.state.is_dead())
            .and_then(|handle| handle.outbound.clone())
    }
}

#[cfg(test)]
impl Supervisor {
    /// Insert a handle without a backing process, for kernel-level tests.
    pub(crate) async fn test_insert_handle(&self, cfg: ServiceConfig, dead: bool) {
        let mut st = self.state.write().await;
        let name = cfg.name.clone();
        let state = if dead {
            ServiceState::Dead { exit_code: None }
        } else {
            // A pid no real process can have, so nothing is ever signaled.
            ServiceState::Running {
                pid: i32::MAX as u32,
                since: Instant::now(),
            }
        };
        st.config.services.insert(name.clone(), cfg.clone());
        st.services.insert(
            name,
            ServiceHandle {
                config: cfg,
                state,
                api: Vec::new(),
                pending_restart: None,
                outbound: None,
                kill_tx: None,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_sup() -> Arc<Supervisor> {
        Supervisor::new(
            PathBuf::from("/nonexistent/services-config.json"),
            PathBuf::from("/nonexistent"),
        )
    }

    fn cfg(name: &str, port: u16, max_childs: usize) -> ServiceConfig {
        ServiceConfig {
            name: name.into(),
            module_path: None,
            api_port: port,
            allowed_api: vec![],
            parent: None,
            max_childs,
            exec_path: None,
            env: Default::default(),
            exec_argv: vec![],
            run_before_start: vec![],
            run_after_exit: vec![],
            wait_before_start: 0,
            wait_after_exit: 0,
        }
    }

    #[tokio::test]
    async fn test_register_child_services_caps_list() {
        let sup = test_sup();
        sup.test_insert_handle(cfg("p", 1, 1), false).await;
        let err = sup
            .register_child_services("p", vec![cfg("c1", 2, 0), cfg("c2", 3, 0)])
            .await
            .unwrap_err();
        match err {
            NsrvmError::TooManyChilds { requested, max } => {
                assert_eq!(requested, 2);
                assert_eq!(max, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let st = sup.state.read().await;
        assert!(st.childs.get("p").is_none());
        assert!(!st.config.services.contains_key("c1"));
    }

    #[tokio::test]
    async fn test_register_child_services_sets_parent_and_grant() {
        let sup = test_sup();
        sup.test_insert_handle(cfg("p", 1, 2), false).await;
        sup.register_child_services("p", vec![cfg("c1", 2, 0)])
            .await
            .unwrap();
        let st = sup.state.read().await;
        assert_eq!(
            st.config.services["c1"].parent.as_deref(),
            Some("p")
        );
        assert!(st.config.services["p"].allowed_api.contains(&"c1".into()));
        assert!(st.services["p"].config.allowed_api.contains(&"c1".into()));
        assert_eq!(st.childs["p"].len(), 1);
    }

    #[tokio::test]
    async fn test_register_child_services_rejects_foreign_name() {
        let sup = test_sup();
        sup.test_insert_handle(cfg("p", 1, 2), false).await;
        sup.test_insert_handle(cfg("victim", 9, 0), false).await;
        sup.register_child_services("p", vec![cfg("victim", 2, 0)])
            .await
            .unwrap();
        let st = sup.state.read().await;
        // Unchanged: still top-level, not granted to p.
        assert_eq!(st.config.services["victim"].parent, None);
        assert_eq!(st.config.services["victim"].api_port, 9);
        assert!(!st.config.services["p"].allowed_api.contains(&"victim".into()));
        assert!(st.childs["p"].is_empty());
    }

    #[tokio::test]
    async fn test_register_child_services_removes_stale_entries() {
        let sup = test_sup();
        sup.test_insert_handle(cfg("p", 1, 2), false).await;
        sup.register_child_services("p", vec![cfg("c1", 2, 0), cfg("c2", 3, 0)])
            .await
            .unwrap();
        sup.register_child_services("p", vec![cfg("c2", 3, 0)])
            .await
            .unwrap();
        let st = sup.state.read().await;
        assert!(!st.config.services.contains_key("c1"));
        assert!(st.config.services.contains_key("c2"));
        assert!(!st.config.services["p"].allowed_api.contains(&"c1".into()));
        assert!(st.config.services["p"].allowed_api.contains(&"c2".into()));
        assert_eq!(st.childs["p"].len(), 1);
    }

    #[tokio::test]
    async fn test_api_key_reply_unknown_service() {
        let sup = test_sup();
        let reply = sup.api_key_reply("ghost").await;
        assert_eq!(reply.api_port, None);
        assert_eq!(reply.api_key, "");
    }

    #[tokio::test]
    async fn test_service_rows_reflect_liveness() {
        let sup = test_sup();
        sup.test_insert_handle(cfg("up", 1, 0), false).await;
        sup.test_insert_handle(cfg("down", 2, 0), true).await;
        let rows = sup.service_rows().await;
        let up = rows.iter().find(|r| r.service_name == "up").unwrap();
        let down = rows.iter().find(|r| r.service_name == "down").unwrap();
        assert!(up.status);
        assert!(!down.status);
    }

    #[tokio::test]
    async fn test_stop_service_of_unknown_is_noop() {
        let sup = test_sup();
        sup.stop_service("ghost").await;
    }

    #[tokio::test]
    async fn test_stop_dead_service_removes_entry() {
        let sup = test_sup();
        sup.test_insert_handle(cfg("a", 1, 0), true).await;
        sup.stop_service("a").await;
        let st = sup.state.read().await;
        assert!(!st.services.contains_key("a"));
    }
}
