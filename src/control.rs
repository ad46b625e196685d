//! Control-plane router: the privileged RPCs a service may invoke through
//! the `api` command, each guarded by a capability check.
//!
//! Per-service methods require the target's name in the caller's
//! `allowedAPI`; supervisor-wide methods require the literal `"nsrvm"`.
//! A denied call is logged and gets no reply, which keeps denials
//! indistinguishable from unreachable services.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::ipc::ServicesListReply;
use crate::supervisor::Supervisor;

/// Capability granting the supervisor-wide methods.
pub const SUPERVISOR_CAPABILITY: &str = "nsrvm";

pub(crate) fn has_capability(allowed: &[String], target: &str) -> bool {
    allowed.iter().any(|name| name == target)
}

/// Dispatch one `api` call from `caller`. `None` means no reply is sent.
pub(crate) async fn dispatch(
    sup: &Arc<Supervisor>,
    caller: &str,
    method: &str,
    target: Option<&str>,
) -> Option<Value> {
    let Some(allowed) = sup.allowed_api_of(caller).await else {
        tracing::warn!("[{caller}] api call from unmanaged service denied");
        return None;
    };

    match method {
        "getApiKey" => {
            let target = require_target(caller, method, target)?;
            if !has_capability(&allowed, target) {
                return deny(caller, method, Some(target));
            }
            let reply = sup.api_key_reply(target).await;
            Some(serde_json::to_value(reply).unwrap_or_else(|_| json!({})))
        }

        "restartService" => {
            if !has_capability(&allowed, SUPERVISOR_CAPABILITY) {
                return deny(caller, method, target);
            }
            let target = require_target(caller, method, target)?;
            tracing::info!("[{caller}] requested restart of '{target}'");
            if let Err(e) = sup.restart_service(target).await {
                tracing::error!("[{target}] restart failed: {e}");
            }
            Some(json!({ "status": true }))
        }

        "stopService" => {
            if !has_capability(&allowed, SUPERVISOR_CAPABILITY) {
                return deny(caller, method, target);
            }
            let target = require_target(caller, method, target)?;
            tracing::info!("[{caller}] requested stop of '{target}'");
            sup.stop_service(target).await;
            Some(json!({ "status": true }))
        }

        "startService" => {
            if !has_capability(&allowed, SUPERVISOR_CAPABILITY) {
                return deny(caller, method, target);
            }
            let target = require_target(caller, method, target)?;
            tracing::info!("[{caller}] requested start of '{target}'");
            if let Err(e) = sup.start_service(target).await {
                tracing::error!("[{target}] start failed: {e}");
            }
            Some(json!({ "status": true }))
        }

        "restartServer" => {
            if !has_capability(&allowed, SUPERVISOR_CAPABILITY) {
                return deny(caller, method, None);
            }
            tracing::info!("[{caller}] requested supervisor restart");
            sup.restart_server().await;
            None
        }

        "getServicesList" => {
            if !has_capability(&allowed, SUPERVISOR_CAPABILITY) {
                return deny(caller, method, None);
            }
            let reply = ServicesListReply {
                services: sup.service_rows().await,
            };
            Some(serde_json::to_value(reply).unwrap_or_else(|_| json!({})))
        }

        other => {
            tracing::warn!("[{caller}] unknown api method '{other}'");
            None
        }
    }
}

fn require_target<'a>(caller: &str, method: &str, target: Option<&'a str>) -> Option<&'a str> {
    if target.is_none() {
        tracing::warn!("[{caller}] {method} without serviceName");
    }
    target
}

fn deny(caller: &str, method: &str, target: Option<&str>) -> Option<Value> {
    match target {
        Some(t) => tracing::warn!("[{caller}] denied {method} on '{t}'"),
        None => tracing::warn!("[{caller}] denied {method}"),
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use std::path::PathBuf;

    fn cfg(name: &str, port: u16, allowed: &[&str]) -> ServiceConfig {
        ServiceConfig {
            name: name.into(),
            module_path: None,
            api_port: port,
            allowed_api: allowed.iter().map(|s| s.to_string()).collect(),
            parent: None,
            max_childs: 0,
            exec_path: None,
            env: Default::default(),
            exec_argv: vec![],
            run_before_start: vec![],
            run_after_exit: vec![],
            wait_before_start: 0,
            wait_after_exit: 0,
        }
    }

    fn test_sup() -> Arc<Supervisor> {
        Supervisor::new(
            PathBuf::from("/nonexistent/services-config.json"),
            PathBuf::from("/nonexistent"),
        )
    }

    #[test]
    fn test_has_capability() {
        let allowed = vec!["db".to_string(), SUPERVISOR_CAPABILITY.to_string()];
        assert!(has_capability(&allowed, "db"));
        assert!(has_capability(&allowed, "nsrvm"));
        assert!(!has_capability(&allowed, "web"));
        assert!(!has_capability(&[], "db"));
    }

    #[tokio::test]
    async fn test_get_api_key_requires_target_capability() {
        let sup = test_sup();
        sup.test_insert_handle(cfg("x", 1, &["y"]), false).await;
        sup.test_insert_handle(cfg("y", 2, &[]), false).await;
        sup.test_insert_handle(cfg("z", 3, &[]), false).await;

        // x may ask about y...
        let reply = dispatch(&sup, "x", "getApiKey", Some("y")).await.unwrap();
        assert_eq!(reply["serviceName"], "y");
        assert_eq!(reply["apiPort"], 2);

        // ...but not about z: denial means no reply at all.
        assert!(dispatch(&sup, "x", "getApiKey", Some("z")).await.is_none());
    }

    #[tokio::test]
    async fn test_get_api_key_unknown_target_yields_null_port() {
        let sup = test_sup();
        sup.test_insert_handle(cfg("x", 1, &["ghost"]), false).await;
        let reply = dispatch(&sup, "x", "getApiKey", Some("ghost"))
            .await
            .unwrap();
        assert_eq!(reply["apiPort"], serde_json::Value::Null);
        assert_eq!(reply["apiKey"], "");
    }

    #[tokio::test]
    async fn test_supervisor_methods_require_nsrvm() {
        let sup = test_sup();
        sup.test_insert_handle(cfg("plain", 1, &["other"]), false).await;
        assert!(dispatch(&sup, "plain", "getServicesList", None).await.is_none());
        assert!(dispatch(&sup, "plain", "stopService", Some("other"))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_get_services_list() {
        let sup = test_sup();
        sup.test_insert_handle(cfg("admin", 1, &[SUPERVISOR_CAPABILITY]), false)
            .await;
        sup.test_insert_handle(cfg("worker", 2, &[]), false).await;
        let reply = dispatch(&sup, "admin", "getServicesList", None)
            .await
            .unwrap();
        let rows = reply["services"].as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r["serviceName"] == "worker" && r["status"] == true));
    }

    #[tokio::test]
    async fn test_stop_service_with_capability() {
        let sup = test_sup();
        sup.test_insert_handle(cfg("admin", 1, &[SUPERVISOR_CAPABILITY]), false)
            .await;
        sup.test_insert_handle(cfg("worker", 2, &[]), true).await;
        let reply = dispatch(&sup, "admin", "stopService", Some("worker"))
            .await
            .unwrap();
        assert_eq!(reply["status"], true);
        let rows = sup.service_rows().await;
        let worker = rows.iter().find(|r| r.service_name == "worker").unwrap();
        assert!(!worker.status);
    }

    #[tokio::test]
    async fn test_unmanaged_caller_denied() {
        let sup = test_sup();
        assert!(dispatch(&sup, "ghost", "getServicesList", None).await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_method_gets_no_reply() {
        let sup = test_sup();
        sup.test_insert_handle(cfg("a", 1, &[SUPERVISOR_CAPABILITY]), false)
            .await;
        assert!(dispatch(&sup, "a", "frobnicate", None).await.is_none());
    }
}
