//! Parent-side message plumbing for one child: the stdin writer task, the
//! stdout reader/dispatcher, and the stderr log forwarder.
//!
//! Replies always echo the inbound `_reqId` and are dropped once the
//! handle is no longer live, so a stopped service can never be written to.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::mpsc;

use crate::api;
use crate::control;
use crate::ipc::{self, ChildCommand};
use crate::supervisor::Supervisor;

/// Spawn the writer task owning the child's stdin; each queued string is
/// sent as one line.
pub(crate) fn spawn_writer(mut stdin: ChildStdin) -> mpsc::Sender<String> {
    let (tx, mut rx) = mpsc::channel::<String>(64);
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if stdin.write_all(line.as_bytes()).await.is_err()
                || stdin.write_all(b"\n").await.is_err()
                || stdin.flush().await.is_err()
            {
                break;
            }
        }
    });
    tx
}

/// Forward the child's stderr, tagged with the service name.
pub(crate) fn attach_stderr(name: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::info!(service = %name, "{line}");
        }
    });
}

/// Spawn the reader task consuming the child's stdout message stream.
pub(crate) fn spawn_reader(name: String, stdout: ChildStdout, sup: Arc<Supervisor>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            let msg = match ipc::parse_inbound(&line) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::warn!("[{name}] malformed message: {e}");
                    continue;
                }
            };
            dispatch(&name, msg, &sup).await;
        }
        tracing::debug!("[{name}] message channel closed");
    });
}

async fn dispatch(name: &str, msg: ipc::Inbound, sup: &Arc<Supervisor>) {
    match msg.command {
        ChildCommand::GetConfig => {
            let body = match sup.config_reply(name).await {
                Some(r) => serde_json::to_value(r).unwrap_or_else(|_| json!({})),
                None => json!({}),
            };
            reply(sup, name, msg.req_id, body).await;
        }

        ChildCommand::Api {
            method,
            service_name,
        } => {
            // Denials produce no reply at all; the caller times out.
            if let Some(body) =
                control::dispatch(sup, name, &method, service_name.as_deref()).await
            {
                reply(sup, name, msg.req_id, body).await;
            }
        }

        ChildCommand::SetPublicApi { api: raw } => {
            match api::parse_api(&raw) {
                Ok(methods) => sup.set_public_api(name, methods).await,
                Err(e) => tracing::warn!("[{name}] setPublicApi rejected: {e}"),
            }
            reply(sup, name, msg.req_id, json!({})).await;
        }

        ChildCommand::Exit => {
            reply(sup, name, msg.req_id, json!({})).await;
            let sup = sup.clone();
            let name = name.to_string();
            tokio::spawn(async move { sup.stop_service(&name).await });
        }

        ChildCommand::SetChildServices { childs } => {
            let registered = sup.register_child_services(name, childs).await;
            reply(sup, name, msg.req_id, json!({})).await;
            match registered {
                Ok(()) => sup.reconcile().await,
                Err(e) => tracing::warn!("[{name}] setChildServices rejected: {e}"),
            }
        }

        ChildCommand::Unknown { cmd } => {
            tracing::warn!("[{name}] unknown command '{cmd}'");
            reply(sup, name, msg.req_id, json!({})).await;
        }
    }
}

/// Send a correlated reply, unless the message was a notification or the
/// handle has died in the meantime.
async fn reply(sup: &Arc<Supervisor>, name: &str, req_id: Option<u32>, body: Value) {
    let Some(req_id) = req_id else {
        return;
    };
    let Some(tx) = sup.outbound_for(name).await else {
        tracing::debug!("[{name}] reply {req_id} dropped, channel gone");
        return;
    };
    let line = ipc::with_req_id(body, req_id).to_string();
    let _ = tx.send(line).await;
}
