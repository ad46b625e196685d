//! Child-side client: the library a supervised service links to talk to
//! its supervisor.
//!
//! The protocol rides the process's own stdin (parent→child) and stdout
//! (child→parent) as newline-delimited JSON, so a service must reserve
//! stdout for the client and log to stderr. Every request is stamped with
//! a monotonically increasing `_reqId`; replies resolve the matching slot
//! in the pending table, and a request with no reply resolves to `None`
//! after the reply timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Notify, RwLock};
use tokio::time::timeout;

use crate::api::ApiMethod;
use crate::config::ServiceConfig;
use crate::ipc::{self, ApiKeyReply, ConfigReply, ServicesListReply, SIGINT_SENTINEL};

/// Default time a request waits for its reply.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ServiceClient {
    outbound: mpsc::Sender<String>,
    pending: Arc<RwLock<HashMap<u32, oneshot::Sender<Value>>>>,
    next_id: AtomicU32,
    reply_timeout: Duration,
    interrupt: Arc<Notify>,
}

impl ServiceClient {
    /// Connect over the process's stdin/stdout. Also returns the stream
    /// of unsolicited messages from the supervisor.
    pub fn connect() -> (Self, mpsc::Receiver<Value>) {
        Self::from_streams(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Connect over arbitrary streams (used by tests and embeddings).
    pub fn from_streams<R, W>(reader: R, writer: W) -> (Self, mpsc::Receiver<Value>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
        let (notif_tx, notif_rx) = mpsc::channel::<Value>(64);
        let pending: Arc<RwLock<HashMap<u32, oneshot::Sender<Value>>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let interrupt = Arc::new(Notify::new());

        let mut writer = writer;
        tokio::spawn(async move {
            while let Some(line) = out_rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err()
                    || writer.write_all(b"\n").await.is_err()
                    || writer.flush().await.is_err()
                {
                    break;
                }
            }
        });

        let pending_reader = pending.clone();
        let interrupt_reader = interrupt.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                let value: Value = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::debug!("malformed message from supervisor: {e}");
                        continue;
                    }
                };
                if value.as_str() == Some(SIGINT_SENTINEL) {
                    interrupt_reader.notify_one();
                    continue;
                }
                match value.get(ipc::REQ_ID_KEY).and_then(Value::as_u64) {
                    Some(id) => {
                        // A slot already timed out and removed means this
                        // reply arrived late; it is dropped.
                        if let Some(tx) = pending_reader.write().await.remove(&(id as u32)) {
                            let _ = tx.send(value);
                        }
                    }
                    None => {
                        let _ = notif_tx.send(value).await;
                    }
                }
            }
        });

        (
            Self {
                outbound: out_tx,
                pending,
                next_id: AtomicU32::new(1),
                reply_timeout: REPLY_TIMEOUT,
                interrupt,
            },
            notif_rx,
        )
    }

    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    /// Next correlation id: strictly increasing, wraps past `0xffffffff`
    /// back to 1 and never issues 0.
    fn next_req_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Send one request and await its reply; `None` on timeout or closed
    /// channel.
    pub async fn request(&self, body: Value) -> Option<Value> {
        let id = self.next_req_id();
        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(id, tx);
        let line = ipc::with_req_id(body, id).to_string();
        if self.outbound.send(line).await.is_err() {
            self.pending.write().await.remove(&id);
            return None;
        }
        match timeout(self.reply_timeout, rx).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(_)) => None,
            Err(_) => {
                self.pending.write().await.remove(&id);
                None
            }
        }
    }

    /// Fetch this service's own config and api key.
    pub async fn get_config(&self) -> Option<ConfigReply> {
        let reply = self.request(json!({ "cmd": "getConfig" })).await?;
        serde_json::from_value(reply).ok()
    }

    /// Invoke a control-plane method. Resolves to `None` when denied.
    pub async fn api(&self, method: &str, service_name: Option<&str>) -> Option<Value> {
        let mut body = json!({ "cmd": "api", "method": method });
        if let Some(target) = service_name {
            body["serviceName"] = json!(target);
        }
        self.request(body).await
    }

    /// Ask for a peer's api key and port.
    pub async fn get_api_key(&self, service_name: &str) -> Option<ApiKeyReply> {
        let reply = self.api("getApiKey", Some(service_name)).await?;
        serde_json::from_value(reply).ok()
    }

    /// List all services with their advertised APIs (requires `"nsrvm"`).
    pub async fn get_services_list(&self) -> Option<ServicesListReply> {
        let reply = self.api("getServicesList", None).await?;
        serde_json::from_value(reply).ok()
    }

    /// Advertise this service's public method catalogue.
    pub async fn set_public_api(&self, api: &[ApiMethod]) -> Option<Value> {
        self.request(json!({ "cmd": "setPublicApi", "api": api }))
            .await
    }

    /// Declare this service's sub-services.
    pub async fn set_child_services(&self, childs: &[ServiceConfig]) -> Option<Value> {
        self.request(json!({ "cmd": "setChildServices", "childs": childs }))
            .await
    }

    /// Ask the supervisor to stop this service.
    pub async fn exit(&self) -> Option<Value> {
        self.request(json!({ "cmd": "exit" })).await
    }

    /// Resolves when the supervisor relays the in-band `"SIGINT"`
    /// sentinel. On POSIX targets graceful stop arrives as a real SIGINT
    /// instead, so services should select over both this and
    /// `tokio::signal::ctrl_c` to shut down cleanly everywhere.
    pub async fn interrupted(&self) {
        self.interrupt.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};

    /// A fake supervisor end: one duplex pipe, lines in, lines out.
    struct FakeParent {
        lines: tokio::io::Lines<BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>>,
        writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
    }

    fn pair() -> (ServiceClient, mpsc::Receiver<Value>, FakeParent) {
        let (child_end, parent_end) = tokio::io::duplex(4096);
        let (r, w) = tokio::io::split(child_end);
        let (client, notif) = ServiceClient::from_streams(r, w);
        let (pr, pw) = tokio::io::split(parent_end);
        (
            client,
            notif,
            FakeParent {
                lines: BufReader::new(pr).lines(),
                writer: pw,
            },
        )
    }

    impl FakeParent {
        async fn read_request(&mut self) -> Value {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn write_line(&mut self, value: &Value) {
            let line = format!("{value}\n");
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }

        async fn write_raw(&mut self, raw: &str) {
            self.writer.write_all(raw.as_bytes()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_request_reply_roundtrip() {
        let (client, _notif, mut parent) = pair();
        let echo = tokio::spawn(async move {
            let req = parent.read_request().await;
            assert_eq!(req["cmd"], "getConfig");
            let id = req["_reqId"].clone();
            parent
                .write_line(&json!({ "_reqId": id, "hello": "world" }))
                .await;
            parent
        });
        let reply = client.request(json!({ "cmd": "getConfig" })).await.unwrap();
        assert_eq!(reply["hello"], "world");
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn test_req_ids_increase_from_one() {
        let (client, _notif, mut parent) = pair();
        let ids = tokio::spawn(async move {
            let a = parent.read_request().await["_reqId"].as_u64().unwrap();
            parent.write_line(&json!({ "_reqId": a })).await;
            let b = parent.read_request().await["_reqId"].as_u64().unwrap();
            parent.write_line(&json!({ "_reqId": b })).await;
            (a, b)
        });
        client.request(json!({ "cmd": "exit" })).await.unwrap();
        client.request(json!({ "cmd": "exit" })).await.unwrap();
        let (a, b) = ids.await.unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[tokio::test]
    async fn test_req_id_wraps_to_one_skipping_zero() {
        let (client, _notif, mut parent) = pair();
        client.next_id.store(u32::MAX, Ordering::Relaxed);
        let ids = tokio::spawn(async move {
            let a = parent.read_request().await["_reqId"].as_u64().unwrap();
            parent.write_line(&json!({ "_reqId": a })).await;
            let b = parent.read_request().await["_reqId"].as_u64().unwrap();
            parent.write_line(&json!({ "_reqId": b })).await;
            (a, b)
        });
        client.request(json!({ "cmd": "exit" })).await.unwrap();
        client.request(json!({ "cmd": "exit" })).await.unwrap();
        let (a, b) = ids.await.unwrap();
        assert_eq!(a, u64::from(u32::MAX));
        assert_eq!(b, 1);
    }

    #[tokio::test]
    async fn test_timeout_resolves_none_and_clears_slot() {
        let (client, _notif, mut parent) = pair();
        let client = client.with_reply_timeout(Duration::from_millis(50));
        let silent = tokio::spawn(async move {
            let req = parent.read_request().await;
            // Reply far too late.
            tokio::time::sleep(Duration::from_millis(300)).await;
            parent
                .write_line(&json!({ "_reqId": req["_reqId"], "late": true }))
                .await;
            parent
        });
        assert!(client.request(json!({ "cmd": "exit" })).await.is_none());
        let mut parent = silent.await.unwrap();

        // The late reply was dropped; a fresh request still works.
        let echo = tokio::spawn(async move {
            let req = parent.read_request().await;
            parent
                .write_line(&json!({ "_reqId": req["_reqId"], "fresh": true }))
                .await;
        });
        let client = client.with_reply_timeout(Duration::from_secs(2));
        let reply = client.request(json!({ "cmd": "exit" })).await.unwrap();
        assert_eq!(reply["fresh"], true);
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn test_unsolicited_message_goes_to_notifications() {
        let (_client, mut notif, mut parent) = pair();
        parent.write_line(&json!({ "announce": "hi" })).await;
        let msg = notif.recv().await.unwrap();
        assert_eq!(msg["announce"], "hi");
    }

    #[tokio::test]
    async fn test_sigint_sentinel_triggers_interrupt() {
        let (client, _notif, mut parent) = pair();
        parent.write_raw("\"SIGINT\"\n").await;
        timeout(Duration::from_secs(2), client.interrupted())
            .await
            .expect("interrupt delivered");
    }
}
