//! Wire types for the parent↔child channel.
//!
//! Messages are newline-delimited JSON objects. Requests from a child
//! carry an integer `_reqId` in `[1, 2^32-1]`; replies echo it. The one
//! non-object message on the wire is the bare string `"SIGINT"`, the
//! Windows-side substitute for a real interrupt signal.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::ApiMethod;
use crate::config::ServiceConfig;

/// Correlation-id key stamped on requests and echoed on replies.
pub const REQ_ID_KEY: &str = "_reqId";

/// In-band interrupt relay for platforms without POSIX signals.
pub const SIGINT_SENTINEL: &str = "SIGINT";

/// Commands a child may send to its supervisor.
///
/// The set is closed: anything else parses to [`ChildCommand::Unknown`]
/// and is answered with an empty reply rather than silently dropped.
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum ChildCommand {
    /// Ask for the service's own config and api key.
    GetConfig,
    /// Invoke a control-plane method (capability-checked).
    #[serde(rename_all = "camelCase")]
    Api {
        method: String,
        #[serde(default)]
        service_name: Option<String>,
    },
    /// Advertise the service's public method catalogue.
    SetPublicApi {
        #[serde(default)]
        api: Vec<Value>,
    },
    /// Ask the supervisor to stop this service.
    Exit,
    /// Declare this service's sub-services.
    SetChildServices {
        #[serde(default)]
        childs: Vec<ServiceConfig>,
    },
    #[serde(skip)]
    Unknown { cmd: String },
}

/// A parsed inbound message from a child.
#[derive(Debug)]
pub struct Inbound {
    /// Correlation id, when the message is a request.
    pub req_id: Option<u32>,
    pub command: ChildCommand,
}

/// Parse one line from a child into a command plus correlation id.
///
/// A missing or out-of-range `_reqId` makes the message an unsolicited
/// notification; an unrecognized `cmd` yields [`ChildCommand::Unknown`].
pub fn parse_inbound(line: &str) -> Result<Inbound, serde_json::Error> {
    let value: Value = serde_json::from_str(line)?;
    let req_id = value
        .get(REQ_ID_KEY)
        .and_then(Value::as_u64)
        .filter(|id| (1..=u64::from(u32::MAX)).contains(id))
        .map(|id| id as u32);
    let command = serde_json::from_value::<ChildCommand>(value.clone()).unwrap_or_else(|_| {
        ChildCommand::Unknown {
            cmd: value
                .get("cmd")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
        }
    });
    Ok(Inbound { req_id, command })
}

/// Stamp a reply body with the correlation id it answers.
pub fn with_req_id(body: Value, req_id: u32) -> Value {
    let mut body = if body.is_object() {
        body
    } else {
        Value::Object(serde_json::Map::new())
    };
    body.as_object_mut()
        .expect("reply body is an object")
        .insert(REQ_ID_KEY.to_string(), Value::from(req_id));
    body
}

/// `getConfig` reply: the service's own config and credential.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigReply {
    pub config: ServiceConfig,
    pub api_key: String,
}

/// `getApiKey` reply. `apiPort` is null and `apiKey` empty for a service
/// the supervisor does not know.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyReply {
    pub service_name: String,
    pub api_port: Option<u16>,
    pub api_key: String,
}

/// One row of `getServicesList`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRow {
    pub service_name: String,
    pub api: Vec<ApiMethod>,
    pub status: bool,
}

/// `getServicesList` reply.
#[derive(Debug, Serialize, Deserialize)]
pub struct ServicesListReply {
    pub services: Vec<ServiceRow>,
}

/// Supervisor-side status row for inspection.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRow {
    pub name: String,
    pub state: String,
    pub pid: Option<u32>,
    pub api_port: u16,
}
