//! JSON-over-UDP wire protocol: the datagram envelope, command tags and
//! the outbound message builders.
//!
//! Every datagram carries one JSON object. The `data` field is frequently
//! double-encoded by gateway firmware (a JSON document inside a JSON string),
//! so decoding normalizes it back into a structured value before dispatch.

use crate::error::{AqaraError, Result};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Command tags used by the gateway protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandTag {
    /// Outbound discovery broadcast
    Whois,
    /// Gateway answering a discovery broadcast
    Iam,
    /// Outbound device-id enumeration request
    GetIdList,
    /// Gateway answering an enumeration request
    GetIdListAck,
    /// Unsolicited state push from a gateway or device
    Report,
    /// Outbound attribute read
    Read,
    /// Answer to a read
    ReadAck,
    /// Outbound attribute write
    Write,
    /// Answer to a write
    WriteAck,
    /// Generic gateway reply, e.g. a NACK for malformed outbound JSON
    ServerAck,
    /// Periodic liveness (gateways also refresh their session token here)
    Heartbeat,
}

impl CommandTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandTag::Whois => "whois",
            CommandTag::Iam => "iam",
            CommandTag::GetIdList => "get_id_list",
            CommandTag::GetIdListAck => "get_id_list_ack",
            CommandTag::Report => "report",
            CommandTag::Read => "read",
            CommandTag::ReadAck => "read_ack",
            CommandTag::Write => "write",
            CommandTag::WriteAck => "write_ack",
            CommandTag::ServerAck => "server_ack",
            CommandTag::Heartbeat => "heartbeat",
        }
    }
}

impl FromStr for CommandTag {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "whois" => Ok(CommandTag::Whois),
            "iam" => Ok(CommandTag::Iam),
            "get_id_list" => Ok(CommandTag::GetIdList),
            "get_id_list_ack" => Ok(CommandTag::GetIdListAck),
            "report" => Ok(CommandTag::Report),
            "read" => Ok(CommandTag::Read),
            "read_ack" => Ok(CommandTag::ReadAck),
            "write" => Ok(CommandTag::Write),
            "write_ack" => Ok(CommandTag::WriteAck),
            "server_ack" => Ok(CommandTag::ServerAck),
            "heartbeat" => Ok(CommandTag::Heartbeat),
            _ => Err(()),
        }
    }
}

impl fmt::Display for CommandTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded datagram.
///
/// All fields except `cmd` are optional on the wire; which ones are present
/// depends on the command tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    // Older firmware sends the port as a JSON string, newer as a number.
    #[serde(
        default,
        deserialize_with = "de_port",
        skip_serializing_if = "Option::is_none"
    )]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

fn de_port<'de, D>(deserializer: D) -> std::result::Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| D::Error::custom("port out of range")),
        Some(Value::String(s)) => s
            .parse::<u16>()
            .map(Some)
            .map_err(|e| D::Error::custom(format!("bad port string: {}", e))),
        Some(other) => Err(D::Error::custom(format!(
            "port must be a number or string, got {}",
            other
        ))),
    }
}

impl Envelope {
    /// Decode a datagram, normalizing a string-encoded `data` field into JSON.
    pub fn decode(raw: &[u8]) -> Result<Envelope> {
        let mut envelope: Envelope = serde_json::from_slice(raw)
            .map_err(|e| AqaraError::InvalidEnvelope(e.to_string()))?;
        if let Some(Value::String(nested)) = &envelope.data {
            let parsed: Value = serde_json::from_str(nested)
                .map_err(|e| AqaraError::InvalidEnvelope(format!("nested data: {}", e)))?;
            envelope.data = Some(parsed);
        }
        Ok(envelope)
    }

    /// Command tag of this envelope, if it is one we know.
    pub fn tag(&self) -> Option<CommandTag> {
        self.cmd.parse().ok()
    }

    /// Interpret `data` as a list of device sids (`get_id_list_ack` payload).
    pub fn device_sids(&self) -> Vec<String> {
        match &self.data {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Discovery broadcast. Unencrypted, no body besides the tag.
pub fn whois() -> Value {
    serde_json::json!({ "cmd": CommandTag::Whois.as_str() })
}

/// Ask a gateway for the sids of its sub-devices.
pub fn get_id_list() -> Value {
    serde_json::json!({ "cmd": CommandTag::GetIdList.as_str() })
}

/// Read the current attribute set of one device (or the gateway itself).
pub fn read(sid: &str) -> Value {
    serde_json::json!({ "cmd": CommandTag::Read.as_str(), "sid": sid })
}

/// Write an attribute set to a device through its gateway.
///
/// The payload is the full `data` map with the derived write `key` spliced in.
pub fn write(
    sid: &str,
    model: &str,
    short_id: Option<u32>,
    data: &serde_json::Map<String, Value>,
    key: &str,
) -> Value {
    let mut data = data.clone();
    data.insert("key".to_string(), Value::String(key.to_string()));
    let mut msg = serde_json::Map::new();
    msg.insert(
        "cmd".to_string(),
        Value::String(CommandTag::Write.as_str().to_string()),
    );
    msg.insert("model".to_string(), Value::String(model.to_string()));
    msg.insert("sid".to_string(), Value::String(sid.to_string()));
    if let Some(short_id) = short_id {
        msg.insert("short_id".to_string(), Value::Number(short_id.into()));
    }
    msg.insert("data".to_string(), Value::Object(data));
    Value::Object(msg)
}
