//! Control channel vocabulary: frames, calls and server events
//!
//! Frames travel as one JSON object per line. Payload field names follow the
//! host's casing (PascalCase for gamepad records, lowercase for the
//! `Connected` payload) and must not be renamed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::gamepad::ControllerKind;

pub const SESSION_ID_HEADER: &str = "X-Session-Id";
pub const DEVICE_ID_HEADER: &str = "X-Device-Id";
pub const USERNAME_HEADER: &str = "X-User-Name";
pub const SESSION_TOKEN_HEADER: &str = "X-Session-Token";

/// Status code the host returns for a successful `DeleteGamepad`
pub const DELETE_OK: i64 = 200;

// Frames sent by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientFrame {
    Handshake {
        path: String,
        headers: BTreeMap<String, String>,
    },
    Invoke {
        id: u64,
        target: String,
        arguments: Vec<Value>,
    },
    Send {
        target: String,
        arguments: Vec<Value>,
    },
}

// Frames sent by the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerFrame {
    Event {
        target: String,
        #[serde(default)]
        arguments: Vec<Value>,
    },
    Completion {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(non_snake_case)]
pub struct AddGamepadRequest {
    pub Name: String,
    pub CType: u8,
    pub LayoutId: String,
}

/// Calls the client issues on the control channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCall {
    AddGamepad(AddGamepadRequest),
    DeleteGamepad { client_ref_id: String },
    SetUsername { name: String },
    Disconnected,
}

impl ClientCall {
    pub fn target(&self) -> &'static str {
        match self {
            ClientCall::AddGamepad(_) => "AddGamepad",
            ClientCall::DeleteGamepad { .. } => "DeleteGamepad",
            ClientCall::SetUsername { .. } => "SetUsername",
            ClientCall::Disconnected => "Disconnected",
        }
    }

    pub fn arguments(&self) -> Result<Vec<Value>, serde_json::Error> {
        Ok(match self {
            ClientCall::AddGamepad(request) => vec![serde_json::to_value(request)?],
            ClientCall::DeleteGamepad { client_ref_id } => vec![Value::from(client_ref_id.as_str())],
            ClientCall::SetUsername { name } => vec![Value::from(name.as_str())],
            ClientCall::Disconnected => Vec::new(),
        })
    }
}

/// Gamepad record as the host describes it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GamepadInfo {
    pub id: i64,
    #[serde(rename = "Type")]
    pub kind: i64,
    #[serde(default)]
    pub name: String,
    pub client_ref_id: String,
    #[serde(default)]
    pub layout_id: String,
}

impl GamepadInfo {
    /// Reads an `AddGamepad` result, which arrives either as an object or as
    /// a JSON document wrapped in a string
    pub fn from_result(value: Value) -> Result<Self, serde_json::Error> {
        match value {
            Value::String(document) => serde_json::from_str(&document),
            other => serde_json::from_value(other),
        }
    }

    /// `None` when the kind is unknown or the id does not fit the wire byte
    pub fn into_virtual_device(self) -> Option<VirtualDevice> {
        let kind = u8::try_from(self.kind).ok().and_then(ControllerKind::from_wire)?;
        let id = u8::try_from(self.id).ok()?;
        Some(VirtualDevice {
            id,
            kind,
            name: self.name,
            client_ref_id: self.client_ref_id,
            layout_id: self.layout_id,
        })
    }
}

/// Roster entry published to the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDevice {
    pub id: u8,
    pub kind: ControllerKind,
    pub name: String,
    pub client_ref_id: String,
    pub layout_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectedPayload {
    #[serde(default)]
    pub reconnected: bool,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub computer: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub gamepads: Vec<Value>,
}

impl ConnectedPayload {
    /// Usable roster entries; malformed or unknown ones are skipped
    pub fn roster(&self) -> Vec<VirtualDevice> {
        self.gamepads
            .iter()
            .filter_map(|entry| {
                let device = serde_json::from_value::<GamepadInfo>(entry.clone())
                    .ok()
                    .and_then(GamepadInfo::into_virtual_device);
                if device.is_none() {
                    warn!("Skipping unusable roster entry: {}", entry);
                }
                device
            })
            .collect()
    }
}

/// Pushes the host sends outside of call completions
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Connected(ConnectedPayload),
    ClearGamepad,
    Removed,
    ConnectionFailed(String),
    Unknown(String),
}

impl ServerEvent {
    pub fn parse(target: &str, arguments: Vec<Value>) -> Result<Self, serde_json::Error> {
        let first = arguments.into_iter().next();
        Ok(match target {
            "Connected" => {
                ServerEvent::Connected(serde_json::from_value(first.unwrap_or(Value::Null))?)
            }
            "ClearGamepad" => ServerEvent::ClearGamepad,
            "Removed" => ServerEvent::Removed,
            "ConnectionFailed" => ServerEvent::ConnectionFailed(
                first
                    .as_ref()
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            ),
            other => ServerEvent::Unknown(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_are_tagged_by_kind() {
        let frame = ClientFrame::Invoke {
            id: 7,
            target: "DeleteGamepad".to_string(),
            arguments: vec![json!("pad-1")],
        };
        let text = serde_json::to_string(&frame).unwrap();
        assert_eq!(
            text,
            r#"{"kind":"invoke","id":7,"target":"DeleteGamepad","arguments":["pad-1"]}"#
        );

        let completion: ServerFrame =
            serde_json::from_str(r#"{"kind":"completion","id":7,"result":200}"#).unwrap();
        assert_eq!(
            completion,
            ServerFrame::Completion {
                id: 7,
                result: Some(json!(200)),
                error: None
            }
        );
    }

    #[test]
    fn add_request_uses_host_casing() {
        let call = ClientCall::AddGamepad(AddGamepadRequest {
            Name: "Pad".to_string(),
            CType: ControllerKind::Xbox.wire_value(),
            LayoutId: "layout-1".to_string(),
        });
        assert_eq!(call.target(), "AddGamepad");
        assert_eq!(
            call.arguments().unwrap(),
            vec![json!({"Name": "Pad", "CType": 1, "LayoutId": "layout-1"})]
        );
        assert!(ClientCall::Disconnected.arguments().unwrap().is_empty());
    }

    #[test]
    fn connected_payload_roster_skips_bad_entries() {
        let event = ServerEvent::parse(
            "Connected",
            vec![json!({
                "reconnected": true,
                "token": "tok",
                "computer": "desk",
                "port": 5000,
                "gamepads": [
                    {"Id": 1, "Type": 0, "Name": "One", "ClientRefId": "a", "LayoutId": "l"},
                    {"Id": 2, "Type": 9, "Name": "Bad kind", "ClientRefId": "b"},
                    {"Type": 1, "ClientRefId": "c"},
                    {"Id": 3, "Type": 1, "ClientRefId": "d"}
                ]
            })],
        )
        .unwrap();

        let ServerEvent::Connected(payload) = event else {
            panic!("expected Connected");
        };
        assert!(payload.reconnected);
        assert_eq!(payload.token.as_deref(), Some("tok"));
        assert_eq!(payload.port, 5000);

        let roster = payload.roster();
        let ids: Vec<_> = roster.iter().map(|d| d.client_ref_id.as_str()).collect();
        assert_eq!(ids, ["a", "d"]);
        assert_eq!(roster[1].kind, ControllerKind::Xbox);
        assert_eq!(roster[1].name, "");
    }

    #[test]
    fn add_result_may_be_a_string() {
        let object = json!({"Id": 4, "Type": 1, "Name": "P", "ClientRefId": "x", "LayoutId": "l"});
        let wrapped = Value::String(object.to_string());
        assert_eq!(
            GamepadInfo::from_result(object).unwrap(),
            GamepadInfo::from_result(wrapped).unwrap()
        );
    }

    #[test]
    fn simple_events() {
        assert_eq!(
            ServerEvent::parse("Removed", vec![]).unwrap(),
            ServerEvent::Removed
        );
        assert_eq!(
            ServerEvent::parse("ConnectionFailed", vec![json!("bad token")]).unwrap(),
            ServerEvent::ConnectionFailed("bad token".to_string())
        );
        assert_eq!(
            ServerEvent::parse("Ping", vec![]).unwrap(),
            ServerEvent::Unknown("Ping".to_string())
        );
    }
}
