//! Worker-protocol framing: newline-delimited JSON records with base64
//! binary payloads. The framing lives behind `CommandChannel`, so backends
//! never see transport details and a denser codec could replace this one
//! without touching them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

/// Client-to-daemon requests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Request {
    /// Version handshake; must be the first frame on a fresh connection.
    Hello { version: u32 },
    /// Forward client-chosen settings. Currently always empty.
    SetOptions { options: BTreeMap<String, String> },
    /// Register a weak back-reference to a client-owned direct root.
    AddIndirectRoot { root: String },
    /// Create the direct root server-side and register it, in one step.
    AddPermRoot { store_path: String, gc_root: String },
    /// Stream a store object as a canonical archive.
    NarFromPath { store_path: String },
}

/// Daemon-to-client reply envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub value: serde_json::Value,
}

impl Response {
    #[must_use]
    pub fn success(value: serde_json::Value) -> Self {
        Self {
            ok: true,
            error: None,
            value,
        }
    }

    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            value: serde_json::Value::Null,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub version: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NarPayload {
    #[serde(with = "base64_bytes")]
    pub nar: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermRootPayload {
    pub gc_root: String,
}

mod base64_bytes {
    use base64::prelude::{Engine as _, BASE64_STANDARD_NO_PAD};
    use serde::de::Error;
    use serde::Deserialize;

    pub fn serialize<S: serde::Serializer>(
        bytes: &Vec<u8>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD_NO_PAD.encode(bytes))
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        BASE64_STANDARD_NO_PAD
            .decode(s.as_bytes())
            .map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requests_use_kebab_case_op_tags() {
        let frame = serde_json::to_value(Request::AddIndirectRoot {
            root: "/home/op/result".to_string(),
        })
        .expect("encode");
        assert_eq!(
            frame,
            json!({"op": "add-indirect-root", "root": "/home/op/result"})
        );

        let decoded: Request =
            serde_json::from_value(json!({"op": "hello", "version": 1})).expect("decode");
        assert_eq!(decoded, Request::Hello { version: 1 });
    }

    #[test]
    fn nar_payload_round_trips_binary_data() {
        let payload = NarPayload {
            nar: vec![0u8, 159, 146, 150],
        };
        let encoded = serde_json::to_string(&payload).expect("encode");
        let decoded: NarPayload = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, payload);
    }

    #[test]
    fn failure_responses_carry_the_daemon_message() {
        let response = Response::failure("no such path");
        let encoded = serde_json::to_string(&response).expect("encode");
        let decoded: Response = serde_json::from_str(&encoded).expect("decode");
        assert!(!decoded.ok);
        assert_eq!(decoded.error.as_deref(), Some("no such path"));
        assert!(decoded.value.is_null());
    }
}
