/*
 * SPDX-FileCopyrightText: 2022 perillamint
 *
 * SPDX-License-Identifier: MPL-2.0
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::error::LinkError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const JSONRPC_VERSION: &str = "2.0";

#[derive(Serialize, Debug)]
pub(crate) struct Request<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    #[serde(skip_serializing_if = "Value::is_null")]
    params: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
}

impl<'a> Request<'a> {
    pub fn call(id: u64, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
            id: Some(id),
        }
    }

    pub fn notification(method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
            id: None,
        }
    }
}

#[derive(Serialize, Debug)]
pub(crate) struct Response {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<Value>,
}

impl Response {
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }
}

/// Any message read off the socket, before it is classified.
#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct RawMessage {
    id: Option<Value>,
    method: Option<String>,
    params: Option<Value>,
    result: Option<Value>,
    error: Option<Value>,
}

#[derive(Debug, PartialEq)]
pub(crate) enum Incoming {
    /// Remote-initiated call. `id` is absent for notifications.
    Call {
        id: Option<Value>,
        method: String,
        params: Value,
    },
    /// Reply to one of our requests.
    Reply {
        id: u64,
        outcome: Result<Value, LinkError>,
    },
}

impl Incoming {
    pub fn parse(text: &str) -> Result<Self, LinkError> {
        let raw: RawMessage =
            serde_json::from_str(text).map_err(|e| LinkError::Protocol(e.to_string()))?;

        if let Some(method) = raw.method {
            return Ok(Incoming::Call {
                id: raw.id.filter(|id| !id.is_null()),
                method,
                params: raw.params.unwrap_or(Value::Null),
            });
        }

        let id = raw
            .id
            .as_ref()
            .and_then(Value::as_u64)
            .ok_or_else(|| LinkError::Protocol(format!("Reply without usable id: {text}")))?;

        let outcome = match raw.error {
            Some(error) if !error.is_null() => Err(LinkError::Remote(describe_error(&error))),
            _ => Ok(raw.result.unwrap_or(Value::Null)),
        };
        Ok(Incoming::Reply { id, outcome })
    }
}

/// Flatten a JSON-RPC error object into a readable message.
fn describe_error(error: &Value) -> String {
    match error {
        Value::String(message) => message.clone(),
        Value::Object(fields) => match (fields.get("code"), fields.get("message")) {
            (Some(code), Some(Value::String(message))) => format!("{message} (code {code})"),
            (None, Some(Value::String(message))) => message.clone(),
            _ => error.to_string(),
        },
        _ => error.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn serialize_call_and_notification() {
        let call = serde_json::to_value(Request::call(3, "connect", json!({"a": 1}))).unwrap();
        assert_eq!(
            call,
            json!({"jsonrpc": "2.0", "method": "connect", "params": {"a": 1}, "id": 3})
        );

        let note = serde_json::to_value(Request::notification("read", Value::Null)).unwrap();
        assert_eq!(note, json!({"jsonrpc": "2.0", "method": "read"}));
    }

    #[test]
    fn serialize_response() {
        let resp = serde_json::to_value(Response::result(json!(7), json!(42))).unwrap();
        assert_eq!(resp, json!({"jsonrpc": "2.0", "id": 7, "result": 42}));
    }

    #[test]
    fn parse_inbound_call() {
        let msg = Incoming::parse(r#"{"jsonrpc":"2.0","method":"ping","id":"x"}"#).unwrap();
        assert_eq!(
            msg,
            Incoming::Call {
                id: Some(json!("x")),
                method: "ping".to_string(),
                params: Value::Null,
            }
        );

        let msg = Incoming::parse(
            r#"{"jsonrpc":"2.0","method":"didDiscoverPeripheral","params":{"peripheralId":"P1"}}"#,
        )
        .unwrap();
        assert!(matches!(msg, Incoming::Call { id: None, .. }));
    }

    #[test]
    fn parse_replies() {
        let ok = Incoming::parse(r#"{"jsonrpc":"2.0","id":4,"result":null}"#).unwrap();
        assert_eq!(
            ok,
            Incoming::Reply {
                id: 4,
                outcome: Ok(Value::Null)
            }
        );

        let err = Incoming::parse(
            r#"{"jsonrpc":"2.0","id":5,"error":{"code":-32000,"message":"port busy"}}"#,
        )
        .unwrap();
        assert_eq!(
            err,
            Incoming::Reply {
                id: 5,
                outcome: Err(LinkError::Remote("port busy (code -32000)".to_string()))
            }
        );
    }

    #[test]
    fn reject_garbage() {
        assert!(matches!(
            Incoming::parse("not json"),
            Err(LinkError::Protocol(_))
        ));
        assert!(matches!(
            Incoming::parse(r#"{"jsonrpc":"2.0","result":1}"#),
            Err(LinkError::Protocol(_))
        ));
    }
}
