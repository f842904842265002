//! CDP wire format
//!
//! Only the envelope types live here; domain payloads stay as `Value` until
//! a caller actually needs a field.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Call id, monotonically increasing per connection.
pub type CallId = u64;

/// Target id assigned by the engine.
pub type TargetId = String;

/// Session id for a flat-attached target.
pub type SessionId = String;

/// Outgoing command.
#[derive(Debug, Clone, Serialize)]
pub struct CdpCall {
    pub id: CallId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

/// Reply to a command.
#[derive(Debug, Clone, Deserialize)]
pub struct CdpReply {
    pub id: CallId,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<ReplyError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplyError {
    pub code: i64,
    pub message: String,
}

/// Unsolicited event.
#[derive(Debug, Clone, Deserialize)]
pub struct CdpEvent {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<SessionId>,
}

/// Anything the engine may send. Replies carry an id, events do not, so the
/// untagged deserialization is unambiguous.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CdpMessage {
    Reply(CdpReply),
    Event(CdpEvent),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_skips_empty_fields() {
        let call = CdpCall {
            id: 7,
            method: "Browser.getVersion".to_string(),
            params: None,
            session_id: None,
        };
        let json = serde_json::to_string(&call).unwrap();
        assert_eq!(json, r#"{"id":7,"method":"Browser.getVersion"}"#);
    }

    #[test]
    fn test_message_discrimination() {
        let reply: CdpMessage =
            serde_json::from_str(r#"{"id":1,"result":{"ok":true}}"#).unwrap();
        assert!(matches!(reply, CdpMessage::Reply(_)));

        let event: CdpMessage = serde_json::from_str(
            r#"{"method":"Page.loadEventFired","params":{"timestamp":1.0},"sessionId":"S1"}"#,
        )
        .unwrap();
        match event {
            CdpMessage::Event(ev) => {
                assert_eq!(ev.method, "Page.loadEventFired");
                assert_eq!(ev.session_id.as_deref(), Some("S1"));
            }
            _ => panic!("expected event"),
        }
    }

    #[test]
    fn test_reply_error() {
        let reply: CdpReply = serde_json::from_str(
            r#"{"id":3,"error":{"code":-32000,"message":"No target with given id"}}"#,
        )
        .unwrap();
        assert_eq!(reply.error.unwrap().code, -32000);
    }
}
