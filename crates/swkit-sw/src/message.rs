//! Messages exchanged between pages and the worker.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::oneshot;

/// Reply sent for a message whose `type` the worker does not handle.
pub const UNKNOWN_ACTION_REPLY: &str = "unknown action";

/// Worker → page message. Serializes as `{"type": "log", "data": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ClientMessage {
    Log(String),
}

impl ClientMessage {
    pub fn log(message: impl Into<String>) -> Self {
        Self::Log(message.into())
    }
}

/// Page → worker messages the worker understands.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
enum PageMessage {
    Action(String),
}

/// Cookie bridge operations reachable through the message protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieAction {
    Get,
    Set,
    Delete,
}

impl CookieAction {
    /// Parse a protocol action name such as `"get-cookie"`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "get-cookie" => Some(Self::Get),
            "set-cookie" => Some(Self::Set),
            "delete-cookie" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get-cookie",
            Self::Set => "set-cookie",
            Self::Delete => "delete-cookie",
        }
    }
}

/// How the worker treats an incoming message payload.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    /// Falsy payload (`null`, `false`, `0`, `""`): ignored.
    Empty,
    /// `{type: "action", data: <name>}`.
    Action(String),
    /// An object with some other shape.
    Unknown(JsonValue),
    /// A non-object payload, kept as its display text.
    NotAnObject(String),
}

impl IncomingMessage {
    pub fn classify(data: &JsonValue) -> Self {
        if is_falsy(data) {
            return Self::Empty;
        }

        if !data.is_object() {
            let text = match data {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Self::NotAnObject(text);
        }

        match serde_json::from_value::<PageMessage>(data.clone()) {
            Ok(PageMessage::Action(name)) => Self::Action(name),
            Err(_) => Self::Unknown(data.clone()),
        }
    }
}

fn is_falsy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::Bool(b) => !b,
        JsonValue::Number(n) => n.as_f64() == Some(0.0),
        JsonValue::String(s) => s.is_empty(),
        JsonValue::Array(_) | JsonValue::Object(_) => false,
    }
}

/// A message posted to the worker, with an optional reply port.
#[derive(Debug)]
pub struct MessageEvent {
    pub data: JsonValue,
    pub reply: Option<oneshot::Sender<JsonValue>>,
}

impl MessageEvent {
    pub fn new(data: JsonValue) -> Self {
        Self { data, reply: None }
    }

    /// Attach a reply port, returning the receiving end.
    pub fn with_reply(data: JsonValue) -> (Self, oneshot::Receiver<JsonValue>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                data,
                reply: Some(tx),
            },
            rx,
        )
    }

    /// Post `value` back on the reply port, if there is one.
    pub fn respond(&mut self, value: JsonValue) {
        if let Some(port) = self.reply.take() {
            // The page may have stopped listening.
            let _ = port.send(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_log_message_wire_shape() {
        let json = serde_json::to_value(ClientMessage::log("installed")).unwrap();
        assert_eq!(json, json!({ "type": "log", "data": "installed" }));
    }

    #[test]
    fn test_classify_action() {
        let msg = json!({ "type": "action", "data": "set-cookie" });
        assert_eq!(
            IncomingMessage::classify(&msg),
            IncomingMessage::Action("set-cookie".to_string())
        );
    }

    #[test]
    fn test_classify_unknown_object() {
        let msg = json!({ "type": "ping" });
        assert_eq!(IncomingMessage::classify(&msg), IncomingMessage::Unknown(msg.clone()));

        let bad_data = json!({ "type": "action", "data": 5 });
        assert!(matches!(
            IncomingMessage::classify(&bad_data),
            IncomingMessage::Unknown(_)
        ));
    }

    #[test]
    fn test_classify_non_object_and_empty() {
        assert_eq!(
            IncomingMessage::classify(&json!("hello")),
            IncomingMessage::NotAnObject("hello".to_string())
        );
        assert_eq!(
            IncomingMessage::classify(&json!(42)),
            IncomingMessage::NotAnObject("42".to_string())
        );
        assert_eq!(IncomingMessage::classify(&json!(null)), IncomingMessage::Empty);
        assert_eq!(IncomingMessage::classify(&json!("")), IncomingMessage::Empty);
    }

    #[test]
    fn test_cookie_action_names() {
        for action in [CookieAction::Get, CookieAction::Set, CookieAction::Delete] {
            assert_eq!(CookieAction::from_name(action.as_str()), Some(action));
        }
        assert_eq!(CookieAction::from_name("eat-cookie"), None);
    }

    #[tokio::test]
    async fn test_respond_only_once() {
        let (mut event, rx) = MessageEvent::with_reply(json!({}));
        event.respond(json!("first"));
        event.respond(json!("second"));
        assert_eq!(rx.await.unwrap(), json!("first"));
    }
}
