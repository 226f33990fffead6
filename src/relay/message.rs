//! Live-update protocol spoken by runtimes.
//!
//! Parsed only to log and emit events. Frames are relayed as received,
//! whether or not they parse.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum LiveUpdateMessage {
    Connected,

    Update { updates: Vec<UpdatePayload> },

    FullReload {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },

    Prune { paths: Vec<String> },

    Error { err: Value },

    Custom {
        event: String,
        #[serde(default)]
        data: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePayload {
    /// e.g. `js-update`, `css-update`
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
}

impl LiveUpdateMessage {
    /// `None` for anything that is not a known message.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Update { .. } => "update",
            Self::FullReload { .. } => "full-reload",
            Self::Prune { .. } => "prune",
            Self::Error { .. } => "error",
            Self::Custom { .. } => "custom",
        }
    }

    /// Short human summary for logs.
    pub fn summary(&self) -> String {
        match self {
            Self::Update { updates } => {
                let paths: Vec<&str> = updates.iter().map(|u| u.path.as_str()).collect();
                format!("update {}", paths.join(", "))
            }
            Self::FullReload { path: Some(path) } => format!("full-reload {path}"),
            Self::Prune { paths } => format!("prune {}", paths.join(", ")),
            Self::Error { err } => {
                let message = err.get("message").and_then(Value::as_str).unwrap_or("?");
                format!("error {message}")
            }
            Self::Custom { event, .. } => format!("custom {event}"),
            other => other.kind().to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_update() {
        let text = r#"{"type":"update","updates":[{"type":"js-update","path":"/src/App.tsx","timestamp":1}]}"#;
        let message = LiveUpdateMessage::parse(text).unwrap();
        assert_eq!(
            message,
            LiveUpdateMessage::Update {
                updates: vec![UpdatePayload {
                    kind: "js-update".into(),
                    path: "/src/App.tsx".into(),
                }]
            }
        );
        assert_eq!(message.summary(), "update /src/App.tsx");
    }

    #[test]
    fn test_parse_simple_kinds() {
        assert_eq!(
            LiveUpdateMessage::parse(r#"{"type":"connected"}"#),
            Some(LiveUpdateMessage::Connected)
        );
        assert_eq!(
            LiveUpdateMessage::parse(r#"{"type":"full-reload"}"#),
            Some(LiveUpdateMessage::FullReload { path: None })
        );
        let error = LiveUpdateMessage::parse(r#"{"type":"error","err":{"message":"boom"}}"#).unwrap();
        assert_eq!(error.summary(), "error boom");
    }

    #[test]
    fn test_unknown_is_none() {
        assert!(LiveUpdateMessage::parse(r#"{"type":"ping"}"#).is_none());
        assert!(LiveUpdateMessage::parse("not json").is_none());
    }
}
