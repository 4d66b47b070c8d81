//! The page side: log line and cookie status rendering.

use serde::Serialize;
use swkit_sw::{ClientMessage, CookieChangeEvent};

/// A worker broadcast as the page's log list shows it.
pub fn render_log(message: &ClientMessage) -> String {
    let ClientMessage::Log(data) = message;
    format!("SW: {data}")
}

#[derive(Debug, Serialize, PartialEq)]
struct ChangedCookie {
    name: String,
    value: String,
}

#[derive(Debug, Serialize, PartialEq)]
struct DeletedCookie {
    name: String,
}

/// `#cookie-status` contents for one change event.
#[derive(Debug, Serialize, PartialEq)]
pub struct CookieStatus {
    changes: Vec<ChangedCookie>,
    deletions: Vec<DeletedCookie>,
}

impl From<&CookieChangeEvent> for CookieStatus {
    fn from(event: &CookieChangeEvent) -> Self {
        Self {
            changes: event
                .changed
                .iter()
                .map(|c| ChangedCookie {
                    name: c.name.clone(),
                    value: c.value.clone(),
                })
                .collect(),
            deletions: event
                .deleted
                .iter()
                .map(|c| DeletedCookie {
                    name: c.name.clone(),
                })
                .collect(),
        }
    }
}

impl CookieStatus {
    pub fn to_pretty_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
