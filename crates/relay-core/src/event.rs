use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::OnceLock;

pub const LOGIN: &str = "Login";
pub const SUCCESS: &str = "Success";
pub const LOGOUT: &str = "Logout";
pub const ADD_EVENT_LISTENER: &str = "AddEventListener";
pub const REMOVE_EVENT_LISTENER: &str = "RemoveEventListener";
pub const SHUTDOWN: &str = "Shutdown";

/// A named, attributed unit of information routed between relay connections.
///
/// Events are immutable once built; the fields are only reachable through
/// accessors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    name: String,
    sender: String,
    payload: Value,
}

impl Event {
    pub fn new(name: impl Into<String>, sender: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            sender: sender.into(),
            payload,
        }
    }

    pub fn login(username: &str, credential: &str) -> Self {
        Self::new(LOGIN, username, Value::String(credential.to_string()))
    }

    pub fn success(ticket: &str) -> Self {
        Self::new(SUCCESS, ticket, Value::String(ticket.to_string()))
    }

    pub fn logout(ticket: &str) -> Self {
        Self::new(LOGOUT, ticket, Value::Null)
    }

    pub fn add_event_listener(ticket: &str, event_name: &str) -> Self {
        Self::new(
            ADD_EVENT_LISTENER,
            ticket,
            Value::String(event_name.to_string()),
        )
    }

    pub fn remove_event_listener(ticket: &str, event_name: &str) -> Self {
        Self::new(
            REMOVE_EVENT_LISTENER,
            ticket,
            Value::String(event_name.to_string()),
        )
    }

    pub fn shutdown(server_identity: &str, reason: &str) -> Self {
        Self::new(SHUTDOWN, server_identity, Value::String(reason.to_string()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Payload as an opaque string: JSON strings yield their contents,
    /// every other value its compact JSON text.
    pub fn payload_text(&self) -> String {
        match &self.payload {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }

    pub fn control(&self) -> ControlEvent {
        ControlEvent::classify(&self.name)
    }
}

/// Closed classification of an event name, computed once per decoded frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ControlEvent {
    Login,
    Success,
    Logout,
    Subscribe,
    Unsubscribe,
    Shutdown,
    Application(String),
}

impl ControlEvent {
    pub fn classify(name: &str) -> Self {
        match name {
            LOGIN => Self::Login,
            SUCCESS => Self::Success,
            LOGOUT => Self::Logout,
            ADD_EVENT_LISTENER => Self::Subscribe,
            REMOVE_EVENT_LISTENER => Self::Unsubscribe,
            SHUTDOWN => Self::Shutdown,
            other => Self::Application(other.to_string()),
        }
    }

    pub fn wire_name(&self) -> &str {
        match self {
            Self::Login => LOGIN,
            Self::Success => SUCCESS,
            Self::Logout => LOGOUT,
            Self::Subscribe => ADD_EVENT_LISTENER,
            Self::Unsubscribe => REMOVE_EVENT_LISTENER,
            Self::Shutdown => SHUTDOWN,
            Self::Application(name) => name,
        }
    }

    pub fn is_reserved(&self) -> bool {
        !matches!(self, Self::Application(_))
    }
}

impl fmt::Display for ControlEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

fn event_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_:\-]+(\.[A-Za-z0-9_:\-]+)*$").expect("valid regex")
    })
}

/// Dot-namespaced identifier such as `Doc.Changed` or `vDesk.Archive.Element.Moved`.
pub fn is_valid_event_name(name: &str) -> bool {
    event_name_pattern().is_match(name)
}
