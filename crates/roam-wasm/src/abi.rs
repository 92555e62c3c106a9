//! The JSON event ABI spoken between the runtime and behavior modules.
//!
//! The host delivers one [`AgentEvent`] per invocation on the module's
//! stdin and reads one [`AgentReply`] back from its stdout. A module that
//! writes nothing leaves its state unchanged and requests nothing.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Which lifecycle point an invocation represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// First creation on the originating base
    Create,
    /// Arrival on a new base after migration
    Arrival,
    /// The agent's main body
    Run,
    /// An envelope addressed to the agent has arrived
    Message,
    /// The agent is about to be dispatched
    Dispatch,
    /// The agent is about to be destroyed
    Destroy,
    /// The agent is about to be put to sleep
    Sleep,
    /// The agent is being woken up
    Awake,
}

/// Mail carried into a `message` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mail {
    /// Envelope kind
    pub kind: String,
    /// Envelope textual content
    pub content: String,
    /// Envelope binary payload
    #[serde(default)]
    pub payload: Vec<u8>,
}

/// One invocation of a behavior module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    /// Lifecycle point being delivered
    pub event: EventKind,
    /// Name of the agent instance
    pub name: String,
    /// Current agent state
    #[serde(default)]
    pub state: serde_json::Value,
    /// Mail, present only for `message` events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mail: Option<Mail>,
}

impl AgentEvent {
    /// Event without mail
    pub fn new(event: EventKind, name: impl Into<String>, state: serde_json::Value) -> Self {
        Self {
            event,
            name: name.into(),
            state,
            mail: None,
        }
    }

    /// Attach mail to the event
    pub fn with_mail(mut self, mail: Mail) -> Self {
        self.mail = Some(mail);
        self
    }
}

/// A transition the module asks its host for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Directive {
    /// Migrate to the base at `host`:`port`
    Dispatch {
        /// Destination host
        host: IpAddr,
        /// Destination port
        port: u16,
    },
    /// Destroy this agent
    Destroy,
    /// Put this agent to sleep
    Sleep,
}

/// What a behavior module hands back after an invocation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentReply {
    /// Successor state; `None` leaves the state unchanged
    #[serde(default)]
    pub state: Option<serde_json::Value>,
    /// Requested transition, if any
    #[serde(default)]
    pub directive: Option<Directive>,
}
