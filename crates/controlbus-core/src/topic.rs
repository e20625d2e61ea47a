//! Topic identity.
//!
//! A topic is identified by (component, kind, name). The broker-level topic
//! name embeds a namespace suffix ("subname") so that unit tests and
//! experiments are isolated from production traffic.

use serde::{Deserialize, Serialize};

/// The four kinds of topic a component exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TopicKind {
    /// Inbound commands for a component.
    Command,
    /// State-change events published by a component.
    Event,
    /// Periodic measurements published by a component.
    Telemetry,
    /// Command acknowledgments, correlated by (origin, seq_num).
    Ackcmd,
}

impl TopicKind {
    /// Prefix used when building the broker topic name.
    pub fn prefix(&self) -> &'static str {
        match self {
            TopicKind::Command => "cmd_",
            TopicKind::Event => "logevent_",
            TopicKind::Telemetry => "",
            TopicKind::Ackcmd => "",
        }
    }

    /// Commands and acknowledgments must never be discarded by throttling,
    /// whatever the settings say.
    pub fn never_throttled(&self) -> bool {
        matches!(self, TopicKind::Command | TopicKind::Ackcmd)
    }
}

/// Identity of one topic: component name, kind and topic name.
///
/// Immutable once a session starts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicKey {
    pub component: String,
    pub kind: TopicKind,
    pub name: String,
}

impl TopicKey {
    pub fn new(component: impl Into<String>, kind: TopicKind, name: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            kind,
            name: name.into(),
        }
    }

    /// The acknowledgment topic for a component; there is exactly one.
    pub fn ackcmd(component: impl Into<String>) -> Self {
        Self::new(component, TopicKind::Ackcmd, "ackcmd")
    }

    /// Fully qualified broker topic name, e.g. `"test.MTMount.cmd_start"`.
    pub fn broker_name(&self, subname: &str) -> String {
        format!(
            "{}.{}.{}{}",
            subname,
            self.component,
            self.kind.prefix(),
            self.name
        )
    }

    /// Schema registry subject for this topic's payload schema.
    pub fn subject(&self, subname: &str) -> String {
        format!("{}-value", self.broker_name(subname))
    }
}

impl std::fmt::Display for TopicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}{}", self.component, self.kind.prefix(), self.name)
    }
}
