// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle of a debug attachment. Transitions only move forward; see
/// [`State::can_transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// Created by the client, not yet claimed by the reconciler.
    RequestingAttachment,
    /// Claimed; an agent has been scheduled and owns the next transition.
    PendingAttachment,
    /// Debugger attached, address published. Steady state.
    Attached,
    /// Delete requested by the client or by a failed attach.
    RequestingDelete,
    /// Cleanup in progress; the resource disappears next.
    PendingDelete,
}

impl State {
    pub fn can_transition_to(self, next: State) -> bool {
        use State::*;
        matches!(
            (self, next),
            (RequestingAttachment, PendingAttachment)
                | (RequestingAttachment, RequestingDelete)
                | (PendingAttachment, Attached)
                | (PendingAttachment, RequestingDelete)
                | (Attached, RequestingDelete)
                | (RequestingDelete, PendingDelete)
        )
    }

    pub fn is_delete_path(self) -> bool {
        matches!(self, State::RequestingDelete | State::PendingDelete)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::RequestingAttachment => write!(f, "requesting-attachment"),
            State::PendingAttachment => write!(f, "pending-attachment"),
            State::Attached => write!(f, "attached"),
            State::RequestingDelete => write!(f, "requesting-delete"),
            State::PendingDelete => write!(f, "pending-delete"),
        }
    }
}

/// Supported debugger backends. Closed set: adding a backend means touching
/// every `match` over this type, which is the point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebuggerType {
    Dlv,
    Gdb,
    Java,
    Nodejs,
    Nodejs8,
    Python,
}

#[derive(Debug, Error)]
#[error("unknown debugger type: {0}")]
pub struct UnknownDebugger(pub String);

impl FromStr for DebuggerType {
    type Err = UnknownDebugger;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dlv" => Ok(DebuggerType::Dlv),
            "gdb" => Ok(DebuggerType::Gdb),
            "java" => Ok(DebuggerType::Java),
            "nodejs" => Ok(DebuggerType::Nodejs),
            "nodejs8" => Ok(DebuggerType::Nodejs8),
            "python" => Ok(DebuggerType::Python),
            other => Err(UnknownDebugger(other.to_string())),
        }
    }
}

impl fmt::Display for DebuggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DebuggerType::Dlv => "dlv",
            DebuggerType::Gdb => "gdb",
            DebuggerType::Java => "java",
            DebuggerType::Nodejs => "nodejs",
            DebuggerType::Nodejs8 => "nodejs8",
            DebuggerType::Python => "python",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Metadata {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spec {
    pub pod: String,
    pub container: String,
    pub debugger: DebuggerType,
    #[serde(default)]
    pub process_match: Option<String>,
    /// Denormalized image string, informational only.
    #[serde(default)]
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub state: State,
    /// host:port of the reachable debug endpoint. Empty until Attached.
    #[serde(default)]
    pub debug_server_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugAttachment {
    pub metadata: Metadata,
    pub spec: Spec,
    pub status: Status,
}

impl DebugAttachment {
    pub fn new(namespace: &str, name: &str, spec: Spec) -> Self {
        DebugAttachment {
            metadata: Metadata {
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            spec,
            status: Status {
                state: State::RequestingAttachment,
                debug_server_address: String::new(),
            },
        }
    }

    pub fn key(&self) -> (String, String) {
        (self.metadata.namespace.clone(), self.metadata.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions_allowed() {
        use State::*;
        assert!(RequestingAttachment.can_transition_to(PendingAttachment));
        assert!(PendingAttachment.can_transition_to(Attached));
        assert!(Attached.can_transition_to(RequestingDelete));
        assert!(RequestingDelete.can_transition_to(PendingDelete));
    }

    #[test]
    fn test_delete_reachable_before_attach() {
        use State::*;
        assert!(RequestingAttachment.can_transition_to(RequestingDelete));
        assert!(PendingAttachment.can_transition_to(RequestingDelete));
    }

    #[test]
    fn test_backward_transitions_rejected() {
        use State::*;
        assert!(!Attached.can_transition_to(PendingAttachment));
        assert!(!PendingDelete.can_transition_to(Attached));
        assert!(!PendingAttachment.can_transition_to(RequestingAttachment));
        assert!(!Attached.can_transition_to(Attached));
    }

    #[test]
    fn test_attached_only_after_pending() {
        use State::*;
        for state in [RequestingAttachment, Attached, RequestingDelete, PendingDelete] {
            assert!(!state.can_transition_to(Attached), "{state} -> Attached");
        }
    }

    #[test]
    fn test_json_round_trip() {
        let mut att = DebugAttachment::new(
            "default",
            "petclinic-dbg",
            Spec {
                pod: "petclinic".into(),
                container: "app".into(),
                debugger: DebuggerType::Java,
                process_match: Some("petclinic".into()),
                image: "example/petclinic:1".into(),
            },
        );
        att.status.state = State::Attached;
        att.status.debug_server_address = "10.0.0.4:5005".into();

        let json = serde_json::to_string(&att).unwrap();
        let back: DebugAttachment = serde_json::from_str(&json).unwrap();
        assert_eq!(back, att);
    }

    #[test]
    fn test_debugger_type_round_trip() {
        for name in ["dlv", "gdb", "java", "nodejs", "nodejs8", "python"] {
            let parsed: DebuggerType = name.parse().unwrap();
            assert_eq!(parsed.to_string(), name);
        }
        assert!("jdb".parse::<DebuggerType>().is_err());
    }

    #[test]
    fn test_new_attachment_starts_requesting() {
        let att = DebugAttachment::new(
            "default",
            "app-1-dbg",
            Spec {
                pod: "app-1".into(),
                container: "main".into(),
                debugger: DebuggerType::Dlv,
                process_match: None,
                image: String::new(),
            },
        );
        assert_eq!(att.status.state, State::RequestingAttachment);
        assert!(att.status.debug_server_address.is_empty());
        assert_eq!(att.metadata.to_string(), "default/app-1-dbg");
    }
}
