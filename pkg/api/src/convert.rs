// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.

//! Conversions between the in-memory model and the store wire format.

use crate::attachment::{DebugAttachment, Metadata, Spec, State, Status};
use crate::proto::v1 as pb;
use crate::store::StoreError;

impl From<State> for pb::State {
    fn from(state: State) -> Self {
        match state {
            State::RequestingAttachment => pb::State::RequestingAttachment,
            State::PendingAttachment => pb::State::PendingAttachment,
            State::Attached => pb::State::Attached,
            State::RequestingDelete => pb::State::RequestingDelete,
            State::PendingDelete => pb::State::PendingDelete,
        }
    }
}

impl From<pb::State> for State {
    fn from(state: pb::State) -> Self {
        match state {
            pb::State::RequestingAttachment => State::RequestingAttachment,
            pb::State::PendingAttachment => State::PendingAttachment,
            pb::State::Attached => State::Attached,
            pb::State::RequestingDelete => State::RequestingDelete,
            pb::State::PendingDelete => State::PendingDelete,
        }
    }
}

impl From<DebugAttachment> for pb::DebugAttachment {
    fn from(att: DebugAttachment) -> Self {
        pb::DebugAttachment {
            namespace: att.metadata.namespace,
            name: att.metadata.name,
            pod: att.spec.pod,
            container: att.spec.container,
            debugger: att.spec.debugger.to_string(),
            process_match: att.spec.process_match.unwrap_or_default(),
            image: att.spec.image,
            state: pb::State::from(att.status.state) as i32,
            debug_server_address: att.status.debug_server_address,
        }
    }
}

impl TryFrom<pb::DebugAttachment> for DebugAttachment {
    type Error = StoreError;

    fn try_from(msg: pb::DebugAttachment) -> Result<Self, Self::Error> {
        let debugger = msg.debugger.parse().map_err(|_| StoreError::Malformed {
            context: format!("debugger type {:?}", msg.debugger),
        })?;
        let state = pb::State::try_from(msg.state).map_err(|_| StoreError::Malformed {
            context: format!("state {}", msg.state),
        })?;
        Ok(DebugAttachment {
            metadata: Metadata {
                namespace: msg.namespace,
                name: msg.name,
            },
            spec: Spec {
                pod: msg.pod,
                container: msg.container,
                debugger,
                process_match: if msg.process_match.is_empty() {
                    None
                } else {
                    Some(msg.process_match)
                },
                image: msg.image,
            },
            status: Status {
                state: state.into(),
                debug_server_address: msg.debug_server_address,
            },
        })
    }
}
