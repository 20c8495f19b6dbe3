// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.

//! Data model and store access for squash debug attachments.
//!
//! A [`DebugAttachment`] is the declarative resource describing one debug
//! session. squashctl creates it, squashd reconciles it, and the per-session
//! agent updates it; they share nothing else. The store behind the
//! [`AttachmentStore`] trait is in-memory inside squashd ([`MemoryStore`])
//! and reached over its unix socket from everywhere else ([`RemoteStore`]).

pub mod attachment;
pub mod convert;
pub mod memory;
pub mod remote;
pub mod store;

pub mod proto {
    #[allow(clippy::all)]
    pub mod v1 {
        include!(concat!(env!("OUT_DIR"), "/squash.v1.rs"));
    }
}

pub use attachment::{DebugAttachment, DebuggerType, Metadata, Spec, State, Status};
pub use memory::MemoryStore;
pub use remote::RemoteStore;
pub use store::{AttachmentSnapshots, AttachmentStore, DeleteOpts, StoreError, WriteOpts};

/// Default unix socket squashd serves the store on.
pub const DEFAULT_STORE_SOCKET: &str = "/var/run/squash/squashd.sock";
