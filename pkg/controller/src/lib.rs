// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.

//! squashd: serves the attachment store over a unix socket and reconciles
//! attachment state by launching one agent process per debug session.

pub mod grpc;
pub mod launcher;
pub mod reconciler;
