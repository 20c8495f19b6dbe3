// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.

//! Per-session node agent: resolves a pod/container reference to a host
//! pid through the container runtime, attaches the requested debugger, and
//! serves the debug session until it ends.

pub mod agent;
pub mod backends;
pub mod cri;
pub mod locator;
pub mod ports;
pub mod procfs;
pub mod proxy;

pub mod proto {
    #[allow(clippy::all)]
    pub mod v1 {
        include!(concat!(env!("OUT_DIR"), "/runtime.v1.rs"));
    }
    #[allow(clippy::all)]
    pub mod v1alpha2 {
        include!(concat!(env!("OUT_DIR"), "/runtime.v1alpha2.rs"));
    }
}
