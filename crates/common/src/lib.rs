// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Shadowlink Contributors

// Shadowlink - Common Library
// Shared types, share-link codec, and network helpers

pub mod error;
pub mod link;
pub mod network;
pub mod types;

pub use error::{Error, Result};
pub use link::{generate_ss, generate_ssr, parse};
pub use network::{format_host_port, is_loopback_address, local_port_available};
pub use types::{
    ClientEvent, ClientState, ProxyKind, ProxyProfile, RouteMode, ServiceRequest, ServiceResult,
    Settings,
};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
pub use uuid::Uuid;
