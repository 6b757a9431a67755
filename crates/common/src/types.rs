// Common types for Shadowlink

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Share-link variant a profile belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    /// Base variant (`ss://`)
    Ss,
    /// Extended variant with obfuscation fields (`ssr://`)
    Ssr,
    /// Reserved; URL generation is intentionally unsupported
    Http,
}

impl ProxyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyKind::Ss => "ss",
            ProxyKind::Ssr => "ssr",
            ProxyKind::Http => "http",
        }
    }
}

impl std::fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_timeout() -> u64 {
    60
}

/// A saved or transient proxy server configuration.
///
/// Field names follow the facade's external JSON contract (camelCase,
/// `type` as the variant discriminator). The `id` is assigned by the
/// host application on persistence, never by the codec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,

    /// Display label; defaults to the host when blank
    #[serde(default)]
    pub remark: String,

    pub server_host: String,
    pub server_port: u16,

    /// Shared secret; empty string permitted (no-auth schemes)
    #[serde(default)]
    pub password: String,

    /// Cipher/auth-scheme identifier, scheme-dependent vocabulary
    pub encrypt_method: String,

    /// Obfuscation layer, extended variant only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_param: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obfs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obfs_param: Option<String>,

    #[serde(rename = "type")]
    pub kind: ProxyKind,

    /// Connection timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Transport-plugin identifier, opaque pass-through
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
}

impl ProxyProfile {
    /// Label shown to the user; falls back to the host when the remark is blank.
    pub fn display_remark(&self) -> &str {
        if self.remark.is_empty() {
            &self.server_host
        } else {
            &self.remark
        }
    }

    /// Connect timeout as a duration; a zero timeout is treated as the default.
    pub fn timeout_duration(&self) -> Duration {
        let secs = if self.timeout == 0 {
            default_timeout()
        } else {
            self.timeout
        };
        Duration::from_secs(secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_host.is_empty() {
            return Err(Error::Config("profile is missing a server host".into()));
        }
        if self.server_port == 0 {
            return Err(Error::Config("profile server port must be non-zero".into()));
        }
        if matches!(self.kind, ProxyKind::Ss | ProxyKind::Ssr) && self.encrypt_method.is_empty() {
            return Err(Error::Config(format!(
                "{} profile is missing an encryption method",
                self.kind
            )));
        }
        Ok(())
    }
}

/// Traffic routing mode selected in the host application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RouteMode {
    #[serde(rename = "PAC")]
    Pac,
    Global,
    #[default]
    Manual,
}

fn default_http_port() -> u16 {
    1095
}

fn default_https_port() -> u16 {
    1096
}

/// Global run configuration, loaded by the host application and passed
/// read-only into `startClient`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Local port for the plain HTTP proxy endpoint
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Local port for the HTTPS CONNECT endpoint
    #[serde(default = "default_https_port")]
    pub https_port: u16,

    #[serde(default)]
    pub mode: RouteMode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_server: Option<Uuid>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            https_port: default_https_port(),
            mode: RouteMode::default(),
            selected_server: None,
        }
    }
}

/// Coarse lifecycle state of the active client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ClientState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ClientState::Connected)
    }

    /// True while a start or stop is still settling
    pub fn is_in_progress(&self) -> bool {
        matches!(self, ClientState::Connecting | ClientState::Disconnecting)
    }
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClientState::Disconnected => "disconnected",
            ClientState::Connecting => "connecting",
            ClientState::Connected => "connected",
            ClientState::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

/// Lifecycle events pushed to subscribers (SSE feed, log task)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Connecting {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<Uuid>,
        timestamp: DateTime<Utc>,
    },
    Connected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<Uuid>,
        timestamp: DateTime<Utc>,
    },
    Disconnected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
    StartFailed {
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl ClientEvent {
    pub fn connecting(id: Option<Uuid>) -> Self {
        ClientEvent::Connecting {
            id,
            timestamp: Utc::now(),
        }
    }

    pub fn connected(id: Option<Uuid>) -> Self {
        ClientEvent::Connected {
            id,
            timestamp: Utc::now(),
        }
    }

    pub fn disconnected(reason: Option<String>) -> Self {
        ClientEvent::Disconnected {
            reason,
            timestamp: Utc::now(),
        }
    }

    pub fn start_failed(error: impl Into<String>) -> Self {
        ClientEvent::StartFailed {
            error: error.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Actions accepted by the service facade.
///
/// The envelope is `{"action": "...", "params": {...}}`; unit actions
/// may omit `params`. This is the shape both the HTTP API and the CLI
/// speak.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", content = "params", rename_all = "camelCase")]
pub enum ServiceRequest {
    IsConnected,
    StartClient {
        profile: ProxyProfile,
        #[serde(default)]
        settings: Settings,
    },
    StopClient,
    ParseClipboardText {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    GenerateUrlFromConfig {
        profile: ProxyProfile,
    },
}

/// Uniform envelope returned by every facade operation.
///
/// `code` 200 carries the payload in `result`; 500 carries a
/// human-readable message; 600 is reserved for "local port already in
/// use" and always carries `{"isInUse": true}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceResult {
    pub code: u16,
    pub result: Value,
}

impl ServiceResult {
    pub const OK: u16 = 200;
    pub const FAILED: u16 = 500;
    pub const PORT_IN_USE: u16 = 600;

    pub fn ok(result: Value) -> Self {
        Self {
            code: Self::OK,
            result,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            code: Self::FAILED,
            result: Value::String(message.into()),
        }
    }

    pub fn port_in_use() -> Self {
        Self {
            code: Self::PORT_IN_USE,
            result: json!({ "isInUse": true }),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == Self::OK
    }
}

impl From<&Error> for ServiceResult {
    fn from(err: &Error) -> Self {
        if err.is_port_conflict() {
            ServiceResult::port_in_use()
        } else {
            ServiceResult::err(err.to_string())
        }
    }
}
