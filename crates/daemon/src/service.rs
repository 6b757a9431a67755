// Shadowlink - Service Facade
//
// The single dispatch surface the outer layers call. Every action
// answers with a ServiceResult envelope (200, 500, or 600); errors are
// folded into the envelope instead of bubbling out.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use shadowlink_common::{
    link, ProxyKind, ProxyProfile, Result, ServiceRequest, ServiceResult, Settings,
};

use crate::client::ClientManager;

/// Reads the system clipboard. Injected so tests and headless builds
/// can substitute their own source.
#[async_trait]
pub trait ClipboardReader: Send + Sync {
    async fn read_text(&self) -> Result<String>;
}

/// Renders a share link into an inline image data URL.
pub trait QrRenderer: Send + Sync {
    fn render_data_url(&self, contents: &str) -> Result<String>;
}

pub struct MainService {
    manager: Arc<ClientManager>,
    clipboard: Arc<dyn ClipboardReader>,
    qr: Arc<dyn QrRenderer>,
}

impl MainService {
    pub fn new(
        manager: Arc<ClientManager>,
        clipboard: Arc<dyn ClipboardReader>,
        qr: Arc<dyn QrRenderer>,
    ) -> Self {
        Self {
            manager,
            clipboard,
            qr,
        }
    }

    pub async fn dispatch(&self, request: ServiceRequest) -> ServiceResult {
        match request {
            ServiceRequest::IsConnected => self.is_connected().await,
            ServiceRequest::StartClient { profile, settings } => {
                self.start_client(profile, settings).await
            }
            ServiceRequest::StopClient => self.stop_client().await,
            ServiceRequest::ParseClipboardText { text } => self.parse_clipboard_text(text).await,
            ServiceRequest::GenerateUrlFromConfig { profile } => {
                self.generate_url_from_config(&profile)
            }
        }
    }

    async fn is_connected(&self) -> ServiceResult {
        ServiceResult::ok(json!(self.manager.is_connected().await))
    }

    async fn start_client(&self, profile: ProxyProfile, settings: Settings) -> ServiceResult {
        if profile.validate().is_err() {
            let dump = serde_json::to_string(&profile).unwrap_or_default();
            return ServiceResult::err(format!("Invalid Conf: {dump}"));
        }
        match self.manager.start(profile, settings).await {
            Ok(()) => ServiceResult::ok(Value::Null),
            Err(err) => ServiceResult::from(&err),
        }
    }

    async fn stop_client(&self) -> ServiceResult {
        match self.manager.stop().await {
            Ok(()) => ServiceResult::ok(Value::Null),
            Err(err) => ServiceResult::from(&err),
        }
    }

    /// Scan the given text, or the clipboard when no text came along,
    /// and return every share link found as a profile.
    async fn parse_clipboard_text(&self, text: Option<String>) -> ServiceResult {
        let text = match text {
            Some(text) if !text.is_empty() => text,
            _ => match self.clipboard.read_text().await {
                Ok(text) => text,
                Err(err) => return ServiceResult::from(&err),
            },
        };
        let profiles = link::parse(&text);
        debug!(count = profiles.len(), "parsed share links from text");
        match serde_json::to_value(&profiles) {
            Ok(value) => ServiceResult::ok(value),
            Err(err) => ServiceResult::err(err.to_string()),
        }
    }

    fn generate_url_from_config(&self, profile: &ProxyProfile) -> ServiceResult {
        let url = match profile.kind {
            ProxyKind::Ss => link::generate_ss(profile, false),
            ProxyKind::Ssr => link::generate_ssr(profile),
            // Deliberate: http profiles have no share link form.
            ProxyKind::Http => {
                return ServiceResult::err("http profiles cannot be exported as a share link")
            }
        };
        match self.qr.render_data_url(&url) {
            Ok(data_url) => ServiceResult::ok(json!({ "url": url, "dataUrl": data_url })),
            Err(err) => ServiceResult::from(&err),
        }
    }
}
