// Shadowlink - Client Lifecycle
//
// Drives the disconnected -> connecting -> connected -> disconnecting
// cycle. Start and stop serialize on a lifecycle lock so one operation
// settles before the next begins; a stop issued mid-start cancels the
// attempt token first, so it never waits out a slow handshake.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use shadowlink_common::{
    local_port_available, ClientEvent, ClientState, Error, ProxyProfile, Result, Settings,
};

use crate::bridge::Bridge;
use crate::tunnel::{connector_for, TunnelHandle};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Snapshot of the active connection for status reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<Uuid>,
    pub remark: String,
    pub http_port: u16,
    pub https_port: u16,
}

struct ActiveClient {
    tunnel: Arc<TunnelHandle>,
    bridge: Bridge,
    summary: ActiveSummary,
}

pub struct ClientManager {
    state: RwLock<ClientState>,
    active: Mutex<Option<ActiveClient>>,
    // Held across a whole start or stop, never across idle time.
    lifecycle: Mutex<()>,
    // Cancellation token of the most recent start attempt.
    attempt: Mutex<Option<CancellationToken>>,
    events: broadcast::Sender<ClientEvent>,
}

impl ClientManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(ClientState::Disconnected),
            active: Mutex::new(None),
            lifecycle: Mutex::new(()),
            attempt: Mutex::new(None),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await.is_connected()
    }

    pub async fn status(&self) -> (ClientState, Option<ActiveSummary>) {
        let state = self.state().await;
        let active = self.active.lock().await.as_ref().map(|a| a.summary.clone());
        (state, active)
    }

    /// Start the client for `profile`, replacing any connection that is
    /// already up.
    pub async fn start(&self, profile: ProxyProfile, settings: Settings) -> Result<()> {
        profile.validate()?;

        let cancel = CancellationToken::new();
        *self.attempt.lock().await = Some(cancel.clone());

        let _lifecycle = self.lifecycle.lock().await;
        if cancel.is_cancelled() {
            return Err(Error::Canceled);
        }

        // Replace-on-start: tear the current connection down first so
        // the listen ports are free for rebinding.
        if self.state().await.is_connected() {
            self.set_state(ClientState::Disconnecting).await;
            let _ = self
                .teardown_active(Some("replaced by a new connection".into()))
                .await;
            self.set_state(ClientState::Disconnected).await;
        }

        self.set_state(ClientState::Connecting).await;
        self.emit(ClientEvent::connecting(profile.id));
        info!(
            remark = profile.display_remark(),
            kind = %profile.kind,
            "starting proxy client"
        );

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Canceled),
            result = self.establish(&profile, &settings) => result,
        };

        match result {
            Ok(active) => {
                let summary = active.summary.clone();
                *self.active.lock().await = Some(active);
                self.set_state(ClientState::Connected).await;
                self.emit(ClientEvent::connected(summary.profile_id));
                info!(
                    remark = %summary.remark,
                    http_port = summary.http_port,
                    https_port = summary.https_port,
                    "proxy client connected"
                );
                Ok(())
            }
            Err(err) => {
                self.set_state(ClientState::Disconnected).await;
                self.emit(ClientEvent::start_failed(err.to_string()));
                warn!(%err, "proxy client failed to start");
                Err(err)
            }
        }
    }

    /// Stop the client. Stopping an already disconnected client is a
    /// no-op; a stop during a pending start cancels that attempt.
    pub async fn stop(&self) -> Result<()> {
        if let Some(attempt) = self.attempt.lock().await.take() {
            attempt.cancel();
        }

        let _lifecycle = self.lifecycle.lock().await;
        if self.state().await == ClientState::Disconnected {
            return Ok(());
        }

        self.set_state(ClientState::Disconnecting).await;
        info!("stopping proxy client");
        let result = self.teardown_active(None).await;
        self.set_state(ClientState::Disconnected).await;
        result
    }

    async fn establish(&self, profile: &ProxyProfile, settings: &Settings) -> Result<ActiveClient> {
        // Port checks come first so a conflict reports immediately,
        // without waiting on the network.
        for port in [settings.http_port, settings.https_port] {
            if !local_port_available(port).await {
                return Err(Error::PortInUse { port });
            }
        }

        let connector = connector_for(profile);
        connector.verify().await?;

        let tunnel = Arc::new(TunnelHandle::new(connector));
        let bridge = Bridge::bind(
            settings.http_port,
            settings.https_port,
            Arc::downgrade(&tunnel),
        )
        .await?;

        Ok(ActiveClient {
            summary: ActiveSummary {
                profile_id: profile.id,
                remark: profile.display_remark().to_string(),
                http_port: settings.http_port,
                https_port: settings.https_port,
            },
            tunnel,
            bridge,
        })
    }

    /// Close the bridge and drop the tunnel. Best effort: a teardown
    /// error is reported, but the connection is gone regardless.
    async fn teardown_active(&self, reason: Option<String>) -> Result<()> {
        let active = self.active.lock().await.take();
        let result = match active {
            Some(ActiveClient { tunnel, bridge, .. }) => {
                // Dropping the tunnel revokes the bridge's weak handle
                // before the listeners wind down.
                drop(tunnel);
                bridge.shutdown().await
            }
            None => Ok(()),
        };
        if let Err(err) = &result {
            warn!(%err, "bridge teardown reported an error");
        }
        self.emit(ClientEvent::disconnected(reason));
        result
    }

    async fn set_state(&self, next: ClientState) {
        *self.state.write().await = next;
        debug!(state = %next, "client state changed");
    }

    fn emit(&self, event: ClientEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}

impl Default for ClientManager {
    fn default() -> Self {
        Self::new()
    }
}
