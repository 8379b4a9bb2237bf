//! Live template sync.
//!
//! Subscribes to the form version's channel and, on every update event,
//! re-fetches the document and swaps in the new template when it differs.
//! Connection trouble only changes the reported status; the session keeps
//! working either way.

use crate::accessor::{self, SharedSession};
use crate::api::FormApi;
use crate::bridge::Bridge;
use crate::config::{ReverbConfig, SyncConfig};
use crate::error::ApiError;
use crate::transport::{TransportCommand, TransportEvent, TransportHandle, spawn_pusher};
use kiln_core::{ApiDataResponse, FormSession};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

pub const UPDATE_EVENT: &str = "FormVersionUpdateEvent";
pub const NAMESPACED_UPDATE_EVENT: &str = "App\\Events\\FormVersionUpdateEvent";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// `draft-form-version.{id}` or `form-version.{id}`.
pub fn channel_name(form_version_id: &str, draft: bool) -> String {
    if draft {
        format!("draft-form-version.{form_version_id}")
    } else {
        format!("form-version.{form_version_id}")
    }
}

pub fn is_update_event(event: &str) -> bool {
    let event = event.strip_prefix('.').unwrap_or(event);
    event == UPDATE_EVENT || event == NAMESPACED_UPDATE_EVENT
}

/// Applies a fetched document. The template and logs are replaced only when
/// the template differs from the one held; returns whether it did.
pub fn merge_fetched(session: &mut FormSession, response: ApiDataResponse) -> bool {
    let ApiDataResponse {
        form_template,
        logs,
        ..
    } = response;
    if !session.adopt_template(form_template) {
        return false;
    }
    session.set_logs(logs);
    true
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    Idle,
    ScheduleRecheck,
    ScheduleSubscribe,
    CancelSubscribe,
    Subscribe(String),
    Refresh,
}

/// Connection bookkeeping, free of timers and I/O.
#[derive(Debug, Clone)]
pub struct SyncState {
    channel: String,
    status: ConnectionStatus,
    subscribed: bool,
}

impl SyncState {
    pub fn new(channel: String) -> Self {
        Self {
            channel,
            status: ConnectionStatus::Connecting,
            subscribed: false,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    pub fn on_event(&mut self, event: &TransportEvent) -> SyncAction {
        match event {
            TransportEvent::Connecting => {
                self.status = ConnectionStatus::Connecting;
                SyncAction::Idle
            }
            TransportEvent::Connected { socket_id: Some(_) } => self.mark_connected(),
            TransportEvent::Connected { socket_id: None } => {
                debug!("connected without a socket id, rechecking");
                SyncAction::ScheduleRecheck
            }
            TransportEvent::Disconnected => {
                self.status = ConnectionStatus::Disconnected;
                self.subscribed = false;
                SyncAction::CancelSubscribe
            }
            TransportEvent::Unavailable(reason) | TransportEvent::Error(reason) => {
                warn!(%reason, "live sync connection error");
                self.status = ConnectionStatus::Error;
                self.subscribed = false;
                SyncAction::CancelSubscribe
            }
            TransportEvent::Subscribed { channel } => {
                debug!(%channel, "subscribed");
                SyncAction::Idle
            }
            TransportEvent::SubscriptionError { channel, message } => {
                warn!(channel = channel.as_deref().unwrap_or(&self.channel), %message, "subscription rejected");
                SyncAction::Idle
            }
            TransportEvent::Message(message) => {
                let ours = message.channel.as_deref() == Some(self.channel.as_str());
                if ours && is_update_event(&message.event) {
                    info!(channel = %self.channel, "template update received");
                    SyncAction::Refresh
                } else {
                    SyncAction::Idle
                }
            }
        }
    }

    /// The delayed look at the socket id after a provisional connect.
    pub fn on_recheck(&mut self, socket_id: Option<&str>) -> SyncAction {
        match socket_id {
            Some(id) if !id.is_empty() => self.mark_connected(),
            _ => {
                debug!("still no socket id after recheck");
                SyncAction::Idle
            }
        }
    }

    pub fn on_subscribe_due(&mut self) -> SyncAction {
        if self.status != ConnectionStatus::Connected || self.subscribed {
            return SyncAction::Idle;
        }
        self.subscribed = true;
        SyncAction::Subscribe(self.channel.clone())
    }

    /// The channel to leave on teardown, if one was joined.
    pub fn leave(&mut self) -> Option<String> {
        std::mem::take(&mut self.subscribed).then(|| self.channel.clone())
    }

    fn mark_connected(&mut self) -> SyncAction {
        self.status = ConnectionStatus::Connected;
        if self.subscribed {
            SyncAction::Idle
        } else {
            SyncAction::ScheduleSubscribe
        }
    }
}

/// Where refreshed documents come from.
pub trait DocumentSource: Send + Sync + 'static {
    fn fetch(&self, form_version_id: &str, draft: bool) -> Result<ApiDataResponse, ApiError>;
}

impl DocumentSource for FormApi {
    fn fetch(&self, form_version_id: &str, draft: bool) -> Result<ApiDataResponse, ApiError> {
        self.fetch_document(form_version_id, draft)
    }
}

pub struct LiveSync {
    source: Arc<dyn DocumentSource>,
    session: SharedSession,
    bridge: Option<Arc<Bridge>>,
    form_version_id: String,
    draft: bool,
    config: SyncConfig,
}

/// Running sync task. Dropping it stops the task.
pub struct SyncHandle {
    status: watch::Receiver<ConnectionStatus>,
    refreshes: watch::Receiver<u64>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn status_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Counts template replacements.
    pub fn refresh_receiver(&self) -> watch::Receiver<u64> {
        self.refreshes.clone()
    }

    /// Leaves the channel and closes the transport.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = (&mut self.task).await;
    }
}

impl LiveSync {
    pub fn new(
        source: Arc<dyn DocumentSource>,
        session: SharedSession,
        form_version_id: impl Into<String>,
        draft: bool,
        config: SyncConfig,
    ) -> Self {
        Self {
            source,
            session,
            bridge: None,
            form_version_id: form_version_id.into(),
            draft,
            config,
        }
    }

    /// Re-registers fields with `bridge` whenever the template is replaced.
    pub fn with_bridge(mut self, bridge: Arc<Bridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn channel(&self) -> String {
        channel_name(&self.form_version_id, self.draft)
    }

    pub fn connect(self, reverb: &ReverbConfig) -> SyncHandle {
        self.start(spawn_pusher(reverb.socket_url()))
    }

    pub fn start(self, transport: TransportHandle) -> SyncHandle {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let (refresh_tx, refresh_rx) = watch::channel(0u64);
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(self.drive(transport, status_tx, refresh_tx, stop_rx));
        SyncHandle {
            status: status_rx,
            refreshes: refresh_rx,
            stop: Some(stop_tx),
            task,
        }
    }

    async fn drive(
        self,
        mut transport: TransportHandle,
        status: watch::Sender<ConnectionStatus>,
        refreshes: watch::Sender<u64>,
        mut stop: oneshot::Receiver<()>,
    ) {
        let mut state = SyncState::new(self.channel());
        let mut recheck_at: Option<Instant> = None;
        let mut subscribe_at: Option<Instant> = None;

        loop {
            let action = tokio::select! {
                _ = &mut stop => break,
                event = transport.events.recv() => match event {
                    Some(event) => state.on_event(&event),
                    None => {
                        if state.status() != ConnectionStatus::Error {
                            status.send_replace(ConnectionStatus::Disconnected);
                        }
                        break;
                    }
                },
                _ = wait_until(recheck_at) => {
                    recheck_at = None;
                    state.on_recheck(transport.socket_id().as_deref())
                }
                _ = wait_until(subscribe_at) => {
                    subscribe_at = None;
                    state.on_subscribe_due()
                }
            };
            status.send_if_modified(|current| {
                let changed = *current != state.status();
                *current = state.status();
                changed
            });

            match action {
                SyncAction::Idle => {}
                SyncAction::ScheduleRecheck => {
                    recheck_at = Some(Instant::now() + self.config.recheck_delay());
                }
                SyncAction::ScheduleSubscribe => {
                    subscribe_at = Some(Instant::now() + self.config.subscribe_delay());
                }
                SyncAction::CancelSubscribe => subscribe_at = None,
                SyncAction::Subscribe(channel) => {
                    info!(%channel, "subscribing");
                    transport.send(TransportCommand::Subscribe(channel));
                }
                SyncAction::Refresh => {
                    if self.refresh().await {
                        refreshes.send_modify(|count| *count += 1);
                    }
                }
            }
        }

        if let Some(channel) = state.leave() {
            debug!(%channel, "leaving channel");
            transport.send(TransportCommand::Unsubscribe(channel));
        }
        transport.shutdown().await;
    }

    async fn refresh(&self) -> bool {
        let source = Arc::clone(&self.source);
        let id = self.form_version_id.clone();
        let draft = self.draft;
        let fetched = tokio::task::spawn_blocking(move || source.fetch(&id, draft))
            .await
            .map_err(|err| ApiError::Join(err.to_string()))
            .and_then(|result| result);
        let response = match fetched {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "real-time refresh failed, keeping current template");
                return false;
            }
        };
        let replaced = merge_fetched(&mut accessor::lock(&self.session), response);
        if replaced {
            if let Some(bridge) = &self.bridge {
                accessor::register_fields(bridge, &self.session);
            }
        }
        replaced
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PusherMessage;
    use serde_json::json;

    fn update(channel: &str, event: &str) -> TransportEvent {
        TransportEvent::Message(PusherMessage::new(event, Some(channel.to_string()), json!({})))
    }

    #[test]
    fn channel_names_and_events() {
        assert_eq!(channel_name("12", true), "draft-form-version.12");
        assert_eq!(channel_name("12", false), "form-version.12");
        assert!(is_update_event("FormVersionUpdateEvent"));
        assert!(is_update_event(".FormVersionUpdateEvent"));
        assert!(is_update_event("App\\Events\\FormVersionUpdateEvent"));
        assert!(!is_update_event("FormVersionDeletedEvent"));
    }

    #[test]
    fn provisional_connect_waits_for_socket_id() {
        let mut state = SyncState::new(channel_name("1", false));
        assert_eq!(
            state.on_event(&TransportEvent::Connected { socket_id: None }),
            SyncAction::ScheduleRecheck
        );
        assert_eq!(state.status(), ConnectionStatus::Connecting);
        assert_eq!(state.on_recheck(None), SyncAction::Idle);
        assert_eq!(state.on_recheck(Some("1.2")), SyncAction::ScheduleSubscribe);
        assert_eq!(state.status(), ConnectionStatus::Connected);
        assert_eq!(
            state.on_subscribe_due(),
            SyncAction::Subscribe("form-version.1".to_string())
        );
        assert_eq!(state.on_subscribe_due(), SyncAction::Idle);
    }

    #[test]
    fn only_update_events_on_our_channel_refresh() {
        let mut state = SyncState::new(channel_name("1", true));
        assert_eq!(
            state.on_event(&update("draft-form-version.1", "FormVersionUpdateEvent")),
            SyncAction::Refresh
        );
        assert_eq!(
            state.on_event(&update("form-version.1", "FormVersionUpdateEvent")),
            SyncAction::Idle
        );
        assert_eq!(
            state.on_event(&update("draft-form-version.1", "SomethingElse")),
            SyncAction::Idle
        );
    }

    #[test]
    fn errors_and_disconnects_drop_the_subscription() {
        let mut state = SyncState::new(channel_name("1", false));
        state.on_event(&TransportEvent::Connected {
            socket_id: Some("1.1".into()),
        });
        state.on_subscribe_due();
        assert!(state.is_subscribed());

        state.on_event(&TransportEvent::Unavailable("refused".into()));
        assert_eq!(state.status(), ConnectionStatus::Error);
        assert_eq!(state.leave(), None);

        state.on_event(&TransportEvent::Connected {
            socket_id: Some("1.2".into()),
        });
        state.on_subscribe_due();
        assert_eq!(state.leave(), Some("form-version.1".to_string()));
        assert_eq!(state.leave(), None);
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(ConnectionStatus::Disconnected).expect("json"),
            json!("disconnected")
        );
    }
}
