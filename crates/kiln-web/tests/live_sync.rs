use kiln_core::{ApiDataResponse, FormData, FormDefinition, FormSession};
use kiln_web::sync::merge_fetched;
use kiln_web::{
    ApiError, Bridge, BridgeConfig, ConnectionStatus, DocumentSource, LiveSync, PusherMessage,
    SharedSession, SyncConfig, TransportCommand, TransportEvent, TransportHandle, attach_session,
    share,
};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, timeout};

fn template(extra_field: bool) -> FormDefinition {
    let mut items = vec![json!({"id": "name", "type": "text-input", "label": "Name"})];
    if extra_field {
        items.push(json!({"id": "email", "type": "text-input", "label": "Email"}));
    }
    FormDefinition::from_value(json!({"id": "tpl", "data": {"items": items}})).expect("template")
}

fn session() -> SharedSession {
    let mut data = Map::new();
    data.insert("name".to_string(), json!("Ada"));
    share(FormSession::load(FormData {
        form_definition: template(false),
        logs: json!(["v1"]),
        data,
        ..FormData::default()
    }))
}

struct Fixed {
    response: Option<ApiDataResponse>,
    calls: AtomicUsize,
}

impl Fixed {
    fn serving(definition: FormDefinition, logs: Value) -> Arc<Self> {
        Arc::new(Self {
            response: Some(ApiDataResponse {
                form_template: definition,
                logs,
                ..ApiDataResponse::default()
            }),
            calls: AtomicUsize::new(0),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            response: None,
            calls: AtomicUsize::new(0),
        })
    }
}

impl DocumentSource for Fixed {
    fn fetch(&self, form_version_id: &str, _draft: bool) -> Result<ApiDataResponse, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.response.clone().ok_or_else(|| ApiError::Transport {
            method: "GET",
            url: format!("/api/form-versions/{form_version_id}/data"),
            message: "connection refused".to_string(),
        })
    }
}

struct Wire {
    events: mpsc::UnboundedSender<TransportEvent>,
    commands: mpsc::UnboundedReceiver<TransportCommand>,
    socket_id: watch::Sender<Option<String>>,
}

fn wire() -> (Wire, TransportHandle) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (socket_tx, socket_rx) = watch::channel(None);
    (
        Wire {
            events: event_tx,
            commands: command_rx,
            socket_id: socket_tx,
        },
        TransportHandle::from_channels(event_rx, command_tx, socket_rx),
    )
}

fn immediate() -> SyncConfig {
    SyncConfig {
        recheck_delay_ms: 0,
        subscribe_delay_ms: 0,
    }
}

fn update_event(channel: &str) -> TransportEvent {
    TransportEvent::Message(PusherMessage::new(
        "App\\Events\\FormVersionUpdateEvent",
        Some(channel.to_string()),
        json!({"formVersionId": "7"}),
    ))
}

#[tokio::test(start_paused = true)]
async fn provisional_connect_subscribes_after_recheck_and_delay() {
    let (mut wire, transport) = wire();
    let sync = LiveSync::new(
        Fixed::failing(),
        session(),
        "7",
        false,
        SyncConfig::default(),
    );
    let start = Instant::now();
    let handle = sync.start(transport);

    wire.events
        .send(TransportEvent::Connected { socket_id: None })
        .expect("send");
    wire.socket_id.send_replace(Some("10.20".to_string()));

    let command = wire.commands.recv().await.expect("subscribe");
    assert_eq!(command, TransportCommand::Subscribe("form-version.7".to_string()));
    assert!(start.elapsed() >= Duration::from_millis(1500));
    assert_eq!(handle.status(), ConnectionStatus::Connected);

    handle.stop().await;
    assert_eq!(
        wire.commands.recv().await,
        Some(TransportCommand::Unsubscribe("form-version.7".to_string()))
    );
    assert_eq!(wire.commands.recv().await, Some(TransportCommand::Close));
}

#[tokio::test(start_paused = true)]
async fn missing_socket_id_never_subscribes() {
    let (mut wire, transport) = wire();
    let handle = LiveSync::new(Fixed::failing(), session(), "7", true, SyncConfig::default())
        .start(transport);
    wire.events
        .send(TransportEvent::Connected { socket_id: None })
        .expect("send");

    assert!(
        timeout(Duration::from_secs(5), wire.commands.recv())
            .await
            .is_err()
    );
    assert_eq!(handle.status(), ConnectionStatus::Connecting);
    handle.stop().await;
}

#[tokio::test]
async fn update_event_swaps_template_and_keeps_values() {
    let session = session();
    let bridge = Bridge::new(BridgeConfig::default());
    attach_session(&bridge, &session);
    assert!(bridge.get_field_ref("email").is_none());

    let (mut wire, transport) = wire();
    let handle = LiveSync::new(
        Fixed::serving(template(true), json!(["v1", "v2"])),
        session.clone(),
        "7",
        true,
        immediate(),
    )
    .with_bridge(bridge.clone())
    .start(transport);

    wire.events
        .send(TransportEvent::Connected {
            socket_id: Some("1.1".to_string()),
        })
        .expect("send");
    assert_eq!(
        wire.commands.recv().await,
        Some(TransportCommand::Subscribe("draft-form-version.7".to_string()))
    );

    let mut refreshes = handle.refresh_receiver();
    wire.events
        .send(update_event("draft-form-version.7"))
        .expect("send");
    timeout(Duration::from_secs(5), refreshes.wait_for(|count| *count == 1))
        .await
        .expect("refresh in time")
        .expect("sync alive");

    {
        let guard = session.lock().expect("lock");
        assert!(guard.field("email").is_some());
        assert_eq!(guard.value("name"), Some(&json!("Ada")));
        assert_eq!(guard.logs(), &json!(["v1", "v2"]));
    }
    assert!(bridge.get_field_ref("email").is_some());
    assert_eq!(bridge.get_state("name"), Some(json!("Ada")));
    handle.stop().await;
}

#[tokio::test]
async fn failed_refresh_keeps_the_current_template() {
    let session = session();
    let source = Fixed::failing();
    let (wire, transport) = wire();
    let handle = LiveSync::new(source.clone(), session.clone(), "7", false, immediate())
        .start(transport);

    wire.events
        .send(TransportEvent::Connected {
            socket_id: Some("1.1".to_string()),
        })
        .expect("send");
    wire.events.send(update_event("form-version.7")).expect("send");
    // An update for another form version is ignored.
    wire.events.send(update_event("form-version.8")).expect("send");

    timeout(Duration::from_secs(5), async {
        while source.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("fetch attempted");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    assert_eq!(*handle.refresh_receiver().borrow(), 0);
    let guard = session.lock().expect("lock");
    assert!(guard.field("email").is_none());
    assert_eq!(guard.value("name"), Some(&json!("Ada")));
    drop(guard);
    handle.stop().await;
}

#[tokio::test]
async fn unavailable_transport_reports_error_and_leaves_the_session_usable() {
    let session = session();
    let (wire, transport) = wire();
    let handle = LiveSync::new(Fixed::failing(), session.clone(), "7", false, immediate())
        .start(transport);
    let mut status = handle.status_receiver();

    wire.events
        .send(TransportEvent::Unavailable("no reverb".to_string()))
        .expect("send");
    timeout(
        Duration::from_secs(5),
        status.wait_for(|s| *s == ConnectionStatus::Error),
    )
    .await
    .expect("status in time")
    .expect("sync alive");

    let mut guard = session.lock().expect("lock");
    assert_eq!(guard.handle_input_change("name", json!("Grace"), None), None);
    assert_eq!(guard.value("name"), Some(&json!("Grace")));
    drop(guard);
    handle.stop().await;
}

#[test]
fn merge_replaces_logs_only_with_a_new_template() {
    let shared = session();
    let mut guard = shared.lock().expect("lock");

    let same = ApiDataResponse {
        form_template: template(false),
        logs: json!(["ignored"]),
        ..ApiDataResponse::default()
    };
    assert!(!merge_fetched(&mut guard, same));
    assert_eq!(guard.logs(), &json!(["v1"]));

    let changed = ApiDataResponse {
        form_template: template(true),
        logs: json!(["v2"]),
        ..ApiDataResponse::default()
    };
    assert!(merge_fetched(&mut guard, changed));
    assert_eq!(guard.logs(), &json!(["v2"]));
    assert_eq!(guard.value("email"), Some(&json!("")));
}
