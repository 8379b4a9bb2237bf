//! `kiln dev`: serves a template file as a form version document and pushes
//! update events over a Pusher-compatible websocket when the file changes.

use axum::Json;
use axum::Router;
use axum::extract::Path as AxumPath;
use axum::extract::State as AxumState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use kiln_core::document::{ApiDataItem, ApiDataItems};
use kiln_core::{ApiDataResponse, FormDefinition};
use kiln_web::channel_name;
use kiln_web::sync::NAMESPACED_UPDATE_EVENT;
use kiln_web::transport::{self, PusherMessage};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

const DEBOUNCE_WINDOW: Duration = Duration::from_millis(120);
const FALLBACK_SWEEP: Duration = Duration::from_millis(1500);

struct DevState {
    template: PathBuf,
    data: Option<PathBuf>,
    id: String,
    version: AtomicU64,
    sockets: AtomicU64,
    update_tx: broadcast::Sender<u64>,
}

impl DevState {
    fn new(template: PathBuf, data: Option<PathBuf>, id: String) -> Self {
        Self {
            template,
            data,
            id,
            version: AtomicU64::new(0),
            sockets: AtomicU64::new(0),
            update_tx: broadcast::channel(256).0,
        }
    }

    fn watched(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.template.clone()];
        paths.extend(self.data.clone());
        paths
    }
}

pub async fn run_dev_server(
    template: PathBuf,
    data: Option<PathBuf>,
    id: String,
    port: u16,
) -> Result<(), String> {
    let template = template
        .canonicalize()
        .map_err(|e| format!("failed to resolve {}: {e}", template.display()))?;
    let data = data
        .map(|path| {
            path.canonicalize()
                .map_err(|e| format!("failed to resolve {}: {e}", path.display()))
        })
        .transpose()?;
    load_document(&template, data.as_deref(), &id, 0)?;

    let state = Arc::new(DevState::new(template.clone(), data, id.clone()));
    let watcher_state = Arc::clone(&state);
    tokio::spawn(async move {
        watch_loop(watcher_state).await;
    });

    let app = router(Arc::clone(&state));
    let host = format!("0.0.0.0:{port}");
    println!("kiln dev");
    println!("Template: {}", template.display());
    println!("Document: http://localhost:{port}/api/form-versions/{id}/data");
    println!("Socket:   ws://localhost:{port}/app/{{key}}");
    println!("Channels: {}, {}", channel_name(&id, false), channel_name(&id, true));

    let listener = tokio::net::TcpListener::bind(&host)
        .await
        .map_err(|e| format!("failed to bind {host}: {e}"))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("server failed: {e}"))
}

fn router(state: Arc<DevState>) -> Router {
    Router::new()
        .route("/api/form-versions/{id}/data", get(document_route))
        .route("/app/{key}", get(socket_route))
        .with_state(state)
}

/// Builds the data endpoint response from the template file and the optional
/// prior-values file (a JSON object keyed by field id).
fn load_document(
    template: &Path,
    data: Option<&Path>,
    id: &str,
    version: u64,
) -> Result<ApiDataResponse, String> {
    let source = fs::read_to_string(template)
        .map_err(|e| format!("failed to read {}: {e}", template.display()))?;
    let form_template = FormDefinition::from_json(&source)
        .map_err(|e| format!("invalid template {}: {e}", template.display()))?;

    let mut items = Vec::new();
    if let Some(path) = data {
        let raw = fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
        let values: Value = serde_json::from_str(&raw)
            .map_err(|e| format!("invalid JSON in {}: {e}", path.display()))?;
        let Value::Object(values) = values else {
            return Err(format!("{} must hold a JSON object", path.display()));
        };
        items = values
            .into_iter()
            .map(|(id, value)| ApiDataItem {
                id: Some(id),
                value,
            })
            .collect();
    }

    Ok(ApiDataResponse {
        form_template,
        form_version: Some(json!({"id": id, "version": version})),
        logs: json!([]),
        data: ApiDataItems { items },
    })
}

async fn document_route(
    AxumPath(id): AxumPath<String>,
    AxumState(state): AxumState<Arc<DevState>>,
) -> Response {
    if id != state.id {
        return (StatusCode::NOT_FOUND, format!("unknown form version {id}")).into_response();
    }
    let template = state.template.clone();
    let data = state.data.clone();
    let version = state.version.load(Ordering::SeqCst);
    let loaded = tokio::task::spawn_blocking(move || {
        load_document(&template, data.as_deref(), &id, version)
    })
    .await
    .map_err(|e| e.to_string())
    .and_then(|result| result);

    match loaded {
        Ok(document) => Json(document).into_response(),
        Err(message) => {
            warn!(%message, "document unavailable");
            (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
        }
    }
}

async fn socket_route(
    ws: WebSocketUpgrade,
    AxumPath(key): AxumPath<String>,
    AxumState(state): AxumState<Arc<DevState>>,
) -> Response {
    debug!(%key, "socket upgrade");
    ws.on_upgrade(move |socket| handle_pusher_socket(socket, state))
}

async fn handle_pusher_socket(mut socket: WebSocket, state: Arc<DevState>) {
    let n = state.sockets.fetch_add(1, Ordering::SeqCst) + 1;
    let socket_id = format!("{}.{n}", std::process::id());
    let established = PusherMessage::new(
        transport::CONNECTION_ESTABLISHED,
        None,
        json!({"socket_id": socket_id, "activity_timeout": 30}),
    );
    if socket
        .send(Message::Text(established.encode_for_client().into()))
        .await
        .is_err()
    {
        return;
    }
    info!(%socket_id, "client connected");

    let mut rx = state.update_tx.subscribe();
    let mut channels = BTreeSet::new();
    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = reply_to(text.as_str(), &mut channels) {
                            let frame = reply.encode_for_client();
                            if socket.send(Message::Text(frame.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
            }
            next = rx.recv() => {
                match next {
                    Ok(version) => {
                        for frame in update_frames(&state.id, version, &channels) {
                            if socket.send(Message::Text(frame.encode_for_client().into())).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
    debug!(%socket_id, "client gone");
}

/// Server side of the client frames: subscriptions and pings.
fn reply_to(text: &str, channels: &mut BTreeSet<String>) -> Option<PusherMessage> {
    let message = PusherMessage::decode(text).ok()?;
    let channel = message
        .data
        .get("channel")
        .and_then(Value::as_str)
        .map(str::to_string);
    match message.event.as_str() {
        transport::SUBSCRIBE => {
            let channel = channel?;
            channels.insert(channel.clone());
            debug!(%channel, "subscribed");
            Some(PusherMessage::new(
                transport::SUBSCRIPTION_SUCCEEDED,
                Some(channel),
                json!({}),
            ))
        }
        transport::UNSUBSCRIBE => {
            if let Some(channel) = channel {
                channels.remove(&channel);
            }
            None
        }
        transport::PING => Some(PusherMessage::new(transport::PONG, None, json!({}))),
        _ => None,
    }
}

/// One update event per subscribed channel of this form version.
fn update_frames(id: &str, version: u64, subscribed: &BTreeSet<String>) -> Vec<PusherMessage> {
    [channel_name(id, false), channel_name(id, true)]
        .into_iter()
        .filter(|channel| subscribed.contains(channel))
        .map(|channel| {
            PusherMessage::new(
                NAMESPACED_UPDATE_EVENT,
                Some(channel),
                json!({"formVersionId": id, "version": version}),
            )
        })
        .collect()
}

async fn watch_loop(state: Arc<DevState>) {
    let watched = state.watched();
    let mut last = compute_fingerprint(&watched);
    let mut fallback_interval = tokio::time::interval(FALLBACK_SWEEP);
    let mut notify = start_fs_watcher(&watched).ok();

    if notify.is_some() {
        info!("filesystem watcher active (event-driven + fallback sweep)");
    } else {
        warn!("filesystem watcher unavailable; polling only");
    }

    loop {
        if let Some((_, rx)) = notify.as_mut() {
            tokio::select! {
                _ = fallback_interval.tick() => {
                    check_and_broadcast_if_changed(&state, &mut last).await;
                }
                evt = rx.recv() => {
                    match evt {
                        Some(_) => {
                            debounce_fs_events(rx).await;
                            check_and_broadcast_if_changed(&state, &mut last).await;
                        }
                        None => {
                            warn!("filesystem watcher channel closed; polling only");
                            notify = None;
                        }
                    }
                }
            }
        } else {
            fallback_interval.tick().await;
            check_and_broadcast_if_changed(&state, &mut last).await;
        }
    }
}

async fn check_and_broadcast_if_changed(state: &Arc<DevState>, last: &mut u64) {
    let watched = state.watched();
    let now = tokio::task::spawn_blocking(move || compute_fingerprint(&watched))
        .await
        .unwrap_or(*last);
    if now == *last {
        return;
    }
    *last = now;

    let template = state.template.clone();
    let parsed = tokio::task::spawn_blocking(move || {
        fs::read_to_string(&template)
            .map_err(|e| e.to_string())
            .and_then(|source| FormDefinition::from_json(&source).map_err(|e| e.to_string()))
    })
    .await
    .map_err(|e| e.to_string())
    .and_then(|result| result);
    if let Err(error) = parsed {
        warn!(%error, "template changed but does not parse; not broadcasting");
        return;
    }

    let next = state.version.fetch_add(1, Ordering::SeqCst) + 1;
    let _ = state.update_tx.send(next);
    info!(version = next, "template change broadcast");
}

async fn debounce_fs_events(rx: &mut mpsc::UnboundedReceiver<()>) {
    let mut deadline = Instant::now() + DEBOUNCE_WINDOW;
    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => break,
            maybe = rx.recv() => {
                if maybe.is_none() {
                    break;
                }
                deadline = Instant::now() + DEBOUNCE_WINDOW;
                sleep.as_mut().reset(deadline);
            }
        }
    }
}

fn start_fs_watcher(
    files: &[PathBuf],
) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<()>), String> {
    let (tx, rx) = mpsc::unbounded_channel::<()>();
    let targets = files.to_vec();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            if event_is_relevant(&event, &targets) {
                let _ = tx.send(());
            }
        }
        Err(_) => {
            let _ = tx.send(());
        }
    })
    .map_err(|e| format!("failed to initialize filesystem watcher: {e}"))?;

    // Editors often replace files, so watch the directories.
    let dirs: BTreeSet<&Path> = files.iter().filter_map(|f| f.parent()).collect();
    for dir in dirs {
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| format!("failed to watch {}: {e}", dir.display()))?;
    }

    Ok((watcher, rx))
}

fn event_is_relevant(event: &Event, files: &[PathBuf]) -> bool {
    event.paths.iter().any(|path| {
        files
            .iter()
            .any(|file| path == file || (path.file_name().is_some() && path.file_name() == file.file_name()))
    })
}

fn compute_fingerprint(files: &[PathBuf]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for path in files {
        path.to_string_lossy().hash(&mut hasher);
        if let Ok(meta) = fs::metadata(path) {
            meta.len().hash(&mut hasher);
            if let Ok(modified) = meta.modified() {
                if let Ok(duration) = modified.duration_since(std::time::UNIX_EPOCH) {
                    duration.as_secs().hash(&mut hasher);
                    duration.subsec_nanos().hash(&mut hasher);
                }
            }
        }
        // Same-size edits within one mtime tick only show up in the bytes.
        if let Ok(bytes) = fs::read(path) {
            bytes.hash(&mut hasher);
        }
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::unique_temp_dir;

    const TEMPLATE: &str = r#"{"id": 3, "data": {"items": [{"id": "name", "type": "text-input"}]}}"#;

    fn dev_state(root: &Path, data: Option<&str>) -> Arc<DevState> {
        let template = root.join("form.json");
        fs::write(&template, TEMPLATE).expect("write template");
        let data = data.map(|raw| {
            let path = root.join("data.json");
            fs::write(&path, raw).expect("write data");
            path
        });
        Arc::new(DevState::new(template, data, "3".to_string()))
    }

    #[test]
    fn fingerprint_detects_same_size_edit() {
        let root = unique_temp_dir("kiln-watch");
        let file = root.join("form.json");

        fs::write(&file, r#"{"a":"A"}"#).expect("write initial");
        let before = compute_fingerprint(std::slice::from_ref(&file));
        fs::write(&file, r#"{"a":"B"}"#).expect("write modified");
        let after = compute_fingerprint(std::slice::from_ref(&file));

        assert_ne!(before, after);
    }

    #[test]
    fn document_carries_template_and_prior_values() {
        let root = unique_temp_dir("kiln-doc");
        let state = dev_state(&root, Some(r#"{"name": "Ada"}"#));
        let doc = load_document(&state.template, state.data.as_deref(), "3", 4).expect("document");

        assert_eq!(doc.form_template.id, json!(3));
        assert_eq!(doc.form_version, Some(json!({"id": "3", "version": 4})));
        assert_eq!(doc.data.items.len(), 1);
        assert_eq!(doc.data.items[0].id.as_deref(), Some("name"));
        assert_eq!(doc.data.items[0].value, json!("Ada"));
    }

    #[tokio::test]
    async fn document_route_serves_only_its_id() {
        let root = unique_temp_dir("kiln-route");
        let state = dev_state(&root, None);

        let found = document_route(AxumPath("3".to_string()), AxumState(Arc::clone(&state))).await;
        assert_eq!(found.status(), StatusCode::OK);

        let missing = document_route(AxumPath("4".to_string()), AxumState(state)).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn subscriptions_and_pings_are_answered() {
        let mut channels = BTreeSet::new();
        let reply = reply_to(
            &PusherMessage::subscribe("form-version.3").encode(),
            &mut channels,
        )
        .expect("reply");
        assert_eq!(reply.event, transport::SUBSCRIPTION_SUCCEEDED);
        assert_eq!(reply.channel.as_deref(), Some("form-version.3"));
        assert!(channels.contains("form-version.3"));

        let pong = reply_to(r#"{"event":"pusher:ping","data":{}}"#, &mut channels).expect("pong");
        assert_eq!(pong.event, transport::PONG);

        assert!(reply_to(&PusherMessage::unsubscribe("form-version.3").encode(), &mut channels).is_none());
        assert!(channels.is_empty());
    }

    #[test]
    fn updates_go_to_subscribed_channels_only() {
        let channels = BTreeSet::from(["draft-form-version.3".to_string()]);
        let frames = update_frames("3", 2, &channels);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].channel.as_deref(), Some("draft-form-version.3"));
        assert_eq!(frames[0].event, NAMESPACED_UPDATE_EVENT);

        let both = BTreeSet::from([
            "form-version.3".to_string(),
            "draft-form-version.3".to_string(),
        ]);
        assert_eq!(update_frames("3", 2, &both).len(), 2);
    }

    #[tokio::test]
    async fn change_broadcasts_a_new_version() {
        let root = unique_temp_dir("kiln-broadcast");
        let state = dev_state(&root, None);
        let mut rx = state.update_tx.subscribe();
        let mut last = compute_fingerprint(&state.watched());

        check_and_broadcast_if_changed(&state, &mut last).await;
        assert!(rx.try_recv().is_err());

        fs::write(
            &state.template,
            r#"{"id": 3, "data": {"items": [{"id": "name", "type": "text-input"}, {"id": "b", "type": "text-input"}]}}"#,
        )
        .expect("rewrite");
        check_and_broadcast_if_changed(&state, &mut last).await;
        assert_eq!(rx.try_recv().expect("version"), 1);

        fs::write(&state.template, "{ broken").expect("break");
        check_and_broadcast_if_changed(&state, &mut last).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_waits_for_a_quiet_window() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let start = Instant::now();
        tx.send(()).expect("send");
        let _open = tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = tx.send(());
        });
        debounce_fs_events(&mut rx).await;
        assert!(start.elapsed() >= Duration::from_millis(220));
    }
}
