//! Process-wide store that exposes form state to code outside the render
//! tree.
//!
//! Values written with [`Bridge::set_state`] are mirrored to subscribers.
//! Fields register an accessor; once registrations pause for the quiet
//! period, the installed init hook receives the accessor map, once per
//! registration burst.
//!
//! Listener callbacks run outside the store lock, on the thread that wrote
//! first. Writes from that thread while its listeners run, through
//! `set_state` or a [`FieldRef`], are dropped so a listener that writes back
//! cannot start a notification cycle. Writes from other threads meanwhile are
//! queued and delivered by the active notifier.

use crate::config::BridgeConfig;
use kiln_core::ItemKind;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::thread::{self, ThreadId};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Per-field operations a registered field exposes.
pub trait FieldAccessor: Send + Sync {
    fn get_value(&self) -> Value;
    /// Returns whether the write was accepted.
    fn set_value(&self, value: Value) -> bool;
    fn validate(&self) -> Option<String>;
    fn get_error(&self) -> Option<String>;
    fn set_error(&self, error: Option<String>);
    fn field_type(&self) -> ItemKind;
    fn is_group_field(&self) -> bool;
    fn group_id(&self) -> Option<String>;
    fn group_index(&self) -> Option<usize>;
}

pub type StateListener = Arc<dyn Fn(&Map<String, Value>) + Send + Sync>;
pub type FieldListener = Arc<dyn Fn(&Value, &str) + Send + Sync>;
pub type InitHook = Arc<dyn Fn(&Bridge, &FieldRefs) + Send + Sync>;
pub type FieldRefs = BTreeMap<String, FieldRef>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationStatus {
    pub total_fields: usize,
    pub registered_fields: Vec<String>,
    pub initialized: bool,
    pub epoch: u64,
    pub hook_installed: bool,
    pub settling: bool,
}

#[derive(Default)]
struct Inner {
    values: Map<String, Value>,
    listeners: BTreeMap<SubscriptionId, StateListener>,
    field_listeners: BTreeMap<String, BTreeMap<SubscriptionId, FieldListener>>,
    accessors: BTreeMap<String, Arc<dyn FieldAccessor>>,
    init_hook: Option<InitHook>,
    initialized: bool,
    /// Completed initializations.
    epoch: u64,
    pending_settle: bool,
    last_registration: Option<Instant>,
    next_id: u64,
    /// Thread currently delivering notifications.
    notifier: Option<ThreadId>,
    pending: VecDeque<(String, Value)>,
}

pub struct Bridge {
    self_ref: Weak<Bridge>,
    config: BridgeConfig,
    inner: Mutex<Inner>,
    registered: Notify,
    script_ready: Notify,
}

/// Releases the notifier slot when delivery stops, even on panic.
struct NotifierGuard<'a>(&'a Bridge);

impl Drop for NotifierGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.0.inner();
        if inner.notifier == Some(thread::current().id()) {
            inner.notifier = None;
        }
    }
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            config,
            inner: Mutex::new(Inner::default()),
            registered: Notify::new(),
            script_ready: Notify::new(),
        })
    }

    /// The page-wide instance, created with default timings on first use.
    pub fn global() -> Arc<Bridge> {
        static GLOBAL: OnceLock<Arc<Bridge>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Bridge::new(BridgeConfig::default()))
            .clone()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_notifying(&self) -> bool {
        self.inner().notifier.is_some()
    }

    /// Stores `value` and notifies when it differs from the stored one.
    /// Returns whether the change was published.
    pub fn set_state(&self, field_id: &str, value: Value) -> bool {
        self.publish(field_id, value, false)
    }

    pub fn get_state(&self, field_id: &str) -> Option<Value> {
        self.inner().values.get(field_id).cloned()
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        self.inner().values.clone()
    }

    /// Stores `value` and queues a notification, then delivers the queue
    /// unless another thread is already delivering it. Unchanged values are
    /// only queued when `force` is set.
    fn publish(&self, field_id: &str, value: Value, force: bool) -> bool {
        let current = thread::current().id();
        let deliver = {
            let mut inner = self.inner();
            if inner.notifier == Some(current) {
                debug!(field = field_id, "write during notification dropped");
                return false;
            }
            let previous = inner.values.insert(field_id.to_string(), value.clone());
            if !force && previous.as_ref() == Some(&value) {
                return false;
            }
            inner.pending.push_back((field_id.to_string(), value));
            if inner.notifier.is_some() {
                false
            } else {
                inner.notifier = Some(current);
                true
            }
        };
        if deliver {
            self.deliver();
        }
        true
    }

    fn deliver(&self) {
        let _guard = NotifierGuard(self);
        loop {
            let (field_id, value, snapshot, listeners, field_listeners) = {
                let mut inner = self.inner();
                let Some((field_id, value)) = inner.pending.pop_front() else {
                    inner.notifier = None;
                    return;
                };
                let listeners: Vec<StateListener> = inner.listeners.values().cloned().collect();
                let field_listeners: Vec<FieldListener> = inner
                    .field_listeners
                    .get(&field_id)
                    .map(|m| m.values().cloned().collect())
                    .unwrap_or_default();
                (field_id, value, inner.values.clone(), listeners, field_listeners)
            };

            for listener in listeners {
                if catch_unwind(AssertUnwindSafe(|| listener(&snapshot))).is_err() {
                    warn!(field = %field_id, "state listener panicked");
                }
            }
            for listener in field_listeners {
                if catch_unwind(AssertUnwindSafe(|| listener(&value, &field_id))).is_err() {
                    warn!(field = %field_id, "field listener panicked");
                }
            }
        }
    }

    fn next_id(inner: &mut Inner) -> SubscriptionId {
        inner.next_id += 1;
        SubscriptionId(inner.next_id)
    }

    pub fn subscribe(&self, listener: impl Fn(&Map<String, Value>) + Send + Sync + 'static) -> SubscriptionId {
        let mut inner = self.inner();
        let id = Self::next_id(&mut inner);
        inner.listeners.insert(id, Arc::new(listener));
        id
    }

    pub fn subscribe_to_field(
        &self,
        field_id: &str,
        listener: impl Fn(&Value, &str) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let mut inner = self.inner();
        let id = Self::next_id(&mut inner);
        inner
            .field_listeners
            .entry(field_id.to_string())
            .or_default()
            .insert(id, Arc::new(listener));
        id
    }

    /// Removes a listener added by either subscribe call.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner();
        if inner.listeners.remove(&id).is_some() {
            return true;
        }
        let mut removed = false;
        inner.field_listeners.retain(|_, listeners| {
            removed |= listeners.remove(&id).is_some();
            !listeners.is_empty()
        });
        removed
    }

    /// Registers a field and restarts the quiet period. A non-empty current
    /// value is copied into the store without notifying.
    pub fn register_field(&self, field_id: &str, accessor: Arc<dyn FieldAccessor>) {
        let current = accessor.get_value();
        {
            let mut inner = self.inner();
            if !is_blank(&current) {
                inner.values.insert(field_id.to_string(), current);
            }
            inner.accessors.insert(field_id.to_string(), accessor);
            inner.pending_settle = true;
            inner.last_registration = Some(Instant::now());
        }
        self.registered.notify_one();
    }

    pub fn get_field_ref(&self, field_id: &str) -> Option<FieldRef> {
        let accessor = self.inner().accessors.get(field_id).cloned()?;
        Some(self.field_ref(field_id, accessor))
    }

    pub fn get_all_field_refs(&self) -> FieldRefs {
        let accessors: Vec<(String, Arc<dyn FieldAccessor>)> = self
            .inner()
            .accessors
            .iter()
            .map(|(id, a)| (id.clone(), a.clone()))
            .collect();
        accessors
            .into_iter()
            .map(|(id, accessor)| {
                let field_ref = self.field_ref(&id, accessor);
                (id, field_ref)
            })
            .collect()
    }

    fn field_ref(&self, field_id: &str, accessor: Arc<dyn FieldAccessor>) -> FieldRef {
        FieldRef {
            field_id: field_id.to_string(),
            accessor,
            bridge: self.self_ref.clone(),
        }
    }

    /// Drops every registration whose id fails `keep`, with its stored value.
    /// Returns the dropped ids.
    pub fn retain_fields(&self, keep: impl Fn(&str) -> bool) -> Vec<String> {
        let mut inner = self.inner();
        let dropped: Vec<String> = inner
            .accessors
            .keys()
            .filter(|id| !keep(id))
            .cloned()
            .collect();
        for id in &dropped {
            inner.accessors.remove(id);
            inner.values.remove(id);
        }
        dropped
    }

    pub fn has_registrations(&self) -> bool {
        !self.inner().accessors.is_empty()
    }

    pub fn registration_status(&self) -> RegistrationStatus {
        let inner = self.inner();
        RegistrationStatus {
            total_fields: inner.accessors.len(),
            registered_fields: inner.accessors.keys().cloned().collect(),
            initialized: inner.initialized,
            epoch: inner.epoch,
            hook_installed: inner.init_hook.is_some(),
            settling: inner.pending_settle,
        }
    }

    /// Forgets every field, field listener and stored value, and cancels a
    /// pending initialization. Called when a new session starts.
    pub fn clear_registrations(&self) {
        let mut inner = self.inner();
        inner.accessors.clear();
        inner.field_listeners.clear();
        inner.values.clear();
        inner.initialized = false;
        inner.pending_settle = false;
        inner.last_registration = None;
        info!("bridge registrations cleared");
    }

    pub fn set_init_hook(&self, hook: impl Fn(&Bridge, &FieldRefs) + Send + Sync + 'static) {
        self.inner().init_hook = Some(Arc::new(hook));
    }

    /// Hands the accessor map to the init hook unless it already ran for the
    /// current burst. Returns whether the hook ran.
    pub fn initialize(&self) -> bool {
        let (hook, accessors) = {
            let inner = self.inner();
            let Some(hook) = inner.init_hook.clone() else {
                debug!("init hook not installed yet, will retry");
                return false;
            };
            if inner.initialized {
                debug!("external script already initialized");
                return false;
            }
            if inner.accessors.is_empty() {
                debug!("no fields registered, skipping initialization");
                return false;
            }
            let accessors: Vec<(String, Arc<dyn FieldAccessor>)> = inner
                .accessors
                .iter()
                .map(|(id, a)| (id.clone(), a.clone()))
                .collect();
            (hook, accessors)
        };

        // Pull fresh values before the hook sees the refs.
        let fresh: Vec<(String, Value)> = accessors
            .iter()
            .map(|(id, a)| (id.clone(), a.get_value()))
            .filter(|(_, v)| !is_blank(v))
            .collect();
        let refs: FieldRefs = accessors
            .into_iter()
            .map(|(id, accessor)| {
                let field_ref = self.field_ref(&id, accessor);
                (id, field_ref)
            })
            .collect();
        {
            let mut inner = self.inner();
            for (id, value) in fresh {
                inner.values.insert(id, value);
            }
            inner.initialized = true;
        }

        if catch_unwind(AssertUnwindSafe(|| hook(self, &refs))).is_err() {
            warn!("init hook panicked");
            self.inner().initialized = false;
            return false;
        }
        let epoch = {
            let mut inner = self.inner();
            inner.epoch += 1;
            inner.epoch
        };
        info!(fields = refs.len(), epoch, "external script initialized");
        true
    }

    pub fn reinitialize(&self) -> bool {
        self.inner().initialized = false;
        self.initialize()
    }

    /// Runs the pending initialization if the last registration is at least
    /// one quiet period old.
    pub fn settle_if_quiet(&self, now: Instant) -> bool {
        {
            let mut inner = self.inner();
            let quiet = inner
                .last_registration
                .is_some_and(|at| now.saturating_duration_since(at) >= self.config.quiet_period());
            if !inner.pending_settle || !quiet {
                return false;
            }
            inner.pending_settle = false;
        }
        debug!("field registration settled");
        self.reinitialize()
    }

    /// The embedding script announced it is ready; initialization is retried
    /// after the configured delay by the watcher.
    pub fn signal_script_ready(&self) {
        self.script_ready.notify_one();
    }

    /// Drives quiet-period settling and script-ready retries. Abort the
    /// handle when the page goes away.
    pub fn spawn_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            let quiet = bridge.config.quiet_period();
            loop {
                tokio::select! {
                    _ = bridge.registered.notified() => {
                        let sleep = tokio::time::sleep(quiet);
                        tokio::pin!(sleep);
                        loop {
                            tokio::select! {
                                _ = &mut sleep => break,
                                _ = bridge.registered.notified() => {
                                    sleep.as_mut().reset(Instant::now() + quiet);
                                }
                            }
                        }
                        bridge.settle_if_quiet(Instant::now());
                    }
                    _ = bridge.script_ready.notified() => {
                        tokio::time::sleep(bridge.config.script_ready_delay()).await;
                        debug!("script ready, re-running initialization");
                        bridge.reinitialize();
                    }
                }
            }
        })
    }

    /// Accessor write: update the field, store, then notify once.
    fn write_through(&self, field_id: &str, accessor: &dyn FieldAccessor, value: Value) -> bool {
        if self.inner().notifier == Some(thread::current().id()) {
            debug!(field = field_id, "field ref write during notification dropped");
            return false;
        }
        if !accessor.set_value(value.clone()) {
            return false;
        }
        self.publish(field_id, value, true)
    }
}

fn is_blank(value: &Value) -> bool {
    matches!(value, Value::Null) || value.as_str().is_some_and(str::is_empty)
}

/// Stable handle given to the init hook for one field.
#[derive(Clone)]
pub struct FieldRef {
    field_id: String,
    accessor: Arc<dyn FieldAccessor>,
    bridge: Weak<Bridge>,
}

impl FieldRef {
    pub fn field_id(&self) -> &str {
        &self.field_id
    }

    pub fn set_value(&self, value: Value) -> bool {
        match self.bridge.upgrade() {
            Some(bridge) => bridge.write_through(&self.field_id, self.accessor.as_ref(), value),
            None => self.accessor.set_value(value),
        }
    }

    /// The field's own value when non-empty, else the stored one, else `""`.
    pub fn get_value(&self) -> Value {
        let current = self.accessor.get_value();
        let bridge = self.bridge.upgrade();
        if !is_blank(&current) {
            if let Some(bridge) = &bridge {
                let mut inner = bridge.inner();
                if inner.values.get(&self.field_id) != Some(&current) {
                    inner.values.insert(self.field_id.clone(), current.clone());
                }
            }
            return current;
        }
        bridge
            .and_then(|b| b.get_state(&self.field_id))
            .filter(|v| !is_blank(v))
            .unwrap_or_else(|| Value::String(String::new()))
    }

    pub fn validate(&self) -> Option<String> {
        self.accessor.validate()
    }

    pub fn get_error(&self) -> Option<String> {
        self.accessor.get_error()
    }

    pub fn set_error(&self, error: Option<String>) {
        self.accessor.set_error(error);
    }

    pub fn field_type(&self) -> ItemKind {
        self.accessor.field_type()
    }

    pub fn is_group_field(&self) -> bool {
        self.accessor.is_group_field()
    }

    pub fn group_id(&self) -> Option<String> {
        self.accessor.group_id()
    }

    pub fn group_index(&self) -> Option<usize> {
        self.accessor.group_index()
    }
}

impl std::fmt::Debug for FieldRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldRef")
            .field("field_id", &self.field_id)
            .field("field_type", &self.accessor.field_type())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Stub {
        value: Mutex<Value>,
        error: Mutex<Option<String>>,
    }

    impl FieldAccessor for Stub {
        fn get_value(&self) -> Value {
            self.value.lock().expect("lock").clone()
        }
        fn set_value(&self, value: Value) -> bool {
            *self.value.lock().expect("lock") = value;
            true
        }
        fn validate(&self) -> Option<String> {
            None
        }
        fn get_error(&self) -> Option<String> {
            self.error.lock().expect("lock").clone()
        }
        fn set_error(&self, error: Option<String>) {
            *self.error.lock().expect("lock") = error;
        }
        fn field_type(&self) -> ItemKind {
            ItemKind::TextInput
        }
        fn is_group_field(&self) -> bool {
            false
        }
        fn group_id(&self) -> Option<String> {
            None
        }
        fn group_index(&self) -> Option<usize> {
            None
        }
    }

    #[test]
    fn unchanged_values_do_not_notify() {
        let bridge = Bridge::new(BridgeConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        bridge.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert!(bridge.set_state("a", json!(1)));
        assert!(!bridge.set_state("a", json!(1)));
        assert!(bridge.set_state("a", json!(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn writes_from_listeners_are_dropped() {
        let bridge = Bridge::new(BridgeConfig::default());
        let echo = Arc::downgrade(&bridge);
        bridge.subscribe_to_field("a", move |value, _| {
            if let Some(bridge) = echo.upgrade() {
                assert!(!bridge.set_state("a", json!(format!("{value}!"))));
                assert!(!bridge.set_state("b", json!("side effect")));
            }
        });
        assert!(bridge.set_state("a", json!("x")));
        assert_eq!(bridge.get_state("a"), Some(json!("x")));
        assert_eq!(bridge.get_state("b"), None);
        assert!(!bridge.is_notifying());
    }

    #[test]
    fn panicking_listeners_do_not_poison_the_store() {
        let bridge = Bridge::new(BridgeConfig::default());
        bridge.subscribe(|_| panic!("listener bug"));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        bridge.subscribe_to_field("a", move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        bridge.set_state("a", json!(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(bridge.set_state("a", json!(2)));
    }

    #[test]
    fn unsubscribe_removes_listeners() {
        let bridge = Bridge::new(BridgeConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let id = bridge.subscribe_to_field("a", move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert!(bridge.unsubscribe(id));
        assert!(!bridge.unsubscribe(id));
        bridge.set_state("a", json!(1));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn hook_runs_once_per_settled_burst() {
        let bridge = Bridge::new(BridgeConfig::default());
        let runs = Arc::new(AtomicUsize::new(0));
        let seen = runs.clone();
        bridge.set_init_hook(move |_, refs| {
            assert!(refs.contains_key("a"));
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let start = Instant::now();
        bridge.register_field("a", Arc::new(Stub::default()));
        assert!(!bridge.settle_if_quiet(start));
        let later = Instant::now() + Duration::from_millis(600);
        assert!(bridge.settle_if_quiet(later));
        assert!(!bridge.settle_if_quiet(later));
        assert!(!bridge.initialize());
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        bridge.register_field("b", Arc::new(Stub::default()));
        assert!(bridge.settle_if_quiet(Instant::now() + Duration::from_millis(600)));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(bridge.registration_status().epoch, 2);
    }

    #[test]
    fn clear_cancels_pending_initialization() {
        let bridge = Bridge::new(BridgeConfig::default());
        bridge.set_init_hook(|_, _| {});
        bridge.register_field("a", Arc::new(Stub::default()));
        bridge.set_state("a", json!("old session"));
        bridge.clear_registrations();
        assert!(!bridge.settle_if_quiet(Instant::now() + Duration::from_secs(5)));
        assert!(!bridge.has_registrations());
        assert_eq!(bridge.get_state("a"), None);
    }

    #[test]
    fn field_ref_writes_through_and_notifies_once() {
        let bridge = Bridge::new(BridgeConfig::default());
        let stub = Arc::new(Stub::default());
        bridge.register_field("a", stub.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        bridge.subscribe_to_field("a", move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let field = bridge.get_field_ref("a").expect("ref");
        assert!(field.set_value(json!("v")));
        assert_eq!(stub.get_value(), json!("v"));
        assert_eq!(bridge.get_state("a"), Some(json!("v")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        stub.set_value(json!(""));
        assert_eq!(field.get_value(), json!("v"));
        stub.set_value(json!("w"));
        assert_eq!(field.get_value(), json!("w"));
        assert_eq!(bridge.get_state("a"), Some(json!("w")));
    }

    #[test]
    fn writes_from_other_threads_during_delivery_are_not_lost() {
        let bridge = Bridge::new(BridgeConfig::default());
        let heard = Arc::new(Mutex::new(BTreeMap::<String, Vec<Value>>::new()));
        for field in ["a", "b"] {
            let heard = heard.clone();
            bridge.subscribe_to_field(field, move |value, field_id| {
                std::thread::sleep(Duration::from_micros(50));
                heard
                    .lock()
                    .expect("heard")
                    .entry(field_id.to_string())
                    .or_default()
                    .push(value.clone());
            });
        }

        std::thread::scope(|scope| {
            for field in ["a", "b"] {
                let bridge = &bridge;
                scope.spawn(move || {
                    for n in 0..50 {
                        assert!(bridge.set_state(field, json!(n)));
                    }
                });
            }
        });

        let heard = heard.lock().expect("heard");
        let expected: Vec<Value> = (0..50).map(|n| json!(n)).collect();
        assert_eq!(heard["a"], expected);
        assert_eq!(heard["b"], expected);
        assert!(!bridge.is_notifying());
    }

    #[test]
    fn retain_fields_drops_stale_registrations() {
        let bridge = Bridge::new(BridgeConfig::default());
        bridge.register_field("a", Arc::new(Stub::default()));
        bridge.register_field("b", Arc::new(Stub::default()));
        bridge.set_state("b", json!("old"));
        assert_eq!(bridge.retain_fields(|id| id == "a"), vec!["b".to_string()]);
        assert!(bridge.get_field_ref("b").is_none());
        assert_eq!(bridge.get_state("b"), None);
        assert_eq!(bridge.registration_status().registered_fields, vec!["a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_settles_after_the_quiet_period() {
        let bridge = Bridge::new(BridgeConfig::default());
        let runs = Arc::new(AtomicUsize::new(0));
        let seen = runs.clone();
        bridge.set_init_hook(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let watcher = bridge.spawn_watcher();

        bridge.register_field("a", Arc::new(Stub::default()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        bridge.register_field("b", Arc::new(Stub::default()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        watcher.abort();
    }
}
