//! Cookie store contract, an in-memory store, and the worker's cookie bridge.

use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, trace};

use crate::ServiceWorkerError;

/// Capacity of the unfiltered page-side change feed.
const PAGE_FEED_CAPACITY: usize = 64;

// ==================== Records ====================

/// A cookie as seen through the cookie store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieRecord {
    pub name: String,
    pub value: String,
}

impl CookieRecord {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// JSON shape posted back over a reply port.
    pub fn to_json(&self) -> JsonValue {
        json!({ "name": self.name, "value": self.value })
    }
}

/// One cookie change notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieChangeEvent {
    pub changed: Vec<CookieRecord>,
    pub deleted: Vec<CookieRecord>,
}

impl CookieChangeEvent {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }
}

// ==================== Subscriptions ====================

/// How a subscription compares cookie names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchType {
    Equals,
    StartsWith,
}

/// A `{name, matchType}` change-subscription filter entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieSubscription {
    pub name: String,
    #[serde(rename = "matchType")]
    pub match_type: MatchType,
}

impl CookieSubscription {
    pub fn equals(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            match_type: MatchType::Equals,
        }
    }

    pub fn starts_with(prefix: impl Into<String>) -> Self {
        Self {
            name: prefix.into(),
            match_type: MatchType::StartsWith,
        }
    }

    pub fn matches(&self, cookie_name: &str) -> bool {
        match self.match_type {
            MatchType::Equals => cookie_name == self.name,
            MatchType::StartsWith => cookie_name.starts_with(&self.name),
        }
    }
}

/// Narrow `event` down to the cookies covered by `subscriptions`.
///
/// Returns `None` when nothing in the event is covered.
pub fn filter_change(
    subscriptions: &[CookieSubscription],
    event: &CookieChangeEvent,
) -> Option<CookieChangeEvent> {
    let covered = |c: &&CookieRecord| subscriptions.iter().any(|s| s.matches(&c.name));

    let filtered = CookieChangeEvent {
        changed: event.changed.iter().filter(covered).cloned().collect(),
        deleted: event.deleted.iter().filter(covered).cloned().collect(),
    };

    (!filtered.is_empty()).then_some(filtered)
}

// ==================== Store ====================

/// The cookie store as the worker sees it.
#[async_trait]
pub trait CookieStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<CookieRecord>, ServiceWorkerError>;

    async fn set(&self, name: &str, value: &str) -> Result<(), ServiceWorkerError>;

    /// Returns whether a cookie was removed.
    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError>;

    /// Register change subscriptions for the worker.
    async fn subscribe(
        &self,
        subscriptions: Vec<CookieSubscription>,
    ) -> Result<(), ServiceWorkerError>;
}

#[derive(Debug, Default)]
struct StoreState {
    cookies: HashMap<String, String>,
    subscriptions: Vec<CookieSubscription>,
}

/// In-memory cookie store.
///
/// Worker-facing change events are filtered by the registered subscriptions
/// and delivered over an mpsc channel; page contexts get every change via
/// [`MemoryCookieStore::listen`]. Mutations and their notifications happen
/// under one lock, so events arrive in occurrence order.
pub struct MemoryCookieStore {
    state: Mutex<StoreState>,
    worker_tx: mpsc::UnboundedSender<CookieChangeEvent>,
    page_tx: broadcast::Sender<CookieChangeEvent>,
}

impl MemoryCookieStore {
    /// Create a store and the receiver for worker change events.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CookieChangeEvent>) {
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let (page_tx, _) = broadcast::channel(PAGE_FEED_CAPACITY);

        (
            Self {
                state: Mutex::new(StoreState::default()),
                worker_tx,
                page_tx,
            },
            worker_rx,
        )
    }

    /// Unfiltered change feed, as a page's `cookieStore` change listener sees it.
    pub fn listen(&self) -> broadcast::Receiver<CookieChangeEvent> {
        self.page_tx.subscribe()
    }

    /// Current subscriptions.
    pub async fn subscriptions(&self) -> Vec<CookieSubscription> {
        self.state.lock().await.subscriptions.clone()
    }

    fn notify(&self, state: &StoreState, event: CookieChangeEvent) {
        // No page listeners is fine.
        let _ = self.page_tx.send(event.clone());

        if let Some(filtered) = filter_change(&state.subscriptions, &event) {
            trace!(?filtered, "Delivering cookie change to worker");
            if self.worker_tx.send(filtered).is_err() {
                debug!("Worker change receiver dropped");
            }
        }
    }
}

#[async_trait]
impl CookieStore for MemoryCookieStore {
    async fn get(&self, name: &str) -> Result<Option<CookieRecord>, ServiceWorkerError> {
        let state = self.state.lock().await;
        Ok(state
            .cookies
            .get(name)
            .map(|value| CookieRecord::new(name, value.clone())))
    }

    async fn set(&self, name: &str, value: &str) -> Result<(), ServiceWorkerError> {
        let mut state = self.state.lock().await;
        state.cookies.insert(name.to_string(), value.to_string());

        let event = CookieChangeEvent {
            changed: vec![CookieRecord::new(name, value)],
            deleted: Vec::new(),
        };
        self.notify(&state, event);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        let mut state = self.state.lock().await;
        let Some(value) = state.cookies.remove(name) else {
            return Ok(false);
        };

        let event = CookieChangeEvent {
            changed: Vec::new(),
            deleted: vec![CookieRecord::new(name, value)],
        };
        self.notify(&state, event);
        Ok(true)
    }

    async fn subscribe(
        &self,
        subscriptions: Vec<CookieSubscription>,
    ) -> Result<(), ServiceWorkerError> {
        let mut state = self.state.lock().await;
        for subscription in subscriptions {
            if !state.subscriptions.contains(&subscription) {
                state.subscriptions.push(subscription);
            }
        }
        Ok(())
    }
}

// ==================== Bridge ====================

/// The worker's view of one named cookie.
#[derive(Clone)]
pub struct CookieBridge {
    store: Option<Arc<dyn CookieStore>>,
    name: String,
    set_value: String,
}

impl CookieBridge {
    pub fn new(
        store: Option<Arc<dyn CookieStore>>,
        name: impl Into<String>,
        set_value: impl Into<String>,
    ) -> Self {
        Self {
            store,
            name: name.into(),
            set_value: set_value.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_available(&self) -> bool {
        self.store.is_some()
    }

    fn store(&self) -> Result<&Arc<dyn CookieStore>, ServiceWorkerError> {
        self.store
            .as_ref()
            .ok_or(ServiceWorkerError::CookieStoreUnavailable)
    }

    pub async fn get(&self) -> Result<Option<CookieRecord>, ServiceWorkerError> {
        self.store()?.get(&self.name).await
    }

    /// Set the cookie to the configured value, then read it back.
    pub async fn set_and_get(&self) -> Result<Option<CookieRecord>, ServiceWorkerError> {
        self.store()?.set(&self.name, &self.set_value).await?;
        self.get().await
    }

    pub async fn delete(&self) -> Result<bool, ServiceWorkerError> {
        self.store()?.delete(&self.name).await
    }

    pub async fn subscribe(
        &self,
        subscriptions: Vec<CookieSubscription>,
    ) -> Result<(), ServiceWorkerError> {
        self.store()?.subscribe(subscriptions).await
    }
}

impl std::fmt::Debug for CookieBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieBridge")
            .field("available", &self.is_available())
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_matching() {
        let exact = CookieSubscription::equals("session");
        assert!(exact.matches("session"));
        assert!(!exact.matches("session_id"));

        let prefix = CookieSubscription::starts_with("session");
        assert!(prefix.matches("session"));
        assert!(prefix.matches("session_id"));
        assert!(!prefix.matches("theme"));
    }

    #[test]
    fn test_subscription_wire_shape() {
        let json = serde_json::to_value(CookieSubscription::starts_with("session")).unwrap();
        assert_eq!(json, json!({ "name": "session", "matchType": "starts-with" }));
    }

    #[test]
    fn test_filter_change_keeps_only_covered() {
        let event = CookieChangeEvent {
            changed: vec![
                CookieRecord::new("session", "a"),
                CookieRecord::new("theme", "dark"),
            ],
            deleted: vec![CookieRecord::new("session_old", "b")],
        };

        let exact = filter_change(&[CookieSubscription::equals("session")], &event).unwrap();
        assert_eq!(exact.changed, vec![CookieRecord::new("session", "a")]);
        assert!(exact.deleted.is_empty());

        let prefix = filter_change(&[CookieSubscription::starts_with("session")], &event).unwrap();
        assert_eq!(prefix.deleted.len(), 1);

        assert!(filter_change(&[CookieSubscription::equals("other")], &event).is_none());
        assert!(filter_change(&[], &event).is_none());
    }

    #[tokio::test]
    async fn test_store_get_set_delete() {
        let (store, _rx) = MemoryCookieStore::new();

        assert_eq!(store.get("session").await.unwrap(), None);
        store.set("session", "one").await.unwrap();
        store.set("session", "two").await.unwrap();
        assert_eq!(
            store.get("session").await.unwrap(),
            Some(CookieRecord::new("session", "two"))
        );

        assert!(store.delete("session").await.unwrap());
        assert!(!store.delete("session").await.unwrap());
        assert_eq!(store.get("session").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_store_delivers_only_subscribed_changes_in_order() {
        let (store, mut rx) = MemoryCookieStore::new();

        // Nothing is delivered before a subscription exists.
        store.set("session", "early").await.unwrap();

        store
            .subscribe(vec![CookieSubscription::equals("session")])
            .await
            .unwrap();
        store.set("theme", "dark").await.unwrap();
        store.set("session", "late").await.unwrap();
        store.delete("session").await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.changed, vec![CookieRecord::new("session", "late")]);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.deleted, vec![CookieRecord::new("session", "late")]);

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_store_page_feed_is_unfiltered() {
        let (store, _rx) = MemoryCookieStore::new();
        let mut page = store.listen();

        store.set("theme", "dark").await.unwrap();

        let event = page.recv().await.unwrap();
        assert_eq!(event.changed, vec![CookieRecord::new("theme", "dark")]);
    }

    #[tokio::test]
    async fn test_subscribe_deduplicates() {
        let (store, _rx) = MemoryCookieStore::new();
        let sub = CookieSubscription::equals("session");

        store.subscribe(vec![sub.clone()]).await.unwrap();
        store.subscribe(vec![sub]).await.unwrap();

        assert_eq!(store.subscriptions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_bridge_set_then_get_returns_latest() {
        let (store, _rx) = MemoryCookieStore::new();
        let store: Arc<dyn CookieStore> = Arc::new(store);
        let bridge = CookieBridge::new(Some(store.clone()), "session", "set-by-sw");

        store.set("session", "from-page").await.unwrap();
        let record = bridge.set_and_get().await.unwrap().unwrap();
        assert_eq!(record.value, "set-by-sw");
        assert_eq!(bridge.get().await.unwrap(), Some(record));

        assert!(bridge.delete().await.unwrap());
        assert_eq!(bridge.get().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_bridge_without_store() {
        let bridge = CookieBridge::new(None, "session", "set-by-sw");
        assert!(!bridge.is_available());
        assert!(matches!(
            bridge.get().await,
            Err(ServiceWorkerError::CookieStoreUnavailable)
        ));
    }
}
