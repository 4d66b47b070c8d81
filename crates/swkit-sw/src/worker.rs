//! The worker: lifecycle, fetch routing, message protocol and cookie
//! change mirroring behind a single [`Worker::dispatch`].

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use serde_json::{json, Value as JsonValue};
use swkit_net::{NetworkFetcher, Request, Response};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::cache::{self, CacheStorage};
use crate::clients::Clients;
use crate::config::WorkerConfig;
use crate::cookies::{CookieBridge, CookieChangeEvent, CookieRecord, CookieStore};
use crate::message::{CookieAction, IncomingMessage, MessageEvent, UNKNOWN_ACTION_REPLY};
use crate::router::{Route, RouteTable};
use crate::{ServiceWorkerError, ServiceWorkerState};

/// Exclusive upper bound of the `/sw/generated` number.
pub const GENERATED_UPPER_BOUND: u32 = 1000;

// ==================== Events ====================

/// Everything the worker reacts to.
#[derive(Debug)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(Request),
    Message(MessageEvent),
    CookieChange(CookieChangeEvent),
}

impl WorkerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerEvent::Install => "install",
            WorkerEvent::Activate => "activate",
            WorkerEvent::Fetch(_) => "fetch",
            WorkerEvent::Message(_) => "message",
            WorkerEvent::CookieChange(_) => "cookiechange",
        }
    }
}

/// Result of dispatching an event.
pub enum Dispatch {
    /// The page gets this response.
    RespondWith(BoxFuture<'static, Result<Response, ServiceWorkerError>>),
    /// The event is done when this task finishes.
    WaitUntil(BoxFuture<'static, Result<(), ServiceWorkerError>>),
}

impl Dispatch {
    /// Drive the dispatched work to completion.
    pub async fn settle(self) -> Result<Option<Response>, ServiceWorkerError> {
        match self {
            Dispatch::RespondWith(response) => response.await.map(Some),
            Dispatch::WaitUntil(task) => task.await.map(|()| None),
        }
    }
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dispatch::RespondWith(_) => f.write_str("Dispatch::RespondWith(..)"),
            Dispatch::WaitUntil(_) => f.write_str("Dispatch::WaitUntil(..)"),
        }
    }
}

// ==================== Builder ====================

/// Builder for [`Worker`].
pub struct WorkerBuilder {
    config: WorkerConfig,
    fetcher: Arc<dyn NetworkFetcher>,
    cookie_store: Option<Arc<dyn CookieStore>>,
    clients: Clients,
    caches: Arc<RwLock<CacheStorage>>,
    routes: RouteTable,
}

impl WorkerBuilder {
    /// Cookie store to bridge to. Without one, cookie operations fail.
    pub fn cookie_store(mut self, store: Arc<dyn CookieStore>) -> Self {
        self.cookie_store = Some(store);
        self
    }

    /// Share an existing client registry.
    pub fn clients(mut self, clients: Clients) -> Self {
        self.clients = clients;
        self
    }

    /// Share existing cache storage (e.g. generations left by an older worker).
    pub fn caches(mut self, caches: Arc<RwLock<CacheStorage>>) -> Self {
        self.caches = caches;
        self
    }

    /// Replace the standard route table.
    pub fn routes(mut self, routes: RouteTable) -> Self {
        self.routes = routes;
        self
    }

    pub fn build(self) -> Worker {
        let cookies = CookieBridge::new(
            self.cookie_store,
            self.config.cookie_name.clone(),
            self.config.cookie_set_value.clone(),
        );

        Worker {
            inner: Arc::new(WorkerInner {
                config: self.config,
                fetcher: self.fetcher,
                cookies,
                clients: self.clients,
                caches: self.caches,
                routes: self.routes,
                state: RwLock::new(ServiceWorkerState::Parsed),
            }),
        }
    }
}

// ==================== Worker ====================

struct WorkerInner {
    config: WorkerConfig,
    fetcher: Arc<dyn NetworkFetcher>,
    cookies: CookieBridge,
    clients: Clients,
    caches: Arc<RwLock<CacheStorage>>,
    routes: RouteTable,
    state: RwLock<ServiceWorkerState>,
}

/// A service worker instance. Cloning is cheap and shares state.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    pub fn builder(config: WorkerConfig, fetcher: Arc<dyn NetworkFetcher>) -> WorkerBuilder {
        WorkerBuilder {
            config,
            fetcher,
            cookie_store: None,
            clients: Clients::new(),
            caches: Arc::new(RwLock::new(CacheStorage::new())),
            routes: RouteTable::standard(),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    pub fn clients(&self) -> &Clients {
        &self.inner.clients
    }

    pub fn caches(&self) -> &Arc<RwLock<CacheStorage>> {
        &self.inner.caches
    }

    pub fn fetcher(&self) -> &Arc<dyn NetworkFetcher> {
        &self.inner.fetcher
    }

    pub async fn state(&self) -> ServiceWorkerState {
        *self.inner.state.read().await
    }

    /// Dispatch one event.
    ///
    /// Fetch events yield [`Dispatch::RespondWith`]; every other event
    /// yields [`Dispatch::WaitUntil`].
    pub fn dispatch(&self, event: WorkerEvent) -> Dispatch {
        let worker = self.clone();
        debug!(event = event.kind(), "Dispatching event");

        match event {
            WorkerEvent::Install => {
                Dispatch::WaitUntil(async move { worker.on_install().await }.boxed())
            }
            WorkerEvent::Activate => {
                Dispatch::WaitUntil(async move { worker.on_activate().await }.boxed())
            }
            WorkerEvent::Message(message) => {
                Dispatch::WaitUntil(async move { worker.on_message(message).await }.boxed())
            }
            WorkerEvent::CookieChange(change) => {
                Dispatch::WaitUntil(async move { worker.on_cookie_change(change).await }.boxed())
            }
            WorkerEvent::Fetch(request) => Dispatch::RespondWith(self.route_fetch(request)),
        }
    }

    pub async fn install(&self) -> Result<(), ServiceWorkerError> {
        self.dispatch(WorkerEvent::Install).settle().await.map(drop)
    }

    pub async fn activate(&self) -> Result<(), ServiceWorkerError> {
        self.dispatch(WorkerEvent::Activate).settle().await.map(drop)
    }

    /// Run a request through the fetch handler.
    pub async fn fetch(&self, request: Request) -> Result<Response, ServiceWorkerError> {
        self.dispatch(WorkerEvent::Fetch(request))
            .settle()
            .await?
            .ok_or_else(|| ServiceWorkerError::StateError("fetch produced no response".into()))
    }

    // ---------- lifecycle ----------

    async fn transition(
        &self,
        from: ServiceWorkerState,
        to: ServiceWorkerState,
    ) -> Result<(), ServiceWorkerError> {
        let mut state = self.inner.state.write().await;
        if *state != from {
            return Err(ServiceWorkerError::StateError(format!(
                "cannot move to {to} from {}",
                *state
            )));
        }
        *state = to;
        info!(state = %to, "Worker state changed");
        Ok(())
    }

    async fn set_state(&self, to: ServiceWorkerState) {
        *self.inner.state.write().await = to;
        info!(state = %to, "Worker state changed");
    }

    async fn on_install(&self) -> Result<(), ServiceWorkerError> {
        self.transition(ServiceWorkerState::Parsed, ServiceWorkerState::Installing)
            .await?;

        match self.run_install().await {
            Ok(()) => {
                self.set_state(ServiceWorkerState::Installed).await;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Install failed");
                self.set_state(ServiceWorkerState::Redundant).await;
                Err(e)
            }
        }
    }

    async fn run_install(&self) -> Result<(), ServiceWorkerError> {
        if self.inner.config.precache_on_install {
            self.precache().await?;
        }
        self.subscribe_cookie_changes().await?;
        self.log("installed").await;
        Ok(())
    }

    async fn precache(&self) -> Result<(), ServiceWorkerError> {
        let config = &self.inner.config;
        let name = config.cache_name.as_str();

        let urls = config
            .precache_urls
            .iter()
            .map(|path| config.resolve(path))
            .collect::<Result<Vec<_>, _>>()?;

        self.inner.caches.write().await.open(name);
        info!(cache = name, "Cache open");

        let fetched = match cache::fetch_all(self.inner.fetcher.as_ref(), &urls).await {
            Ok(fetched) => fetched,
            Err(e) => {
                error!(cache = name, error = %e, "Failed to fill cache");
                return Err(e);
            }
        };

        let mut caches = self.inner.caches.write().await;
        let cache = caches.open(name);
        for (request, response) in fetched {
            cache.put(&request, response);
        }
        info!(cache = name, entries = cache.len(), "Precache complete");
        Ok(())
    }

    async fn subscribe_cookie_changes(&self) -> Result<(), ServiceWorkerError> {
        if !self.inner.cookies.is_available() {
            let msg = "Failed to subscribe: cookieStore not available.";
            warn!("{msg}");
            self.log(msg).await;
            return Ok(());
        }

        let subscriptions = self.inner.config.cookie_subscriptions.clone();
        self.inner.cookies.subscribe(subscriptions).await?;
        info!("Subscribed to cookie changes");
        Ok(())
    }

    async fn on_activate(&self) -> Result<(), ServiceWorkerError> {
        self.transition(ServiceWorkerState::Installed, ServiceWorkerState::Activating)
            .await?;
        self.log("activating").await;

        let current = self.inner.config.cache_name.as_str();
        let stale = self.inner.caches.write().await.delete_all_except(current);
        for name in &stale {
            info!(cache = %name, current, "Deleted stale cache");
        }

        if self.inner.config.claim_clients {
            let claimed = self.inner.clients.claim().await;
            debug!(claimed, "Claimed clients");
        }

        self.set_state(ServiceWorkerState::Activated).await;
        Ok(())
    }

    // ---------- fetch ----------

    fn route_fetch(
        &self,
        request: Request,
    ) -> BoxFuture<'static, Result<Response, ServiceWorkerError>> {
        let route = self.inner.routes.route(request.path());
        debug!(url = %request.url, ?route, "Intercepted fetch");

        let worker = self.clone();
        match route {
            Route::Generated => {
                let number = rand::thread_rng().gen_range(0..GENERATED_UPPER_BOUND);
                async move { worker.respond_generated(number).await }.boxed()
            }
            Route::GetCookie => async move { worker.respond_get_cookie().await }.boxed(),
            Route::SetCookie => async move { worker.respond_set_cookie().await }.boxed(),
            Route::DeleteCookie => async move { worker.respond_delete_cookie().await }.boxed(),
            Route::DeleteCache => async move { worker.respond_delete_cache().await }.boxed(),
            Route::CacheOrNetwork => {
                async move { worker.respond_cache_or_network(request).await }.boxed()
            }
        }
    }

    async fn respond_generated(&self, number: u32) -> Result<Response, ServiceWorkerError> {
        self.log(format!("generated response {number}")).await;
        Ok(Response::plain_text(format!("random int: {number}")))
    }

    async fn respond_get_cookie(&self) -> Result<Response, ServiceWorkerError> {
        let cookie = self.inner.cookies.get().await?;
        let body = self.describe_cookie("GET", cookie.as_ref());
        self.log(format!("get cookie. found: {}", cookie.is_some()))
            .await;
        Ok(Response::plain_text(body))
    }

    async fn respond_set_cookie(&self) -> Result<Response, ServiceWorkerError> {
        let cookie = self.inner.cookies.set_and_get().await?;
        let body = self.describe_cookie("SET", cookie.as_ref());
        self.log(format!("set cookie. found: {}", cookie.is_some()))
            .await;
        Ok(Response::plain_text(body))
    }

    async fn respond_delete_cookie(&self) -> Result<Response, ServiceWorkerError> {
        self.log("deleting cookie.").await;
        let deleted = self.inner.cookies.delete().await?;
        Ok(Response::plain_text(format!("deleted cookie: {deleted}")))
    }

    async fn respond_delete_cache(&self) -> Result<Response, ServiceWorkerError> {
        self.log("clearing worker cache.").await;
        let cleared = self
            .inner
            .caches
            .write()
            .await
            .delete(&self.inner.config.cache_name);
        Ok(Response::plain_text(format!("worker cache cleared: {cleared}")))
    }

    /// Serve from the current generation, else the network. Misses are not
    /// written back.
    async fn respond_cache_or_network(
        &self,
        request: Request,
    ) -> Result<Response, ServiceWorkerError> {
        let hit = self
            .inner
            .caches
            .read()
            .await
            .get(&self.inner.config.cache_name)
            .and_then(|cache| cache.match_request(&request.url))
            .cloned();

        if let Some(response) = hit {
            self.log(format!("cache hit: {}", request.url)).await;
            return Ok(response);
        }

        self.log(format!("fetching {}", request.url)).await;
        Ok(self.inner.fetcher.fetch(&request).await?)
    }

    fn describe_cookie(&self, verb: &str, cookie: Option<&CookieRecord>) -> String {
        match cookie {
            Some(cookie) => format!(
                "{verb} {} cookie value: {}",
                self.inner.cookies.name(),
                cookie.value
            ),
            None => "no cookie found.".to_string(),
        }
    }

    // ---------- messages ----------

    async fn on_message(&self, mut event: MessageEvent) -> Result<(), ServiceWorkerError> {
        debug!(data = %event.data, "Received message");

        match IncomingMessage::classify(&event.data) {
            IncomingMessage::Empty => debug!("Ignoring empty message"),
            IncomingMessage::Action(name) => {
                let reply = self.execute_action(&name).await?;
                event.respond(reply);
            }
            IncomingMessage::Unknown(data) => {
                self.log(format!("received unknown action {data}")).await;
                event.respond(json!(UNKNOWN_ACTION_REPLY));
            }
            IncomingMessage::NotAnObject(text) => {
                self.log(format!("cannot handle event: {text}")).await;
            }
        }
        Ok(())
    }

    async fn execute_action(&self, name: &str) -> Result<JsonValue, ServiceWorkerError> {
        let Some(action) = CookieAction::from_name(name) else {
            warn!(action = name, "Unrecognized action");
            return Ok(JsonValue::Null);
        };

        let cookies = &self.inner.cookies;
        let reply = match action {
            CookieAction::Get => record_json(cookies.get().await?),
            CookieAction::Set => record_json(cookies.set_and_get().await?),
            CookieAction::Delete => json!(cookies.delete().await?),
        };
        debug!(action = action.as_str(), %reply, "Action executed");
        Ok(reply)
    }

    // ---------- cookie changes ----------

    async fn on_cookie_change(&self, change: CookieChangeEvent) -> Result<(), ServiceWorkerError> {
        debug!(
            changed = change.changed.len(),
            deleted = change.deleted.len(),
            "Cookie change detected"
        );

        for cookie in &change.changed {
            self.log(format!("cookie changed: {}", cookie.name)).await;
        }
        for cookie in &change.deleted {
            self.log(format!("cookie deleted: {}", cookie.name)).await;
        }
        Ok(())
    }

    async fn log(&self, message: impl Into<String>) {
        self.inner.clients.log(message).await;
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("cache_name", &self.inner.config.cache_name)
            .field("routes", &self.inner.routes.len())
            .finish()
    }
}

fn record_json(record: Option<CookieRecord>) -> JsonValue {
    record.map_or(JsonValue::Null, |r| r.to_json())
}
