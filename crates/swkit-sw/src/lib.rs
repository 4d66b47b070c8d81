//! # swkit Service Worker
//!
//! A service worker that intercepts fetches, serves a versioned cache and
//! mirrors cookie changes to every open page as log broadcasts.
//!
//! ## Features
//!
//! - **Lifecycle**: install (optional precache, cookie subscription) and
//!   activate (stale cache cleanup, client claim)
//! - **Cache generations**: named, versioned response caches
//! - **Cookie bridge**: get/set/delete plus filtered change subscriptions
//! - **Routing**: ordered `(pattern, route)` table over request paths
//! - **Broadcast**: `{type: "log", data}` messages to controlled clients
//!
//! ## Architecture
//!
//! ```text
//! WorkerHost (event loop)
//!     │
//!     └── Worker::dispatch(WorkerEvent) ──→ Dispatch
//!             │                               ├── RespondWith(Response)
//!             │                               └── WaitUntil(())
//!             ├── RouteTable
//!             ├── CacheStorage
//!             │       └── Cache (generation)
//!             │               └── URL → Response
//!             ├── CookieBridge ──→ dyn CookieStore
//!             ├── Clients ──→ ClientMessage::Log
//!             └── dyn NetworkFetcher
//! ```

use serde::{Deserialize, Serialize};
use swkit_net::NetError;
use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod config;
pub mod cookies;
pub mod host;
pub mod message;
pub mod router;
pub mod worker;

pub use cache::{Cache, CacheStorage};
pub use clients::{Client, ClientId, Clients};
pub use config::{WorkerConfig, WorkerVariant};
pub use cookies::{
    CookieBridge, CookieChangeEvent, CookieRecord, CookieStore, CookieSubscription, MatchType,
    MemoryCookieStore,
};
pub use host::{HostHandle, WorkerHost};
pub use message::{ClientMessage, CookieAction, IncomingMessage, MessageEvent};
pub use router::{Route, RouteTable};
pub use worker::{Dispatch, Worker, WorkerBuilder, WorkerEvent};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("cookieStore not available")]
    CookieStoreUnavailable,

    #[error("Invalid route pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Worker host stopped")]
    HostStopped,
}

// ==================== State ====================

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Created, no lifecycle event seen yet.
    #[default]
    Parsed,
    /// Install event running.
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activate event running.
    Activating,
    /// Active and intercepting fetches.
    Activated,
    /// Install failed.
    Redundant,
}

impl ServiceWorkerState {
    /// Only an activated worker intercepts fetches.
    pub fn can_intercept_fetch(&self) -> bool {
        matches!(self, ServiceWorkerState::Activated)
    }
}

impl std::fmt::Display for ServiceWorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServiceWorkerState::Parsed => "parsed",
            ServiceWorkerState::Installing => "installing",
            ServiceWorkerState::Installed => "installed",
            ServiceWorkerState::Activating => "activating",
            ServiceWorkerState::Activated => "activated",
            ServiceWorkerState::Redundant => "redundant",
        };
        f.write_str(name)
    }
}
