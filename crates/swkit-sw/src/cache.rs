//! Cache generations.

use hashbrown::HashMap;
use swkit_net::{NetworkFetcher, Request, Response};
use tracing::{debug, warn};
use url::Url;

use crate::ServiceWorkerError;

/// Cache key for a URL. Fragments never take part in matching.
pub fn cache_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

/// One cache generation.
#[derive(Debug, Default)]
pub struct Cache {
    /// Generation name (version string).
    pub name: String,

    /// Fragment-less URL to the response exactly as it was stored.
    entries: HashMap<String, Response>,
}

impl Cache {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request URL.
    pub fn match_request(&self, url: &Url) -> Option<&Response> {
        self.entries.get(&cache_key(url))
    }

    /// Store a response for a request.
    pub fn put(&mut self, request: &Request, response: Response) {
        self.entries.insert(cache_key(&request.url), response);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// All cache generations (the `caches` global).
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
}

impl CacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a cache, creating it if needed.
    pub fn open(&mut self, name: &str) -> &mut Cache {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a cache. `false` if it did not exist.
    pub fn delete(&mut self, name: &str) -> bool {
        self.caches.remove(name).is_some()
    }

    pub fn keys(&self) -> Vec<&str> {
        self.caches.keys().map(|s| s.as_str()).collect()
    }

    /// Delete every generation except `current`, returning the deleted names.
    pub fn delete_all_except(&mut self, current: &str) -> Vec<String> {
        let stale: Vec<String> = self
            .caches
            .keys()
            .filter(|name| name.as_str() != current)
            .cloned()
            .collect();

        for name in &stale {
            self.caches.remove(name);
        }
        stale
    }
}

/// Fetch every URL for an `addAll`-style cache fill.
///
/// All-or-nothing: any network failure or non-2xx status fails the whole
/// batch, and the caller stores nothing.
pub async fn fetch_all(
    fetcher: &dyn NetworkFetcher,
    urls: &[Url],
) -> Result<Vec<(Request, Response)>, ServiceWorkerError> {
    let mut fetched = Vec::with_capacity(urls.len());

    for url in urls {
        let request = Request::get(url.clone());
        let response = fetcher.fetch(&request).await?;

        if !response.ok() {
            warn!(url = %url, status = response.status, "Precache fetch rejected");
            return Err(ServiceWorkerError::CacheError(format!(
                "{url} returned status {}",
                response.status
            )));
        }

        debug!(url = %url, "Fetched for cache");
        fetched.push((request, response));
    }

    Ok(fetched)
}
