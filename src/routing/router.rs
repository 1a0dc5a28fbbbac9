//! Route lookup and lazy context creation.
//!
//! # Responsibilities
//! - Store route entries in registration order
//! - Look up the best entry for (host, port, path)
//! - Create each entry's backend context on first use, exactly once
//!
//! # Design Decisions
//! - Newest entries are examined first; only a strictly longer prefix
//!   replaces the current best, so ties go to the most recent registration
//! - The table is sealed when serving starts; later registration is an error
//! - Explicit `RouteMatch` outcomes rather than a silent default

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::Mutex;

use super::matcher::{match_path, HostPattern, PathMatch};
use super::{RouteError, RouteSpec};
use crate::backend::{BackendContext, BackendError, ContextFactory};
use crate::observability::metrics;

/// A registered route and its lazily created backend context.
pub struct RouteEntry {
    spec: RouteSpec,
    host: Option<HostPattern>,
    context: Mutex<Option<Arc<dyn BackendContext>>>,
    creations: AtomicU64,
}

impl RouteEntry {
    fn new(spec: RouteSpec) -> Self {
        let host = spec.host.as_deref().map(HostPattern::new);
        Self {
            spec,
            host,
            context: Mutex::new(None),
            creations: AtomicU64::new(0),
        }
    }

    pub fn spec(&self) -> &RouteSpec {
        &self.spec
    }

    pub fn prefix(&self) -> &str {
        &self.spec.prefix
    }

    /// How many times a context has been created for this entry.
    pub fn creations(&self) -> u64 {
        self.creations.load(Ordering::SeqCst)
    }

    /// The entry's context, creating it if absent. Concurrent callers wait on
    /// the entry lock so only one of them runs the factory.
    pub async fn context(
        &self,
        factory: &dyn ContextFactory,
    ) -> Result<Arc<dyn BackendContext>, BackendError> {
        let mut slot = self.context.lock().await;
        if let Some(context) = slot.as_ref() {
            return Ok(Arc::clone(context));
        }
        let context = factory.create(&self.spec).await?;
        self.creations.fetch_add(1, Ordering::SeqCst);
        metrics::record_context_created();
        tracing::info!(
            prefix = %self.spec.prefix,
            target = %self.spec.target,
            host = ?self.spec.host,
            "Backend context created"
        );
        *slot = Some(Arc::clone(&context));
        Ok(context)
    }

    /// Forget the current context so the next request creates a new one.
    pub async fn clear_context(&self) -> Option<Arc<dyn BackendContext>> {
        self.context.lock().await.take()
    }

    fn accepts(&self, host: Option<&str>, port: Option<u16>) -> bool {
        if let (Some(expected), Some(port)) = (self.spec.port, port) {
            if expected != port {
                return false;
            }
        }
        match (&self.host, host) {
            (Some(pattern), Some(host)) => pattern.matches(host),
            _ => true,
        }
    }
}

impl std::fmt::Debug for RouteEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteEntry")
            .field("spec", &self.spec)
            .field("creations", &self.creations())
            .finish()
    }
}

/// Outcome of a successful lookup.
#[derive(Debug, Clone)]
pub enum RouteMatch {
    /// The path lies under the entry's prefix.
    Found(Arc<RouteEntry>),
    /// The path is the entry's prefix without its trailing slash; the client
    /// should be redirected to the prefix.
    Redirect(Arc<RouteEntry>),
}

impl RouteMatch {
    pub fn entry(&self) -> &Arc<RouteEntry> {
        match self {
            Self::Found(entry) | Self::Redirect(entry) => entry,
        }
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self, Self::Redirect(_))
    }
}

/// Ordered registry of route entries.
pub struct RouteTable {
    entries: RwLock<Vec<Arc<RouteEntry>>>,
    sealed: AtomicBool,
    factory: Arc<dyn ContextFactory>,
}

impl RouteTable {
    pub fn new(factory: Arc<dyn ContextFactory>) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            sealed: AtomicBool::new(false),
            factory,
        }
    }

    /// Append a route.
    pub fn register(&self, spec: RouteSpec) -> Result<Arc<RouteEntry>, RouteError> {
        if self.sealed.load(Ordering::SeqCst) {
            return Err(RouteError::Sealed);
        }
        if !spec.prefix.starts_with('/') {
            return Err(RouteError::InvalidPrefix(spec.prefix));
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let duplicate = entries.iter().any(|e| {
            e.spec.port == spec.port
                && e.spec.prefix == spec.prefix
                && e.host == spec.host.as_deref().map(HostPattern::new)
        });
        if duplicate {
            return Err(RouteError::Duplicate {
                host: spec.host,
                port: spec.port,
                prefix: spec.prefix,
            });
        }
        tracing::debug!(
            host = ?spec.host,
            port = ?spec.port,
            prefix = %spec.prefix,
            target = %spec.target,
            "Route registered"
        );
        let entry = Arc::new(RouteEntry::new(spec));
        entries.push(Arc::clone(&entry));
        Ok(entry)
    }

    /// Refuse further registrations.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find the entry with the longest prefix accepting the request.
    ///
    /// `host` and `port` of `None` mean "unknown" and match any entry.
    pub fn match_route(
        &self,
        host: Option<&str>,
        port: Option<u16>,
        path: &str,
        allow_root_fallback: bool,
    ) -> Option<RouteMatch> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut best: Option<(&Arc<RouteEntry>, PathMatch)> = None;

        for entry in entries.iter().rev() {
            let best_len = best.map_or(0, |(e, _)| e.prefix().len());
            if entry.prefix().len() <= best_len {
                continue;
            }
            if !entry.accepts(host, port) {
                continue;
            }
            if let Some(outcome) = match_path(entry.prefix(), path) {
                best = Some((entry, outcome));
            }
        }

        let found = match best {
            Some((entry, PathMatch::Prefix)) => Some(RouteMatch::Found(Arc::clone(entry))),
            Some((entry, PathMatch::Redirect)) => Some(RouteMatch::Redirect(Arc::clone(entry))),
            None => None,
        };
        drop(entries);

        if found.is_none() && allow_root_fallback && path != "/" {
            return self.match_route(host, port, "/", false);
        }
        found
    }

    /// Make sure a matched entry's backend context exists, creating it
    /// through the table's factory.
    pub async fn resolve(&self, entry: &RouteEntry) -> Result<Arc<dyn BackendContext>, BackendError> {
        entry.context(self.factory.as_ref()).await
    }

    /// Unload every context created so far.
    pub async fn unload_all(&self) {
        let entries: Vec<_> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for entry in entries {
            if let Some(context) = entry.clear_context().await {
                tracing::debug!(prefix = %entry.prefix(), "Unloading backend context");
                context.unload().await;
            }
        }
    }
}

impl std::fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteTable")
            .field("entries", &self.len())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}
