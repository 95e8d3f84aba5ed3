//
// document_store.rs
//
// Sessions for open documents with TTL expiry and LRU eviction
//

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use ropey::Rope;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types::{TextDocumentContentChangeEvent, Url};

use crate::config::{DEFAULT_MAX_SESSIONS, DEFAULT_SESSION_TTL};
use crate::content_provider::ContentProvider;
use crate::position::apply_edits_to_rope;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct DocumentStoreConfig {
    /// Maximum number of sessions kept in memory
    pub max_sessions: usize,
    /// Sessions untouched for this long are dropped
    pub ttl: Duration,
}

impl Default for DocumentStoreConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            ttl: DEFAULT_SESSION_TTL,
        }
    }
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct DocumentStoreMetrics {
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Sessions dropped because the store was full
    pub evictions: u64,
    /// Sessions dropped after the TTL elapsed
    pub expirations: u64,
    /// Sessions rebuilt from persisted content on a change
    pub recoveries: u64,
    pub documents_opened: u64,
    pub documents_closed: u64,
}

// ============================================================================
// Document Session
// ============================================================================

/// In-memory state of one open document
#[derive(Debug)]
pub struct DocumentSession {
    pub uri: Url,
    /// Current content; authoritative while the session exists
    pub contents: Rope,
    /// Incremented on every change
    pub revision: u64,
    last_access: Instant,
    /// Armed deferred validation, if any
    pending_validation: Option<CancellationToken>,
}

impl DocumentSession {
    fn new(uri: Url, text: &str) -> Self {
        Self {
            uri,
            contents: Rope::from_str(text),
            revision: 0,
            last_access: Instant::now(),
            pending_validation: None,
        }
    }

    pub fn text(&self) -> String {
        self.contents.to_string()
    }

    pub fn has_pending_validation(&self) -> bool {
        self.pending_validation
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    fn cancel_pending(&mut self) {
        if let Some(token) = self.pending_validation.take() {
            token.cancel();
        }
    }
}

impl Drop for DocumentSession {
    fn drop(&mut self) {
        // A dropped session never runs its deferred validation
        self.cancel_pending();
    }
}

// ============================================================================
// Document Store
// ============================================================================

/// Store of document sessions keyed by URI.
///
/// Expired sessions are purged lazily at the start of every operation, so a
/// lookup never returns a session older than the TTL. Callers treat a missing
/// session as a normal condition.
pub struct DocumentStore {
    sessions: LruCache<Url, DocumentSession>,
    config: DocumentStoreConfig,
    metrics: DocumentStoreMetrics,
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("len", &self.sessions.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for DocumentStore {
    fn default() -> Self {
        Self::new(DocumentStoreConfig::default())
    }
}

impl DocumentStore {
    pub fn new(config: DocumentStoreConfig) -> Self {
        let cap = NonZeroUsize::new(config.max_sessions)
            .or(NonZeroUsize::new(DEFAULT_MAX_SESSIONS))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            sessions: LruCache::new(cap),
            config,
            metrics: DocumentStoreMetrics::default(),
        }
    }

    /// Create or replace the session for `uri`, cancelling any armed
    /// validation of the previous session.
    pub fn open(&mut self, uri: Url, text: &str) {
        self.evict_expired();
        self.insert(DocumentSession::new(uri, text));
        self.metrics.documents_opened += 1;
    }

    /// Apply an ordered batch of edits and return the resulting content.
    ///
    /// A missing session is rebuilt once from `provider` before the edits are
    /// applied. When that read fails the change is dropped and `None` is
    /// returned.
    pub fn apply_change(
        &mut self,
        uri: &Url,
        changes: &[TextDocumentContentChangeEvent],
        provider: &dyn ContentProvider,
    ) -> Option<String> {
        self.evict_expired();
        if !self.sessions.contains(uri) {
            self.metrics.cache_misses += 1;
            log::info!("Session not found for {}, re-reading", uri);
            match provider.read(uri) {
                Ok(text) => {
                    self.insert(DocumentSession::new(uri.clone(), &text));
                    self.metrics.recoveries += 1;
                }
                Err(err) => {
                    log::error!("Dropping change for {}: {:#}", uri, err);
                    return None;
                }
            }
        } else {
            self.metrics.cache_hits += 1;
        }

        let session = self.sessions.get_mut(uri)?;
        apply_edits_to_rope(&mut session.contents, changes);
        session.revision += 1;
        session.last_access = Instant::now();
        log::trace!(
            "Applied {} change(s) to {} (revision {})",
            changes.len(),
            uri,
            session.revision
        );
        Some(session.text())
    }

    /// Reload the session from persisted content, discarding in-memory
    /// edits. Returns the reloaded content.
    pub fn save(&mut self, uri: &Url, provider: &dyn ContentProvider) -> Option<String> {
        self.evict_expired();
        let text = match provider.read(uri) {
            Ok(text) => text,
            Err(err) => {
                log::error!("Could not reload {} on save: {:#}", uri, err);
                return None;
            }
        };

        match self.sessions.get_mut(uri) {
            Some(session) => {
                session.contents = Rope::from_str(&text);
                session.revision += 1;
                session.last_access = Instant::now();
            }
            None => self.insert(DocumentSession::new(uri.clone(), &text)),
        }
        Some(text)
    }

    /// Remove the session, cancelling any armed validation. Returns whether
    /// a session existed.
    pub fn close(&mut self, uri: &Url) -> bool {
        self.evict_expired();
        self.metrics.documents_closed += 1;
        self.sessions.pop(uri).is_some()
    }

    /// Look up a session, refreshing its TTL and LRU position
    pub fn get(&mut self, uri: &Url) -> Option<&DocumentSession> {
        self.evict_expired();
        match self.sessions.get_mut(uri) {
            Some(session) => {
                session.last_access = Instant::now();
                self.metrics.cache_hits += 1;
                Some(&*session)
            }
            None => {
                self.metrics.cache_misses += 1;
                None
            }
        }
    }

    /// Look up a session without refreshing it
    pub fn peek(&mut self, uri: &Url) -> Option<&DocumentSession> {
        self.evict_expired();
        self.sessions.peek(uri)
    }

    /// Arm a deferred validation for `uri`, cancelling the one already
    /// armed. Returns the token of the new arming, or `None` without a
    /// session.
    pub fn schedule_validation(&mut self, uri: &Url) -> Option<CancellationToken> {
        self.evict_expired();
        let session = self.sessions.peek_mut(uri)?;
        if session.pending_validation.is_some() {
            log::trace!("Cancelled previous deferred validation for {}", uri);
        }
        session.cancel_pending();
        let token = CancellationToken::new();
        session.pending_validation = Some(token.clone());
        Some(token)
    }

    /// Disarm the deferred validation for `uri` once it has run. A token
    /// that was cancelled has already been replaced and is ignored.
    pub fn complete_validation(&mut self, uri: &Url, token: &CancellationToken) {
        if token.is_cancelled() {
            return;
        }
        if let Some(session) = self.sessions.peek_mut(uri) {
            session.pending_validation = None;
        }
    }

    /// Drop every session not touched within the TTL
    pub fn evict_expired(&mut self) {
        let now = Instant::now();
        // LRU order is access order, so expired sessions sit at the tail
        while let Some((uri, session)) = self.sessions.peek_lru() {
            if now.duration_since(session.last_access) < self.config.ttl {
                break;
            }
            log::trace!("Session for {} expired", uri);
            self.sessions.pop_lru();
            self.metrics.expirations += 1;
        }
    }

    pub fn contains(&self, uri: &Url) -> bool {
        self.sessions.contains(uri)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn metrics(&self) -> &DocumentStoreMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &DocumentStoreConfig {
        &self.config
    }

    fn insert(&mut self, session: DocumentSession) {
        let uri = session.uri.clone();
        if let Some((evicted, _)) = self.sessions.push(uri.clone(), session) {
            if evicted != uri {
                log::trace!("Evicting LRU session: {}", evicted);
                self.metrics.evictions += 1;
            }
        }
    }
}
