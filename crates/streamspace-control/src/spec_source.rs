//! Source of original session specifications.
//!
//! Retrying a stuck `start_session` needs the spec the session was created
//! with. The session API layer owns that data; this trait is how the
//! reconciler asks for it.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use streamspace_core::{SessionId, SessionSpec};

use crate::error::Result;

/// Supplies the original spec of a session on demand.
#[async_trait]
pub trait SessionSpecSource: Send + Sync {
    /// Look up the spec a session was started with.
    ///
    /// Returns `Ok(None)` when the spec is not available, in which case the
    /// reconciler only logs its intent to retry.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing source fails.
    async fn session_spec(&self, session_id: &SessionId) -> Result<Option<SessionSpec>>;

    /// Drop whatever is held for a session that reached a terminal state.
    fn forget(&self, session_id: &SessionId);
}

/// A source that never has a spec.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSpecSource;

#[async_trait]
impl SessionSpecSource for NoSpecSource {
    async fn session_spec(&self, _session_id: &SessionId) -> Result<Option<SessionSpec>> {
        Ok(None)
    }

    fn forget(&self, _session_id: &SessionId) {}
}

/// In-process spec registry, filled when sessions are started through
/// [`crate::ControlPlaneService`].
#[derive(Debug, Default)]
pub struct InMemorySpecSource {
    specs: RwLock<HashMap<SessionId, SessionSpec>>,
}

impl InMemorySpecSource {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the spec for a session.
    pub fn insert(&self, session_id: SessionId, spec: SessionSpec) {
        self.specs.write().insert(session_id, spec);
    }

    /// Forget a session's spec.
    pub fn remove(&self, session_id: &SessionId) -> Option<SessionSpec> {
        self.specs.write().remove(session_id)
    }

    /// Number of remembered specs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.specs.read().len()
    }

    /// Check if no specs are remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specs.read().is_empty()
    }
}

#[async_trait]
impl SessionSpecSource for InMemorySpecSource {
    async fn session_spec(&self, session_id: &SessionId) -> Result<Option<SessionSpec>> {
        Ok(self.specs.read().get(session_id).cloned())
    }

    fn forget(&self, session_id: &SessionId) {
        self.remove(session_id);
    }
}
