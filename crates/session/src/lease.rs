//! RAII lease over a session and the handle of the connection that served it

use std::sync::Arc;

use crate::connection::ConnectionFactory;
use crate::error::Result;
use crate::manager::{HandleOf, ResourceManager, SessionOf};

/// A session borrowed from a [`ResourceManager`].
///
/// Call [`release`](Self::release) to hand the session back, optionally
/// marking its connection stale. A lease dropped without an explicit
/// release is released in the background with `mark_stale = false`.
pub struct SessionLease<F: ConnectionFactory> {
    manager: Arc<ResourceManager<F>>,
    parts: Option<(SessionOf<F>, HandleOf<F>)>,
}

impl<F: ConnectionFactory> SessionLease<F> {
    pub(crate) fn new(
        manager: Arc<ResourceManager<F>>,
        session: SessionOf<F>,
        handle: HandleOf<F>,
    ) -> Self {
        Self {
            manager,
            parts: Some((session, handle)),
        }
    }

    /// Handle of the connection that served this session.
    #[must_use]
    pub fn handle(&self) -> &HandleOf<F> {
        &self.parts.as_ref().expect("lease used after release").1
    }

    /// Release the session.
    pub async fn release(mut self, mark_stale: bool) -> Result<()> {
        match self.parts.take() {
            Some((session, handle)) => self.manager.release(handle, session, mark_stale).await,
            None => Ok(()),
        }
    }

    /// Take the session and handle out of the lease without releasing.
    ///
    /// The caller becomes responsible for calling
    /// [`ResourceManager::release`].
    #[must_use]
    pub fn into_parts(mut self) -> (SessionOf<F>, HandleOf<F>) {
        self.parts.take().expect("lease used after release")
    }
}

impl<F: ConnectionFactory> std::ops::Deref for SessionLease<F> {
    type Target = SessionOf<F>;

    fn deref(&self) -> &Self::Target {
        &self.parts.as_ref().expect("lease used after release").0
    }
}

impl<F: ConnectionFactory> std::ops::DerefMut for SessionLease<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.parts.as_mut().expect("lease used after release").0
    }
}

impl<F: ConnectionFactory> Drop for SessionLease<F> {
    fn drop(&mut self) {
        let Some((session, handle)) = self.parts.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let manager = Arc::clone(&self.manager);
                drop(runtime.spawn(async move {
                    let endpoint = handle.key().clone();
                    let connection_id = handle.id();
                    if let Err(error) = manager.release(handle, session, false).await {
                        tracing::debug!(
                            %endpoint,
                            %connection_id,
                            %error,
                            "Background release of dropped session lease failed"
                        );
                    }
                }));
            }
            Err(_) => {
                tracing::warn!(
                    endpoint = %handle.key(),
                    connection_id = %handle.id(),
                    "Session lease dropped outside a Tokio runtime; session not released"
                );
            }
        }
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for SessionLease<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("handle", &self.parts.as_ref().map(|(_, handle)| handle))
            .finish()
    }
}
