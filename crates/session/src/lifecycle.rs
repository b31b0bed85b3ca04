//! Process lifecycle: create-once, shutdown-once.
//!
//! [`ShutdownCoordinator`] is meant to live in a `static` at the outermost
//! application-wiring layer. Everything below that layer receives the
//! [`ResourceManager`] it returns by injection.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::config::ManagerConfig;
use crate::connection::ConnectionFactory;
use crate::error::{Error, Result};
use crate::manager::ResourceManager;

/// Lifecycle state: `Uninitialized → Running → ShuttingDown → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// No manager has been created yet.
    Uninitialized,
    /// Serving sessions.
    Running,
    /// Draining queued and cached connections.
    ShuttingDown,
    /// Terminal.
    Stopped,
}

impl LifecycleState {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Uninitialized => 0,
            Self::Running => 1,
            Self::ShuttingDown => 2,
            Self::Stopped => 3,
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Uninitialized,
            1 => Self::Running,
            2 => Self::ShuttingDown,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uninitialized => "uninitialized",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        })
    }
}

/// Atomic cell holding a [`LifecycleState`].
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: LifecycleState) -> Self {
        Self(AtomicU8::new(state.to_u8()))
    }

    pub(crate) fn load(&self) -> LifecycleState {
        LifecycleState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, state: LifecycleState) {
        self.0.store(state.to_u8(), Ordering::Release);
    }

    /// Move from `from` to `to`; `false` if the cell was not in `from`.
    pub(crate) fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.0
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

enum Slot<F: ConnectionFactory> {
    Uninitialized,
    Running(Arc<ResourceManager<F>>),
    ShuttingDown,
    Stopped,
}

impl<F: ConnectionFactory> Slot<F> {
    fn state(&self) -> LifecycleState {
        match self {
            Self::Uninitialized => LifecycleState::Uninitialized,
            Self::Running(_) => LifecycleState::Running,
            Self::ShuttingDown => LifecycleState::ShuttingDown,
            Self::Stopped => LifecycleState::Stopped,
        }
    }
}

/// Holder of the single process-wide [`ResourceManager`].
///
/// ```rust,ignore
/// static SESSIONS: ShutdownCoordinator<BrokerFactory> = ShutdownCoordinator::new();
///
/// let manager = SESSIONS.create_instance(BrokerFactory::new(), ManagerConfig::default())?;
/// // ... hand `manager` to the request pipeline ...
/// SESSIONS.shutdown().await;
/// ```
pub struct ShutdownCoordinator<F: ConnectionFactory> {
    slot: Mutex<Slot<F>>,
}

impl<F: ConnectionFactory> ShutdownCoordinator<F> {
    /// Create an uninitialized coordinator. Usable in `static` items.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slot: parking_lot::const_mutex(Slot::Uninitialized),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.slot.lock().state()
    }

    /// Create the manager and move to `Running`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// [`Error::AlreadyInitialized`] unless the coordinator is still
    /// `Uninitialized`; [`Error::Configuration`] if `config` is invalid, in
    /// which case the coordinator stays `Uninitialized`.
    pub fn create_instance(
        &self,
        factory: F,
        config: ManagerConfig,
    ) -> Result<Arc<ResourceManager<F>>> {
        let mut slot = self.slot.lock();
        if !matches!(*slot, Slot::Uninitialized) {
            return Err(Error::AlreadyInitialized);
        }
        let manager = Arc::new(ResourceManager::new(factory, config)?);
        *slot = Slot::Running(Arc::clone(&manager));
        tracing::info!("Session manager instance created");
        Ok(manager)
    }

    /// The running manager.
    ///
    /// # Errors
    /// [`Error::NotInitialized`] in any state other than `Running`.
    pub fn instance(&self) -> Result<Arc<ResourceManager<F>>> {
        match &*self.slot.lock() {
            Slot::Running(manager) => Ok(Arc::clone(manager)),
            other => Err(Error::NotInitialized {
                state: other.state(),
            }),
        }
    }

    /// Shut the manager down and move to `Stopped`.
    ///
    /// A no-op unless `Running`.
    pub async fn shutdown(&self) {
        let manager = {
            let mut slot = self.slot.lock();
            match std::mem::replace(&mut *slot, Slot::ShuttingDown) {
                Slot::Running(manager) => manager,
                other => {
                    *slot = other;
                    return;
                }
            }
        };

        manager.shutdown().await;
        *self.slot.lock() = Slot::Stopped;
    }
}

impl<F: ConnectionFactory> Default for ShutdownCoordinator<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ConnectionFactory> fmt::Debug for ShutdownCoordinator<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("state", &self.state())
            .finish()
    }
}
