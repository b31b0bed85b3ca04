//! Recording transport doubles shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use conduit_session::{BoxError, Connection, ConnectionFactory, EndpointConfig, Session};
use parking_lot::Mutex;
use tokio::sync::Barrier;

// ---------------------------------------------------------------------------
// Recorder: what the tests observe
// ---------------------------------------------------------------------------

/// State of one opened mock connection.
#[derive(Debug)]
pub struct ConnState {
    /// Sequence number of the open call that produced this connection (1-based).
    pub seq: u32,
    /// `(endpoint_version, connection_version)` it was opened for.
    pub versions: (u64, u64),
    /// How many times `close` was called.
    pub closes: AtomicU32,
    /// When set, `open_session` fails.
    pub fail_sessions: AtomicBool,
    /// Sessions opened on this connection.
    pub sessions_opened: AtomicU32,
    /// Sessions closed.
    pub sessions_closed: AtomicU32,
}

impl ConnState {
    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Shared observation point for a [`MockFactory`].
#[derive(Debug, Default)]
pub struct Recorder {
    opens: AtomicU32,
    fail_opens: AtomicBool,
    hang_opens: AtomicBool,
    open_delay: Mutex<Option<Duration>>,
    open_barrier: Mutex<Option<Arc<Barrier>>>,
    hang_sessions: AtomicBool,
    hang_closes: AtomicBool,
    close_delay: Mutex<Option<Duration>>,
    fail_connection_close: AtomicBool,
    fail_session_close: AtomicBool,
    connections: Mutex<Vec<Arc<ConnState>>>,
}

impl Recorder {
    /// Number of `ConnectionFactory::open` calls (successful or not).
    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Connections opened so far, in open order.
    pub fn connections(&self) -> Vec<Arc<ConnState>> {
        self.connections.lock().clone()
    }

    /// The connection produced by the `seq`-th successful open (1-based).
    pub fn connection(&self, seq: u32) -> Arc<ConnState> {
        self.connections()
            .into_iter()
            .find(|c| c.seq == seq)
            .unwrap_or_else(|| panic!("no connection with seq {seq}"))
    }

    /// Total `close` calls across all connections.
    pub fn total_closes(&self) -> u32 {
        self.connections().iter().map(|c| c.closes()).sum()
    }

    pub fn set_fail_opens(&self, fail: bool) {
        self.fail_opens.store(fail, Ordering::SeqCst);
    }

    pub fn set_hang_opens(&self, hang: bool) {
        self.hang_opens.store(hang, Ordering::SeqCst);
    }

    pub fn set_hang_sessions(&self, hang: bool) {
        self.hang_sessions.store(hang, Ordering::SeqCst);
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock() = Some(delay);
    }

    /// Make the next opens rendezvous so `parties` of them are in flight at once.
    pub fn set_open_barrier(&self, parties: usize) {
        *self.open_barrier.lock() = Some(Arc::new(Barrier::new(parties)));
    }

    /// Opens that start after this no longer wait on a barrier.
    pub fn clear_open_barrier(&self) {
        *self.open_barrier.lock() = None;
    }

    /// `Connection::close` never returns.
    pub fn set_hang_closes(&self, hang: bool) {
        self.hang_closes.store(hang, Ordering::SeqCst);
    }

    /// `Connection::close` takes `delay` before completing.
    pub fn set_close_delay(&self, delay: Duration) {
        *self.close_delay.lock() = Some(delay);
    }

    /// `Connection::close` returns an error.
    pub fn set_fail_connection_close(&self, fail: bool) {
        self.fail_connection_close.store(fail, Ordering::SeqCst);
    }

    /// `Session::close` returns an error.
    pub fn set_fail_session_close(&self, fail: bool) {
        self.fail_session_close.store(fail, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Factory / connection / session
// ---------------------------------------------------------------------------

pub struct MockFactory {
    recorder: Arc<Recorder>,
}

impl MockFactory {
    pub fn new() -> (Self, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        (
            Self {
                recorder: Arc::clone(&recorder),
            },
            recorder,
        )
    }
}

impl ConnectionFactory for MockFactory {
    type Connection = MockConnection;

    async fn open(&self, endpoint: &EndpointConfig) -> Result<MockConnection, BoxError> {
        let seq = self.recorder.opens.fetch_add(1, Ordering::SeqCst) + 1;

        let barrier = self.recorder.open_barrier.lock().clone();
        if let Some(barrier) = barrier {
            barrier.wait().await;
        }
        let delay = *self.recorder.open_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.recorder.hang_opens.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.recorder.fail_opens.load(Ordering::SeqCst) {
            return Err("broker refused connection".into());
        }

        let state = Arc::new(ConnState {
            seq,
            versions: endpoint.versions(),
            closes: AtomicU32::new(0),
            fail_sessions: AtomicBool::new(false),
            sessions_opened: AtomicU32::new(0),
            sessions_closed: AtomicU32::new(0),
        });
        self.recorder.connections.lock().push(Arc::clone(&state));
        Ok(MockConnection {
            state,
            recorder: Arc::clone(&self.recorder),
        })
    }
}

pub struct MockConnection {
    state: Arc<ConnState>,
    recorder: Arc<Recorder>,
}

impl Connection for MockConnection {
    type Session = MockSession;

    async fn open_session(&self) -> Result<MockSession, BoxError> {
        if self.recorder.hang_sessions.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.state.fail_sessions.load(Ordering::SeqCst) {
            return Err("session refused".into());
        }
        self.state.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(MockSession {
            connection_seq: self.state.seq,
            conn: Arc::clone(&self.state),
            recorder: Arc::clone(&self.recorder),
        })
    }

    async fn close(&self) -> Result<(), BoxError> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        let delay = *self.recorder.close_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.recorder.hang_closes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.recorder.fail_connection_close.load(Ordering::SeqCst) {
            return Err("connection reset during close".into());
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct MockSession {
    /// Sequence number of the connection that produced this session.
    pub connection_seq: u32,
    conn: Arc<ConnState>,
    recorder: Arc<Recorder>,
}

impl Session for MockSession {
    async fn close(&mut self) -> Result<(), BoxError> {
        self.conn.sessions_closed.fetch_add(1, Ordering::SeqCst);
        if self.recorder.fail_session_close.load(Ordering::SeqCst) {
            return Err("session already torn down".into());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn endpoint(ev: u64, cv: u64) -> EndpointConfig {
    EndpointConfig::new("E1", "broker-1", ev, cv).with_property("queue", "q.orders")
}

pub fn ctx() -> conduit_session::Context {
    conduit_session::Context::new("req")
}

/// Let spawned tasks (closure worker, lease drops) run.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
