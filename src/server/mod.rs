//! Playback server
//!
//! One thread runs the accept loop; every client gets its own session
//! thread, or in single-connection mode each session runs to completion
//! before the next client is accepted.

pub mod control;
pub mod listener;
pub mod session;

pub use control::{ControlChannel, ControlEvent};
pub use listener::{Connection, Listener};
pub use session::{EndReason, Session, SessionState, SessionSummary};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::backend::Backend;
use crate::config::ServerConfig;
use crate::error::{Error, Result};

/// Timing knobs for sessions
#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    pub control_grace: Duration,
    pub header_timeout: Duration,
    pub poll_interval: Duration,
    pub single_connection: bool,
}

impl From<&ServerConfig> for ServerOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            control_grace: config.control_grace(),
            header_timeout: config.header_timeout(),
            poll_interval: config.poll_interval(),
            single_connection: config.single_connection,
        }
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

/// Totals over the server's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub connections: u64,
    pub failed_sessions: u64,
    pub bytes_relayed: u64,
}

impl ServerStats {
    fn record(&mut self, summary: &SessionSummary) {
        self.bytes_relayed += summary.bytes_relayed;
        if summary.reason.is_error() {
            self.failed_sessions += 1;
        }
    }
}

pub struct Server {
    listener: Listener,
    backend: Arc<dyn Backend>,
    options: ServerOptions,
    running: Arc<AtomicBool>,
    next_id: AtomicU64,
}

impl Server {
    /// Bind the listening socket described by `config`
    pub fn bind(config: &ServerConfig, backend: Arc<dyn Backend>) -> Result<Self> {
        let options = ServerOptions::from(config);
        let listener = Listener::bind(&config.bind_endpoint(), options.control_grace)?;
        Ok(Self::with_listener(listener, backend, options))
    }

    pub fn with_listener(listener: Listener, backend: Arc<dyn Backend>, options: ServerOptions) -> Self {
        Self {
            listener,
            backend,
            options,
            running: Arc::new(AtomicBool::new(true)),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Clearing this flag stops the accept loop and every session
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Serve until the running flag is cleared.
    ///
    /// Sessions still open at that point are ended and joined before the
    /// backend is shut down.
    pub fn run(&self) -> Result<ServerStats> {
        self.backend.initialize()?;
        tracing::info!(
            "Listening on {} with {} backend",
            self.local_addr()?,
            self.backend.name()
        );

        let (done_tx, done_rx) = unbounded::<SessionSummary>();
        let mut sessions: HashMap<u64, JoinHandle<()>> = HashMap::new();
        let mut stats = ServerStats::default();

        while self.running.load(Ordering::Relaxed) {
            match self.listener.poll_accept() {
                Ok(Some(connection)) => {
                    stats.connections += 1;
                    match self.spawn_session(connection, done_tx.clone()) {
                        Ok((id, handle)) if self.options.single_connection => {
                            let _ = handle.join();
                            self.reap(&done_rx, &mut sessions, &mut stats, Duration::ZERO);
                            tracing::trace!(conn = id, "Single-connection session joined");
                        }
                        Ok((id, handle)) => {
                            sessions.insert(id, handle);
                        }
                        Err(e) => tracing::error!("Failed to start session: {}", e),
                    }
                }
                Ok(None) => {
                    // Idle: wait for a session to finish or the next poll tick.
                    self.reap(&done_rx, &mut sessions, &mut stats, self.options.poll_interval);
                }
                Err(e) => {
                    tracing::warn!("Rejected connection: {}", e);
                }
            }
            self.reap(&done_rx, &mut sessions, &mut stats, Duration::ZERO);
        }

        tracing::info!("Shutting down, {} session(s) open", sessions.len());
        for (_, handle) in sessions.drain() {
            let _ = handle.join();
        }
        drop(done_tx);
        while let Ok(summary) = done_rx.try_recv() {
            stats.record(&summary);
        }

        self.backend.shutdown();
        Ok(stats)
    }

    fn spawn_session(
        &self,
        connection: Connection,
        done: Sender<SessionSummary>,
    ) -> Result<(u64, JoinHandle<()>)> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            conn = id,
            peer = %connection.peer,
            control = connection.control.is_some(),
            "Connection accepted"
        );

        let session = Session::new(
            id,
            connection.peer,
            connection.data,
            connection.control,
            self.backend.clone(),
            self.options,
            self.running.clone(),
        );

        let handle = thread::Builder::new()
            .name(format!("rsd-conn-{}", id))
            .spawn(move || {
                let summary = session.run();
                let _ = done.send(summary);
            })
            .map_err(Error::Io)?;

        Ok((id, handle))
    }

    /// Join sessions that reported completion
    fn reap(
        &self,
        done: &Receiver<SessionSummary>,
        sessions: &mut HashMap<u64, JoinHandle<()>>,
        stats: &mut ServerStats,
        wait: Duration,
    ) {
        let first = if wait.is_zero() {
            done.try_recv().ok()
        } else {
            match done.recv_timeout(wait) {
                Ok(summary) => Some(summary),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
            }
        };

        for summary in first.into_iter().chain(done.try_iter()) {
            if let Some(handle) = sessions.remove(&summary.id) {
                let _ = handle.join();
            }
            stats.record(&summary);
        }
    }

    /// Run the accept loop on its own thread
    pub fn spawn(self) -> Result<ServerHandle> {
        let addr = self.local_addr()?;
        let running = self.running.clone();
        let thread = thread::Builder::new()
            .name("rsd-accept".to_string())
            .spawn(move || self.run())
            .map_err(Error::Io)?;

        Ok(ServerHandle {
            addr,
            running,
            thread,
        })
    }
}

/// A server running in the background
pub struct ServerHandle {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    thread: JoinHandle<Result<ServerStats>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting, end open sessions and wait for the accept loop
    pub fn stop(self) -> Result<ServerStats> {
        self.running.store(false, Ordering::Relaxed);
        self.thread
            .join()
            .map_err(|_| Error::ThreadPanic("rsd-accept"))?
    }
}
