use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::conn::ProxyConnection;
use crate::error::{split_host_port, AdminError, ConfigError};
use crate::registry::{ConnectionInfo, ConnectionRegistry};
use crate::remote::Remote;
use crate::state::StateStore;

/// Immutable tunables collected from the CLI (or test harness) and handed
/// to the engine at construction.
#[derive(Debug, Clone)]
pub struct Settings {
    pub grace_period: Duration,
    pub connect_timeout: Duration,
    pub keepalive_period: Duration,
    pub resolve_period: Duration,
    pub state_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            grace_period: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            keepalive_period: Duration::from_secs(60),
            resolve_period: Duration::from_secs(10),
            state_path: None,
        }
    }
}

struct Inner {
    listen_addr: String,
    remote: Remote,
    registry: ConnectionRegistry,
    state: StateStore,
    settings: Settings,

    /// One-shot latches. `CancellationToken::cancelled()` is level-triggered
    /// on the token's internal state rather than edge-triggered on a wakeup,
    /// so a `cancel()` that lands between a waiter's "already fired?" check
    /// and its `.await` is never lost the way a bare `Notify` permit would
    /// be.
    ready: CancellationToken,
    shutdown: CancellationToken,
    stopped: CancellationToken,

    /// Serializes the "update remote + save state + spawn reaper"
    /// sequence of `set_remote_address` against concurrent admin writes.
    /// Data-plane connections never take this lock.
    admin_lock: Mutex<()>,
}

/// The acceptor loop, lifecycle owner of the resolver, registry, and
/// state store; implements the address-change protocol and graceful
/// shutdown.
///
/// Cheap to clone (an `Arc` underneath) so it can be handed wholesale to
/// every per-connection task and to the management surface.
#[derive(Clone)]
pub struct Engine(Arc<Inner>);

impl Engine {
    pub fn new(listen_addr: String, remote_addr: String) -> anyhow::Result<Self> {
        Self::with_settings(listen_addr, remote_addr, Settings::default())
    }

    pub fn with_settings(
        listen_addr: String,
        remote_addr: String,
        settings: Settings,
    ) -> anyhow::Result<Self> {
        let remote = Remote::new(remote_addr, settings.resolve_period)?;
        Ok(Engine(Arc::new(Inner {
            listen_addr,
            remote,
            registry: ConnectionRegistry::new(),
            state: StateStore::new(settings.state_path.clone()),
            settings,
            ready: CancellationToken::new(),
            shutdown: CancellationToken::new(),
            stopped: CancellationToken::new(),
            admin_lock: Mutex::new(()),
        })))
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.0.registry
    }

    /// Resolves once the listener is bound, so callers (tests, the mgmt
    /// bootstrap) can synchronize on "the proxy is accepting connections".
    pub async fn ready(&self) {
        self.0.ready.cancelled().await;
    }

    fn fire_ready(&self) {
        self.0.ready.cancel();
    }

    fn is_shutdown(&self) -> bool {
        self.0.shutdown.is_cancelled()
    }

    /// Binds the listener, loads persisted state, fires `ready`, and runs
    /// the accept loop until `shutdown` is called.
    pub async fn run(&self) -> Result<(), ConfigError> {
        self.0.state.load(&self.0.remote).await?;

        let listener = TcpListener::bind(&self.0.listen_addr)
            .await
            .map_err(|source| ConfigError::Listen {
                addr: self.0.listen_addr.clone(),
                source,
            })?;
        info!(addr = %self.0.listen_addr, "proxy listening");

        self.fire_ready();

        let mut handlers: JoinSet<()> = JoinSet::new();

        loop {
            // Checked explicitly on every turn of the loop (not just while
            // parked in `select!`) so a `shutdown()` that lands in the
            // window between a completed `accept()` and the loop's next
            // `select!` is never missed.
            if self.is_shutdown() {
                break;
            }

            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, _peer)) => self.spawn_handler(socket, &mut handlers),
                        Err(e) => {
                            if self.is_shutdown() {
                                break;
                            }
                            warn!("cannot accept inbound connection: {e}");
                            continue;
                        }
                    }
                }
                _ = self.0.shutdown.cancelled() => {
                    break;
                }
            }
        }

        while handlers.join_next().await.is_some() {}

        self.0.stopped.cancel();
        Ok(())
    }

    /// Inserts a pending entry into the registry *before* dialing, then
    /// spawns an independent handler task. Each handler holds its own
    /// cheap clone of `Engine`, so no borrow of `self` needs to outlive
    /// the accept loop.
    fn spawn_handler(&self, socket: TcpStream, handlers: &mut JoinSet<()>) {
        let info = match ConnectionInfo::pending(&socket) {
            Ok(info) => info,
            Err(e) => {
                warn!("cannot read accepted socket addresses: {e}");
                return;
            }
        };

        let id = self.0.registry.insert(info);
        let conn = ProxyConnection::new(id, socket);
        let engine = self.clone();

        handlers.spawn(async move {
            conn.run(
                &engine.0.remote,
                &engine.0.registry,
                engine.0.settings.connect_timeout,
                engine.0.settings.keepalive_period,
            )
            .await;
        });
    }

    /// Signals shutdown (which unblocks `accept` in `run`'s select loop),
    /// then waits for `run` to drain all outstanding handler tasks before
    /// returning. No in-flight connection is forcibly closed by shutdown
    /// itself.
    pub async fn shutdown(&self) -> std::io::Result<()> {
        self.0.shutdown.cancel();
        self.0.stopped.cancelled().await;
        Ok(())
    }

    pub async fn get_remote_address(&self) -> String {
        self.0.remote.get_addr().await
    }

    /// Validates, updates the remote under the admin lock, persists
    /// state, and spawns a reaper.
    pub async fn set_remote_address(&self, new: String) -> Result<(), AdminError> {
        split_host_port(&new)?;

        let _guard = self.0.admin_lock.lock().await;

        let old = self.0.remote.get_addr().await;
        info!(old = %old, new = %new, "changing remote address");

        self.0.remote.set_addr(new).await;
        self.0.state.save(&self.0.remote).await;

        self.spawn_reaper();
        Ok(())
    }

    /// Sleeps for `grace_period`, then closes (via each entry's
    /// cancellation token) every connection whose committed upstream no
    /// longer matches the current logical address. Overlapping reapers
    /// from rapid successive address changes are permitted; each uses the
    /// address current at its own wake-up, and cancelling an
    /// already-cancelled token is a no-op.
    fn spawn_reaper(&self) {
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(engine.0.settings.grace_period).await;

            let current = engine.0.remote.get_addr().await;
            let mut killed = 0usize;
            for (_id, conn) in engine.0.registry.snapshot() {
                if let Some((_local, upstream_remote)) = conn.upstream {
                    if upstream_remote.to_string() != current {
                        conn.kill.cancel();
                        killed += 1;
                    }
                }
            }
            info!(killed, grace_period = ?engine.0.settings.grace_period, "reaper swept registry");
        });
    }
}
