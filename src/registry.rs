use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Opaque identity for a registry entry. Generated on accept, stable for
/// the lifetime of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

impl ConnId {
    fn next() -> Self {
        ConnId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// The addresses the management surface needs to render one line of
/// `/conns`. Captured once at insert/commit time rather than re-derived
/// from the live socket, since the socket may already be gone by the time
/// an admin request iterates the registry.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub client_remote: SocketAddr,
    pub client_local: SocketAddr,
    /// `(upstream_local, upstream_remote)`, present only once the dial in
    /// §4.3 has committed.
    pub upstream: Option<(SocketAddr, SocketAddr)>,
    /// Cancelled by the reaper (§4.6) to force-close a connection whose
    /// upstream no longer matches the current logical address. The
    /// handler task races its copy loop against this token.
    pub kill: CancellationToken,
}

impl ConnectionInfo {
    pub fn pending(client: &TcpStream) -> std::io::Result<Self> {
        Ok(ConnectionInfo {
            client_remote: client.peer_addr()?,
            client_local: client.local_addr()?,
            upstream: None,
            kill: CancellationToken::new(),
        })
    }
}

/// Concurrent-safe set of live/pending proxy connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    conns: DashMap<ConnId, ConnectionInfo>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry {
            conns: DashMap::new(),
        }
    }

    pub fn insert(&self, info: ConnectionInfo) -> ConnId {
        let id = ConnId::next();
        self.conns.insert(id, info);
        id
    }

    pub fn set_upstream(&self, id: ConnId, local: SocketAddr, remote: SocketAddr) {
        if let Some(mut entry) = self.conns.get_mut(&id) {
            entry.upstream = Some((local, remote));
        }
    }

    pub fn kill_token(&self, id: ConnId) -> Option<CancellationToken> {
        self.conns.get(&id).map(|entry| entry.kill.clone())
    }

    pub fn remove(&self, id: ConnId) {
        self.conns.remove(&id);
    }

    pub fn count(&self) -> usize {
        self.conns.len()
    }

    /// Snapshot of the registry at this instant. Not required to be
    /// point-in-time consistent with concurrent inserts/removes.
    pub fn snapshot(&self) -> Vec<(ConnId, ConnectionInfo)> {
        self.conns
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }
}
