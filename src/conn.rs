use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{ConnId, ConnectionRegistry};
use crate::remote::Remote;

/// Best-effort TCP keepalive, never fatal to the connection.
fn apply_keepalive(stream: &TcpStream, period: Duration) {
    let sock = SockRef::from(stream);
    let conf = TcpKeepalive::new().with_time(period);
    if let Err(e) = sock.set_tcp_keepalive(&conf) {
        warn!("cannot set TCP keepalive: {e}");
    }
}

/// Dial the resolved upstream target such that an address change racing
/// the dial is picked up before the connection commits.
async fn connect_with_live_address(
    remote: &Remote,
    connect_timeout: Duration,
) -> anyhow::Result<TcpStream> {
    let mut target = remote.resolve().await?;
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let stream = timeout(connect_timeout, TcpStream::connect(&target)).await??;

        let current = remote.resolve().await?;
        if current != target {
            debug!(old = %target, new = %current, "remote address changed mid-dial, redialing");
            drop(stream);
            target = current;
            if attempts % 10 == 0 {
                warn!(attempts, "repeated redial for the same connection");
            }
            continue;
        }

        return Ok(stream);
    }
}

/// One client connection, owned end-to-end by its handler task.
pub struct ProxyConnection {
    id: ConnId,
    client: TcpStream,
}

impl ProxyConnection {
    pub fn new(id: ConnId, client: TcpStream) -> Self {
        ProxyConnection { id, client }
    }

    /// Drive the connection from keepalive setup through dial through
    /// bidirectional copy, then clean up the registry. Runs to completion
    /// inside the handler task spawned by the engine's accept loop.
    pub async fn run(
        self,
        remote: &Remote,
        registry: &ConnectionRegistry,
        connect_timeout: Duration,
        keepalive: Duration,
    ) {
        let peer = self
            .client
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".to_string());

        apply_keepalive(&self.client, keepalive);

        let upstream = match connect_with_live_address(remote, connect_timeout).await {
            Ok(s) => s,
            Err(e) => {
                warn!(peer = %peer, "cannot connect remote address: {e}");
                registry.remove(self.id);
                return;
            }
        };

        apply_keepalive(&upstream, keepalive);

        if let (Ok(local), Ok(remote_addr)) = (upstream.local_addr(), upstream.peer_addr()) {
            registry.set_upstream(self.id, local, remote_addr);
        }

        let kill = registry
            .kill_token(self.id)
            .unwrap_or_else(CancellationToken::new);

        info!(peer = %peer, "connected");
        Self::copy_bidirectional(self.client, upstream, kill).await;
        info!(peer = %peer, "disconnected");

        registry.remove(self.id);
    }

    /// Two independent tasks, each signaling completion exactly once on a
    /// shared channel. The first completion, or the reaper cancelling
    /// `kill`, wins; both copy tasks are then aborted, which drops their
    /// owned socket halves and closes both sockets, unblocking whichever
    /// direction was still in progress.
    async fn copy_bidirectional(client: TcpStream, upstream: TcpStream, kill: CancellationToken) {
        let (client_rd, client_wr) = client.into_split();
        let (upstream_rd, upstream_wr) = upstream.into_split();

        let (tx, mut rx) = mpsc::channel::<std::io::Result<u64>>(2);

        let tx_c2u = tx.clone();
        let c2u = tokio::spawn(async move {
            let mut rd = client_rd;
            let mut wr = upstream_wr;
            let res = tokio::io::copy(&mut rd, &mut wr).await;
            let _ = tx_c2u.send(res).await;
        });

        let u2c = tokio::spawn(async move {
            let mut rd = upstream_rd;
            let mut wr = client_wr;
            let res = tokio::io::copy(&mut rd, &mut wr).await;
            let _ = tx.send(res).await;
        });

        tokio::select! {
            res = rx.recv() => {
                if let Some(Err(e)) = res {
                    debug!("copy direction ended with error: {e}");
                }
            }
            _ = kill.cancelled() => {
                debug!("connection killed by reaper");
            }
        }

        c2u.abort();
        u2c.abort();
    }
}
