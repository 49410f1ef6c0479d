use std::net::IpAddr;
use std::time::{Duration, Instant};

use hickory_resolver::TokioResolver;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{split_host_port, ResolveError};

/// Cached fields guarded together so a reader never observes a
/// resolved address paired with the wrong timestamp.
struct Cache {
    resolved_addr: Option<String>,
    resolved_at: Option<Instant>,
}

/// The logical upstream address plus its TTL-bounded resolution cache.
///
/// `addr` and the cache live behind the same lock: readers of `get_addr`
/// and writers of `set_addr`/`resolve` all go through it, without a
/// separate lock per field (an admin write and a resolve can't race each
/// other into an inconsistent `(resolved_addr, resolved_at)` pair).
pub struct Remote {
    inner: RwLock<RemoteInner>,
    ttl: Duration,
    resolver: TokioResolver,
}

struct RemoteInner {
    addr: String,
    cache: Cache,
}

impl Remote {
    pub fn new(addr: String, ttl: Duration) -> anyhow::Result<Self> {
        let resolver = TokioResolver::builder_tokio()?.build();
        Ok(Remote {
            inner: RwLock::new(RemoteInner {
                addr,
                cache: Cache {
                    resolved_addr: None,
                    resolved_at: None,
                },
            }),
            ttl,
            resolver,
        })
    }

    pub async fn get_addr(&self) -> String {
        self.inner.read().await.addr.clone()
    }

    pub async fn set_addr(&self, new: String) {
        let mut inner = self.inner.write().await;
        inner.addr = new;
        inner.cache.resolved_addr = None;
        inner.cache.resolved_at = None;
    }

    /// Resolve the current logical address to `ip:port`, respecting the
    /// TTL cache.
    ///
    /// The cache-miss path (host/port split, DNS lookup) runs without
    /// holding the lock: only a cheap snapshot of the logical address is
    /// taken under a read guard, the lookup itself suspends lock-free, and
    /// the result is committed under a fresh write guard. The commit is
    /// skipped if `set_addr` raced in and changed the logical address
    /// while the lookup was in flight, so a stale resolution can never
    /// overwrite a cache that `set_addr` already invalidated.
    pub async fn resolve(&self) -> Result<String, ResolveError> {
        let addr_snapshot = {
            let inner = self.inner.read().await;
            if let (Some(resolved), Some(at)) =
                (&inner.cache.resolved_addr, inner.cache.resolved_at)
            {
                if at.elapsed() < self.ttl {
                    return Ok(resolved.clone());
                }
            }
            inner.addr.clone()
        };

        let (host, port) =
            split_host_port(&addr_snapshot).map_err(|e| ResolveError::InvalidAddr {
                addr: addr_snapshot.clone(),
                reason: e.to_string(),
            })?;

        let ip = if let Ok(ip) = host.parse::<IpAddr>() {
            ip
        } else {
            let lookup = self
                .resolver
                .lookup_ip(host.as_str())
                .await
                .map_err(|source| ResolveError::Lookup {
                    host: host.clone(),
                    source,
                })?;
            lookup
                .iter()
                .next()
                .ok_or_else(|| ResolveError::NoAddresses { host: host.clone() })?
        };

        // `SocketAddr::to_string` brackets IPv6 (`[::1]:8080`), matching
        // what `TcpStream::connect` and the reaper's own
        // `SocketAddr::to_string` comparison expect; a bare `format!`
        // would produce an unparseable `::1:8080` for V6 results.
        let resolved = std::net::SocketAddr::new(ip, port).to_string();
        debug!(addr = %addr_snapshot, %resolved, "resolved upstream address");

        let mut inner = self.inner.write().await;
        if inner.addr == addr_snapshot {
            inner.cache.resolved_addr = Some(resolved.clone());
            inner.cache.resolved_at = Some(Instant::now());
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ip_literal_resolves_without_lookup() {
        let remote = Remote::new("127.0.0.1:9000".to_string(), Duration::from_secs(10)).unwrap();
        let resolved = remote.resolve().await.unwrap();
        assert_eq!(resolved, "127.0.0.1:9000");
    }

    #[tokio::test]
    async fn ipv6_literal_resolves_with_brackets() {
        let remote = Remote::new("[::1]:9000".to_string(), Duration::from_secs(10)).unwrap();
        let resolved = remote.resolve().await.unwrap();
        assert_eq!(resolved, "[::1]:9000");
        // Must round-trip through `SocketAddr`'s own parser, the same one
        // `TcpStream::connect` uses to dial it.
        resolved.parse::<std::net::SocketAddr>().unwrap();
    }

    #[tokio::test]
    async fn set_addr_invalidates_cache() {
        let remote = Remote::new("127.0.0.1:9000".to_string(), Duration::from_secs(100)).unwrap();
        assert_eq!(remote.resolve().await.unwrap(), "127.0.0.1:9000");
        remote.set_addr("127.0.0.1:9001".to_string()).await;
        assert_eq!(remote.get_addr().await, "127.0.0.1:9001");
        assert_eq!(remote.resolve().await.unwrap(), "127.0.0.1:9001");
    }

    #[tokio::test]
    async fn resolve_caches_within_ttl() {
        let remote = Remote::new("127.0.0.1:9000".to_string(), Duration::from_secs(100)).unwrap();
        let first = remote.resolve().await.unwrap();
        let second = remote.resolve().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn invalid_addr_does_not_poison_cache() {
        let remote = Remote::new("127.0.0.1:9000".to_string(), Duration::from_secs(100)).unwrap();
        assert_eq!(remote.resolve().await.unwrap(), "127.0.0.1:9000");
        remote.set_addr("not-a-valid-addr".to_string()).await;
        assert!(remote.resolve().await.is_err());
        remote.set_addr("127.0.0.1:9002".to_string()).await;
        assert_eq!(remote.resolve().await.unwrap(), "127.0.0.1:9002");
    }
}
