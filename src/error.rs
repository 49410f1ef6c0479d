/// Fatal, startup-time failures. Anything reaching `main` as one of these
/// terminates the process with a diagnostic.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot read state file {path}: {source}")]
    StateRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse state file {path}: {source}")]
    StateDecode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Data-plane error, always contained to a single connection or a single
/// resolve attempt. Never fatal, never propagated past a handler task.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("invalid host:port {addr:?}: {reason}")]
    InvalidAddr { addr: String, reason: String },

    #[error("dns lookup failed for {host:?}: {source}")]
    Lookup {
        host: String,
        #[source]
        source: hickory_resolver::ResolveError,
    },

    #[error("host {host:?} resolved to no addresses")]
    NoAddresses { host: String },
}

/// Admin-input error surfaced as an HTTP 400 by the management surface.
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("malformed host:port: {0}")]
    BadAddress(String),

    #[error("request body too large")]
    BodyTooLarge,
}

/// Split `addr` into `(host, port)`, validating it is well-formed
/// `host:port`. Accepts IP literals (including bracketed IPv6) and DNS
/// names alike; does not attempt resolution.
pub fn split_host_port(addr: &str) -> Result<(String, u16), AdminError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| AdminError::BadAddress(format!("{addr:?} has no port")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(AdminError::BadAddress(format!("{addr:?} has no host")));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| AdminError::BadAddress(format!("{addr:?} has an invalid port")))?;
    Ok((host.to_string(), port))
}
