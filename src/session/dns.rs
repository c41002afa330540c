//! Server resolution: parsing the configured server input and SRV lookup.
//!
//! The result is an ordered list of [`ServerEndpoint`]s. The driver tries
//! them in turn and keeps the first one that accepts a connection.

use std::time::Instant;

use tracing::{info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use crate::error::SessionResult;

/// Plain client port; the stream may still be upgraded with STARTTLS.
pub const STARTTLS_PORT: u16 = 5222;

/// Conventional port for TLS from the first byte.
pub const DIRECT_TLS_PORT: u16 = 5223;

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Plain TCP, upgraded in-band when the policy allows
    Tcp,
    /// TLS handshake right after connect
    DirectTls,
}

/// One place to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
    pub mode: ConnectionMode,
    /// Account domain when `host` came from an SRV target. Certificates are
    /// checked against the domain, not the target host.
    pub domain: Option<String>,
}

impl ServerEndpoint {
    pub fn new(host: &str, port: u16, mode: ConnectionMode) -> Self {
        Self {
            host: host.to_string(),
            port,
            mode,
            domain: None,
        }
    }

    /// Name used for SNI and certificate verification.
    pub fn tls_name(&self) -> &str {
        self.domain.as_deref().unwrap_or(&self.host)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedServer {
    /// Explicit endpoint, no SRV lookup
    Direct(ServerEndpoint),
    /// Domain to resolve through SRV
    Domain(String),
}

/// Split an optional `?domain=` suffix off `host:port`.
fn split_domain_param(input: &str) -> (&str, Option<String>) {
    match input.split_once('?') {
        Some((host_port, query)) => (host_port, query.strip_prefix("domain=").map(str::to_string)),
        None => (input, None),
    }
}

fn host_and_port(host_port: &str) -> Option<(&str, u16)> {
    let (host, port) = host_port.rsplit_once(':')?;
    Some((host, port.parse().ok()?))
}

/// Parse server input.
///
/// - `tls://host[:port][?domain=d]`: TLS from the first byte, port 5223 by default
/// - `tcp://host[:port][?domain=d]`: plain TCP, port 5222 by default
/// - `host:port`: 5223 means direct TLS, anything else plain TCP
/// - `domain`: SRV lookup
pub fn parse_server_input(server: &str) -> ParsedServer {
    let trimmed = server.trim();

    let schemes = [
        ("tls://", ConnectionMode::DirectTls, DIRECT_TLS_PORT),
        ("tcp://", ConnectionMode::Tcp, STARTTLS_PORT),
    ];
    for (scheme, mode, default_port) in schemes {
        if let Some(rest) = trimmed.strip_prefix(scheme) {
            let (host_port, domain) = split_domain_param(rest);
            let (host, port) = host_and_port(host_port).unwrap_or((host_port, default_port));
            let mut endpoint = ServerEndpoint::new(host, port, mode);
            endpoint.domain = domain;
            return ParsedServer::Direct(endpoint);
        }
    }

    if let Some((host, port)) = host_and_port(trimmed) {
        let mode = if port == DIRECT_TLS_PORT {
            ConnectionMode::DirectTls
        } else {
            ConnectionMode::Tcp
        };
        return ParsedServer::Direct(ServerEndpoint::new(host, port, mode));
    }

    ParsedServer::Domain(trimmed.to_string())
}

/// Resolve `domain` into endpoints, in connection-attempt order:
/// `_xmpps-client` records, then `_xmpp-client` records, each sorted by
/// priority ascending then weight descending. Falls back to `domain:5222`
/// when neither service has records.
pub async fn resolve_server(domain: &str) -> SessionResult<Vec<ServerEndpoint>> {
    let started = Instant::now();
    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "Failed to load system DNS config, using default resolver");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        }
    };

    let mut endpoints = Vec::new();
    for (service, mode) in [
        ("_xmpps-client", ConnectionMode::DirectTls),
        ("_xmpp-client", ConnectionMode::Tcp),
    ] {
        endpoints.extend(lookup_service(&resolver, domain, service, mode).await);
    }

    if endpoints.is_empty() {
        warn!(
            domain,
            resolve_ms = elapsed_ms(started),
            "No SRV records found, using {}:{}",
            domain,
            STARTTLS_PORT
        );
        endpoints.push(ServerEndpoint::new(domain, STARTTLS_PORT, ConnectionMode::Tcp));
    } else {
        info!(
            domain,
            total = endpoints.len(),
            resolve_ms = elapsed_ms(started),
            "SRV resolution complete"
        );
    }
    Ok(endpoints)
}

async fn lookup_service(
    resolver: &TokioAsyncResolver,
    domain: &str,
    service: &str,
    mode: ConnectionMode,
) -> Vec<ServerEndpoint> {
    let srv_name = format!("{}._tcp.{}", service, domain);
    let started = Instant::now();
    let lookup = match resolver.srv_lookup(&srv_name).await {
        Ok(lookup) => lookup,
        Err(e) => {
            info!(srv = %srv_name, lookup_ms = elapsed_ms(started), error = %e, "SRV lookup failed");
            return Vec::new();
        }
    };

    let mut records: Vec<_> = lookup.iter().collect();
    records.sort_by(|a, b| {
        a.priority()
            .cmp(&b.priority())
            .then(b.weight().cmp(&a.weight()))
    });

    let mut endpoints = Vec::with_capacity(records.len());
    for r in records {
        let target = r.target().to_string().trim_end_matches('.').to_string();
        // A "." target means the service is explicitly unavailable
        if target.is_empty() {
            continue;
        }
        info!(srv = %srv_name, host = %target, port = r.port(), priority = r.priority(),
            weight = r.weight(), "SRV record");
        endpoints.push(ServerEndpoint {
            host: target,
            port: r.port(),
            mode,
            domain: Some(domain.to_string()),
        });
    }
    endpoints
}
