//! Per-session configuration, loaded from JSON.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{SessionError, SessionResult};
use crate::jid::Jid;

/// Whether the stream must, may, or must not be upgraded with STARTTLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TlsPolicy {
    /// Fail the session if the server does not offer STARTTLS
    Required,
    /// Upgrade whenever the server offers it
    #[default]
    Try,
    /// Never upgrade; fail if the server insists
    Disabled,
}

/// Settings for one user session.
///
/// Only `jid` and `password` are mandatory; everything else has a default
/// matching common server deployments.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub jid: String,
    pub password: String,
    #[serde(default = "default_resource")]
    pub resource: String,
    /// Server input: `tls://host:port`, `tcp://host:port`, `host:port` or a
    /// bare domain (SRV lookup). Defaults to the JID domain.
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub tls: TlsPolicy,
    #[serde(default = "default_true")]
    pub tls_verify: bool,
    #[serde(default = "default_true")]
    pub sasl: bool,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default = "default_cache_max_age_secs")]
    pub cache_max_age_secs: u64,
    /// `;`-separated streamhost list: `jid,host,port`, `<local>`, `<auto>`
    #[serde(default = "default_transfer_proxies")]
    pub transfer_proxies: String,
    /// Address advertised for the local streamhost
    #[serde(default)]
    pub transfer_host: Option<String>,
    #[serde(default = "default_transfer_connect_timeout_secs")]
    pub transfer_connect_timeout_secs: u64,
    #[serde(default = "default_transfer_listen_timeout_secs")]
    pub transfer_listen_timeout_secs: u64,
}

fn default_resource() -> String {
    "gateway".to_string()
}

fn default_true() -> bool {
    true
}

fn default_keepalive_secs() -> u64 {
    60
}

fn default_cache_max_age_secs() -> u64 {
    600
}

fn default_transfer_proxies() -> String {
    "<local>;<auto>".to_string()
}

fn default_transfer_connect_timeout_secs() -> u64 {
    15
}

fn default_transfer_listen_timeout_secs() -> u64 {
    90
}

/// One parsed entry of `transfer_proxies`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxySetting {
    /// Offer a listener on this host
    Local,
    /// Discover bytestream proxies through the server's service directory
    Auto,
    /// A fixed proxy
    Fixed { jid: String, host: String, port: u16 },
}

impl SessionConfig {
    /// Minimal config for a JID and password, all else defaulted.
    pub fn new(jid: &str, password: &str) -> Self {
        Self {
            jid: jid.to_string(),
            password: password.to_string(),
            resource: default_resource(),
            server: None,
            tls: TlsPolicy::default(),
            tls_verify: true,
            sasl: true,
            keepalive_secs: default_keepalive_secs(),
            cache_max_age_secs: default_cache_max_age_secs(),
            transfer_proxies: default_transfer_proxies(),
            transfer_host: None,
            transfer_connect_timeout_secs: default_transfer_connect_timeout_secs(),
            transfer_listen_timeout_secs: default_transfer_listen_timeout_secs(),
        }
    }

    pub fn load(path: &Path) -> SessionResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SessionError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> SessionResult<Self> {
        let config: SessionConfig = serde_json::from_str(raw)
            .map_err(|e| SessionError::config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SessionResult<()> {
        let jid = self.parsed_jid()?;
        if jid.node().is_none() {
            return Err(SessionError::config(format!(
                "JID '{}' has no user part",
                self.jid
            )));
        }
        if self.keepalive_secs == 0 {
            return Err(SessionError::config("keepalive_secs must be positive"));
        }
        self.proxy_settings()?;
        Ok(())
    }

    /// The account JID; a resource embedded in `jid` wins over `resource`.
    pub fn parsed_jid(&self) -> SessionResult<Jid> {
        let jid: Jid = self.jid.parse().map_err(SessionError::config)?;
        Ok(match jid.resource() {
            Some(_) => jid,
            None => jid.with_resource(&self.resource),
        })
    }

    /// Server input string for connecting: explicit setting or JID domain.
    pub fn server_input(&self) -> SessionResult<String> {
        match &self.server {
            Some(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
            _ => Ok(self.parsed_jid()?.domain().to_string()),
        }
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn cache_max_age(&self) -> Duration {
        Duration::from_secs(self.cache_max_age_secs)
    }

    pub fn transfer_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_connect_timeout_secs)
    }

    pub fn transfer_listen_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_listen_timeout_secs)
    }

    pub fn proxy_settings(&self) -> SessionResult<Vec<ProxySetting>> {
        parse_proxy_settings(&self.transfer_proxies)
    }
}

/// Parse a `;`-separated streamhost list. Empty entries are skipped.
pub fn parse_proxy_settings(input: &str) -> SessionResult<Vec<ProxySetting>> {
    let mut settings = Vec::new();
    for entry in input.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        match entry {
            "<local>" => settings.push(ProxySetting::Local),
            "<auto>" => settings.push(ProxySetting::Auto),
            _ => {
                let parts: Vec<&str> = entry.split(',').map(str::trim).collect();
                let [jid, host, port] = parts.as_slice() else {
                    return Err(SessionError::config(format!(
                        "invalid streamhost '{}': expected jid,host,port",
                        entry
                    )));
                };
                let port = port.parse::<u16>().map_err(|_| {
                    SessionError::config(format!("invalid streamhost port in '{}'", entry))
                })?;
                settings.push(ProxySetting::Fixed {
                    jid: jid.to_string(),
                    host: host.to_string(),
                    port,
                });
            }
        }
    }
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_defaults() {
        let config =
            SessionConfig::from_json(r#"{"jid": "alice@example.org", "password": "pw"}"#).unwrap();
        assert_eq!(config.resource, "gateway");
        assert_eq!(config.tls, TlsPolicy::Try);
        assert!(config.sasl);
        assert_eq!(config.keepalive_interval(), Duration::from_secs(60));
        assert_eq!(config.cache_max_age(), Duration::from_secs(600));
        assert_eq!(config.server_input().unwrap(), "example.org");
        assert_eq!(
            config.parsed_jid().unwrap().to_string(),
            "alice@example.org/gateway"
        );
    }

    #[test]
    fn test_from_json_overrides() {
        let config = SessionConfig::from_json(
            r#"{"jid": "bob@example.org/irc", "password": "pw", "tls": "required",
                "server": "tls://xmpp.example.org:5223", "transfer_proxies": "<local>"}"#,
        )
        .unwrap();
        assert_eq!(config.tls, TlsPolicy::Required);
        assert_eq!(config.server_input().unwrap(), "tls://xmpp.example.org:5223");
        assert_eq!(config.parsed_jid().unwrap().resource(), Some("irc"));
        assert_eq!(config.proxy_settings().unwrap(), vec![ProxySetting::Local]);
    }

    #[test]
    fn test_from_json_rejects_domain_only_jid() {
        let err = SessionConfig::from_json(r#"{"jid": "example.org", "password": "pw"}"#)
            .unwrap_err();
        assert!(!err.retryable());
    }

    #[test]
    fn test_parse_proxy_settings() {
        let settings =
            parse_proxy_settings("<local>; proxy.example.org,10.0.0.1,7777 ;<auto>;").unwrap();
        assert_eq!(
            settings,
            vec![
                ProxySetting::Local,
                ProxySetting::Fixed {
                    jid: "proxy.example.org".into(),
                    host: "10.0.0.1".into(),
                    port: 7777
                },
                ProxySetting::Auto,
            ]
        );
        assert!(parse_proxy_settings("proxy.example.org,10.0.0.1").is_err());
        assert!(parse_proxy_settings("p,h,notaport").is_err());
    }
}
