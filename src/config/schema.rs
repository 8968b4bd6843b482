//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from TOML config
//! files. Unset fields fall back to the engine defaults when converted to
//! [`Options`].

use serde::{Deserialize, Serialize};

use crate::proxy::engine::{Options, DEFAULT_WEB_PORT};
use crate::proxy::router::Upstream;

/// Root configuration for the proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Proxy listen address (e.g. "127.0.0.1:9090").
    pub listen: Option<String>,

    /// Port for the web inspection UI. 0 disables it.
    pub web_port: Option<u16>,

    /// Log filter directive; overridden by `RUST_LOG`.
    pub log_level: Option<String>,

    /// Ring-buffer capacity for the flow store.
    pub max_flows: Option<usize>,

    /// Maximum bytes captured per request/response body.
    pub max_body_size: Option<usize>,

    /// Shorthand for a single catch-all upstream; equivalent to one
    /// `[[upstreams]]` entry with prefix "/".
    pub upstream: Option<String>,

    /// Routing table for multi-upstream mode.
    pub upstreams: Vec<UpstreamConfig>,
}

/// One `[[upstreams]]` entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Display name; defaults to the prefix.
    pub name: Option<String>,

    /// URL path prefix to match; defaults to "/".
    pub prefix: Option<String>,

    /// Target base URL.
    pub target: String,
}

impl ProxyConfig {
    /// Convert into engine options, applying built-in defaults for any
    /// field left unset.
    pub fn to_options(&self) -> Options {
        let mut upstreams = Vec::new();
        if let Some(target) = &self.upstream {
            upstreams.push(Upstream {
                name: "default".to_string(),
                prefix: "/".to_string(),
                target: target.clone(),
            });
        }
        for u in &self.upstreams {
            let prefix = u.prefix.clone().unwrap_or_else(|| "/".to_string());
            let name = u.name.clone().unwrap_or_else(|| prefix.clone());
            upstreams.push(Upstream {
                name,
                prefix,
                target: u.target.clone(),
            });
        }

        Options {
            listen_addr: self.listen.clone().unwrap_or_default(),
            web_port: self.web_port.unwrap_or(DEFAULT_WEB_PORT),
            upstreams,
            max_flows: self.max_flows.unwrap_or(0),
            max_body_size: self.max_body_size.unwrap_or(0),
        }
    }

    /// The canonical example config.
    pub fn example() -> &'static str {
        r#"# flowtap configuration
# All fields are optional; CLI flags take precedence over this file.

# Proxy listen address.
listen = "127.0.0.1:9090"

# Port for the web inspection UI. Set to 0 to disable.
web_port = 9091

# Log filter directive (overridden by RUST_LOG).
log_level = "flowtap=info"

# Maximum number of flows held in memory (ring buffer).
max_flows = 1000

# Maximum bytes captured per request/response body (default: 1048576 = 1 MiB).
max_body_size = 1048576

# --- Upstream routing ---

# Single upstream: proxy everything to one target.
# upstream = "http://localhost:8081"

# Multi-upstream: route by path prefix (longer prefixes win).
[[upstreams]]
name = "ctl-api"
prefix = "/api"
target = "http://localhost:8081"

[[upstreams]]
name = "runner"
prefix = "/runner"
target = "http://localhost:8083"

[[upstreams]]
name = "dashboard"
prefix = "/"
target = "http://localhost:4000"
"#
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_config_parses() {
        let config: ProxyConfig = toml::from_str(ProxyConfig::example()).unwrap();
        assert_eq!(config.listen.as_deref(), Some("127.0.0.1:9090"));
        assert_eq!(config.upstreams.len(), 3);
        assert_eq!(config.upstreams[0].name.as_deref(), Some("ctl-api"));
    }

    #[test]
    fn single_upstream_shorthand_becomes_catch_all() {
        let config: ProxyConfig = toml::from_str(r#"upstream = "http://localhost:8081""#).unwrap();
        let opts = config.to_options();
        assert_eq!(opts.upstreams.len(), 1);
        assert_eq!(opts.upstreams[0].name, "default");
        assert_eq!(opts.upstreams[0].prefix, "/");
    }

    #[test]
    fn upstream_name_defaults_to_prefix() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [[upstreams]]
            prefix = "/api"
            target = "http://localhost:8081"
            "#,
        )
        .unwrap();
        let opts = config.to_options();
        assert_eq!(opts.upstreams[0].name, "/api");
    }
}
