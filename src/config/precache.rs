//! Active configuration for the precache daemon.
//!
//! Keeps a "load from a well-known path, fail loudly on a malformed file,
//! never on a missing one" shape, backed by `toml` + `serde`, following the
//! `toml`-based config loading used in `MystenLabs-sui`,
//! `paritytech-polkadot-sdk`, and `saketh-are-nearcore`.

use std::path::{Path, PathBuf};

use anyhow::{format_err, Context, Error};
use serde::Deserialize;

use super::units::{parse_bytesize, parse_duration, DurationLimit, SizeLimit};

/// Raw, as-written TOML shape. Every field is optional so a partial config
/// file only overrides the defaults it actually names.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    precache: Option<RawPrecache>,
    upstream: Option<RawUpstream>,
    httpd: Option<RawHttpd>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPrecache {
    location: Option<String>,
    index: Option<String>,
    size: Option<String>,
    age_threshold: Option<String>,
    expiry: Option<String>,
    chunk_size: Option<String>,
    checksum_concurrency: Option<usize>,
    mismatch_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RawUpstream {
    max_connections: Option<usize>,
    base_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawHttpd {
    bind_address: Option<String>,
    listen: Option<u16>,
    timeout: Option<String>,
    authentication: Option<Vec<String>>,
}

/// Fully resolved configuration, with every recognized key defaulted.
#[derive(Debug, Clone)]
pub struct Config {
    pub precache_location: PathBuf,
    pub precache_index: PathBuf,
    pub precache_size: SizeLimit,
    pub age_threshold: DurationLimit,
    pub expiry: DurationLimit,
    pub chunk_size: u64,
    /// Concurrency of the checksum worker pool; defaults to the CPU count.
    pub checksum_concurrency: usize,
    /// Number of extra fetch attempts after a checksum mismatch before an
    /// entity is marked `Failed`. Configurable rather than fixed at one.
    pub mismatch_retries: u32,

    pub max_connections: usize,
    /// Base URL the reference `HttpUpstreamGateway` fetches objects from
    /// (`upstream.base_url`); added so `bin/irobotd.rs` has something
    /// concrete to point at.
    pub upstream_base_url: String,

    pub bind_address: String,
    pub listen: u16,
    pub httpd_timeout_secs: u64,
    pub authentication: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            precache_location: PathBuf::from("/var/lib/irobot/precache"),
            precache_index: PathBuf::from("/var/lib/irobot/precache/index.db"),
            precache_size: SizeLimit::Unlimited,
            age_threshold: DurationLimit::Unlimited,
            expiry: DurationLimit::Unlimited,
            chunk_size: 64 * 1024 * 1024,
            checksum_concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            mismatch_retries: 1,
            max_connections: 30,
            upstream_base_url: "http://localhost:9000".to_string(),
            bind_address: "0.0.0.0".to_string(),
            listen: 5000,
            httpd_timeout_secs: 30,
            authentication: Vec::new(),
        }
    }
}

impl Config {
    /// Loads config from `path`. A missing file yields defaults; a
    /// malformed file is an error.
    pub fn load(path: &Path) -> Result<Config, Error> {
        let raw = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(format_err!("unable to read {:?} - {}", path, err)),
        };

        let parsed: RawConfig = toml::from_str(&raw)
            .with_context(|| format!("unable to parse config file {:?}", path))?;

        let mut cfg = Config::default();

        if let Some(p) = parsed.precache {
            if let Some(location) = p.location {
                cfg.precache_index = Path::new(&location).join("index.db");
                cfg.precache_location = PathBuf::from(location);
            }
            if let Some(index) = p.index {
                cfg.precache_index = PathBuf::from(index);
            }
            if let Some(size) = p.size {
                cfg.precache_size = parse_bytesize(&size)
                    .with_context(|| "invalid precache.size".to_string())?;
            }
            if let Some(age_threshold) = p.age_threshold {
                cfg.age_threshold = parse_duration(&age_threshold)
                    .with_context(|| "invalid precache.age_threshold".to_string())?;
            }
            if let Some(expiry) = p.expiry {
                cfg.expiry = parse_duration(&expiry)
                    .with_context(|| "invalid precache.expiry".to_string())?;
            }
            if let Some(chunk_size) = p.chunk_size {
                cfg.chunk_size = parse_bytesize(&chunk_size)
                    .with_context(|| "invalid precache.chunk_size".to_string())?
                    .as_bytes()
                    .ok_or_else(|| format_err!("precache.chunk_size cannot be 'unlimited'"))?;
            }
            if let Some(checksum_concurrency) = p.checksum_concurrency {
                cfg.checksum_concurrency = checksum_concurrency;
            }
            if let Some(mismatch_retries) = p.mismatch_retries {
                cfg.mismatch_retries = mismatch_retries;
            }
        }

        if let Some(u) = parsed.upstream {
            if let Some(max_connections) = u.max_connections {
                cfg.max_connections = max_connections;
            }
            if let Some(base_url) = u.base_url {
                cfg.upstream_base_url = base_url;
            }
        }

        if let Some(h) = parsed.httpd {
            if let Some(bind_address) = h.bind_address {
                cfg.bind_address = bind_address;
            }
            if let Some(listen) = h.listen {
                cfg.listen = listen;
            }
            if let Some(timeout) = h.timeout {
                cfg.httpd_timeout_secs = match parse_duration(&timeout)
                    .with_context(|| "invalid httpd.timeout".to_string())?
                {
                    DurationLimit::Unlimited => {
                        bail_unlimited_timeout()?
                    }
                    DurationLimit::Seconds(s) => s,
                    DurationLimit::Years(_) => {
                        return Err(format_err!("httpd.timeout cannot be specified in years"))
                    }
                };
            }
            if let Some(authentication) = h.authentication {
                cfg.authentication = authentication;
            }
        }

        Ok(cfg)
    }

    /// JSON echo of the active config, served at `GET /config`.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "precache": {
                "location": self.precache_location,
                "index": self.precache_index,
                "size": self.precache_size.as_bytes(),
                "age_threshold": format_duration(&self.age_threshold),
                "expiry": format_duration(&self.expiry),
                "chunk_size": self.chunk_size,
                "checksum_concurrency": self.checksum_concurrency,
                "mismatch_retries": self.mismatch_retries,
            },
            "upstream": {
                "max_connections": self.max_connections,
                "base_url": self.upstream_base_url,
            },
            "httpd": {
                "bind_address": self.bind_address,
                "listen": self.listen,
                "timeout": self.httpd_timeout_secs,
                "authentication": self.authentication,
            },
        })
    }
}

fn bail_unlimited_timeout() -> Result<u64, Error> {
    Err(format_err!("httpd.timeout cannot be 'unlimited'"))
}

fn format_duration(d: &DurationLimit) -> serde_json::Value {
    match d {
        DurationLimit::Unlimited => serde_json::Value::String("unlimited".to_string()),
        DurationLimit::Seconds(s) => serde_json::Value::String(format!("{}s", s)),
        DurationLimit::Years(y) => serde_json::Value::String(format!("{}y", y)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = Config::load(Path::new("/nonexistent/irobot.toml")).unwrap();
        assert_eq!(cfg.max_connections, 30);
        assert_eq!(cfg.precache_size, SizeLimit::Unlimited);
    }

    #[test]
    fn parses_full_config() {
        let mut path = std::env::temp_dir();
        path.push(format!("irobot-cfg-test-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            r#"
            [precache]
            location = "/srv/irobot"
            size = "500Gi"
            age_threshold = "unlimited"
            expiry = "4w"
            chunk_size = "64Mi"

            [upstream]
            max_connections = 12

            [httpd]
            bind_address = "127.0.0.1"
            listen = 8080
            timeout = "1h"
            authentication = ["basic", "token"]
            "#,
        )
        .unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.precache_location, PathBuf::from("/srv/irobot"));
        assert_eq!(cfg.precache_size, SizeLimit::Bytes(500 * 1024 * 1024 * 1024));
        assert_eq!(cfg.expiry, DurationLimit::Seconds(4 * 7 * 86400));
        assert_eq!(cfg.chunk_size, 64 * 1024 * 1024);
        assert_eq!(cfg.max_connections, 12);
        assert_eq!(cfg.listen, 8080);
        assert_eq!(cfg.httpd_timeout_secs, 3600);
        assert_eq!(cfg.authentication, vec!["basic".to_string(), "token".to_string()]);

        std::fs::remove_file(&path).ok();
    }
}
