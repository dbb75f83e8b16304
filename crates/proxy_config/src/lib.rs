//! Command-line and environment configuration.
//!
//! A single flat `clap::Parser` struct: no layered file-based config
//! merging, just clap-derived flags each with an environment-variable
//! fallback.

use std::time::Duration;

use clap::Parser;
use url::Url;

fn parse_duration_secs(s: &str) -> Result<Duration, String> {
    let secs: u64 = s.parse().map_err(|_| format!("not a number of seconds: {s}"))?;
    Ok(Duration::from_secs(secs))
}

/// Configuration for the PyPI caching proxy server.
#[derive(Debug, Clone, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Address to bind the HTTP server to.
    #[arg(long, env = "PYPI_PROXY_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: std::net::SocketAddr,

    /// Root URL of the upstream "simple" package index.
    #[arg(long, env = "PYPI_PROXY_UPSTREAM", default_value = "https://pypi.org/simple/")]
    pub upstream_index_url: Url,

    /// Directory backing the local content store. Ignored when
    /// `--object-store-uri` is set.
    #[arg(long, env = "PYPI_PROXY_CACHE_DIR", default_value = "./pypi-proxy-cache")]
    pub cache_dir: std::path::PathBuf,

    /// `opendal` backend URI (e.g. `s3://bucket/prefix`) for the
    /// object-store content store backend. When unset, the local
    /// filesystem backend is used.
    #[arg(long, env = "PYPI_PROXY_OBJECT_STORE_URI")]
    pub object_store_uri: Option<String>,

    /// Maximum size in bytes of the local content store; 0 means
    /// unlimited. Ignored by the object-store backend.
    #[arg(long, env = "PYPI_PROXY_CACHE_MAX_SIZE", default_value_t = 0)]
    pub cache_max_size: u64,

    /// How often the LRU eviction worker runs its periodic disk-sync scan.
    #[arg(long, env = "PYPI_PROXY_EVICTION_PERIOD_SECS", value_parser = parse_duration_secs, default_value = "60")]
    pub eviction_period: Duration,

    /// How long parsed index metadata stays fresh.
    #[arg(long, env = "PYPI_PROXY_INDEX_TTL_SECS", value_parser = parse_duration_secs, default_value = "1800")]
    pub index_ttl: Duration,

    /// Default per-download timeout, used when the upstream didn't report
    /// a content length.
    #[arg(long, env = "PYPI_PROXY_DEFAULT_DOWNLOAD_TIMEOUT_SECS", value_parser = parse_duration_secs, default_value = "300")]
    pub default_download_timeout: Duration,

    /// Aggregate byte budget for the serialized-response cache.
    #[arg(long, env = "PYPI_PROXY_RESPONSE_CACHE_BYTES", default_value_t = 50 * 1024 * 1024)]
    pub response_cache_max_bytes: u64,

    /// How long a completed download coordinator entry lingers before
    /// removal, so a trailing burst of requests still coalesces.
    #[arg(long, env = "PYPI_PROXY_COORDINATOR_LINGER_SECS", value_parser = parse_duration_secs, default_value = "30")]
    pub coordinator_linger: Duration,

    /// Log verbosely (`debug` instead of `info` as the default level).
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

impl Config {
    /// Parses configuration from `std::env::args()` and the environment.
    pub fn parse_from_env() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_only_required_args_are_given() {
        let config = Config::parse_from(["pypi-proxy-server"]);
        assert_eq!(config.cache_max_size, 0);
        assert_eq!(config.index_ttl, Duration::from_secs(1800));
        assert_eq!(config.response_cache_max_bytes, 50 * 1024 * 1024);
        assert_eq!(config.coordinator_linger, Duration::from_secs(30));
    }

    #[test]
    fn flags_override_defaults() {
        let config = Config::parse_from([
            "pypi-proxy-server",
            "--upstream-index-url",
            "https://example.org/simple/",
            "--cache-max-size",
            "1024",
            "--index-ttl-secs",
            "60",
        ]);
        assert_eq!(config.upstream_index_url.as_str(), "https://example.org/simple/");
        assert_eq!(config.cache_max_size, 1024);
        assert_eq!(config.index_ttl, Duration::from_secs(60));
    }
}
