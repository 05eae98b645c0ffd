//! Process configuration (§4.7, §6). Grounded in the teacher's
//! `config.rs`/`utils/cli.rs` split: a `clap`-derived `Args` for
//! process-level knobs (bind address, storage roots, database URL), and a
//! `Config`/`DualWriteConfig` pair built from it that every handler reads
//! through `AppState`.

use clap::Parser;
use regex::Regex;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Registry listening host
    #[arg(long, env = "REGISTRY_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Registry listening port
    #[arg(long, env = "REGISTRY_PORT", default_value_t = 5000)]
    pub port: u16,

    /// Root directory for the filesystem blob store and, when dual-write
    /// is mirroring, the old filesystem metadata layout.
    #[arg(long, env = "REGISTRY_ROOT_DIR", default_value = "/var/lib/registry")]
    pub root_dir: String,

    /// Postgres connection string for the new relational metadata store.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Maximum open connections in the database pool.
    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 10)]
    pub database_max_connections: u32,

    /// Public base URL this registry is reachable at, used to build
    /// absolute `Link` headers.
    #[arg(long, env = "REGISTRY_URL", default_value = "http://localhost:5000")]
    pub registry_url: String,

    /// Process-wide secret used to HMAC-sign upload session state tokens.
    #[arg(long, env = "UPLOAD_HMAC_SECRET")]
    pub upload_hmac_secret: Option<String>,

    /// Whether the new relational metadata store is enabled at all.
    #[arg(long, env = "DUAL_WRITE_DATABASE_ENABLED", default_value_t = true)]
    pub database_enabled: bool,

    /// Whether writes also mirror to the old filesystem metadata layout.
    #[arg(long, env = "DUAL_WRITE_MIRROR_FS", default_value_t = false)]
    pub mirror_fs: bool,

    /// Whether a database miss/connection error falls back to a
    /// filesystem read.
    #[arg(long, env = "DUAL_WRITE_FALLBACK_ON_DB_MISS", default_value_t = false)]
    pub fallback_on_db_miss: bool,

    /// Whether DELETE is permitted at all (blobs, manifests, tags).
    #[arg(long, env = "REGISTRY_DELETE_ENABLED", default_value_t = true)]
    pub delete_enabled: bool,

    /// Read-only mode: rejects all mutating methods with 405 before
    /// touching storage.
    #[arg(long, env = "REGISTRY_READONLY", default_value_t = false)]
    pub readonly: bool,

    /// Migration proxy: forward requests for repositories absent locally.
    #[arg(long, env = "PROXY_ENABLED", default_value_t = false)]
    pub proxy_enabled: bool,

    /// Successor registry base URL the proxy forwards to.
    #[arg(long, env = "PROXY_URL")]
    pub proxy_url: Option<String>,

    /// Repository-path regexes eligible for proxying; empty means "all".
    #[arg(long, env = "PROXY_INCLUDE", value_delimiter = ',')]
    pub proxy_include: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub enabled: bool,
    pub url: Option<String>,
    pub include: Vec<Regex>,
}

#[derive(Clone, Debug)]
pub struct DualWriteConfig {
    pub database_enabled: bool,
    pub mirror_fs: bool,
    pub fallback_on_db_miss: bool,
    pub delete_enabled: bool,
    pub readonly: bool,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub root_dir: String,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub registry_url: String,
    pub upload_hmac_secret: Vec<u8>,
    pub dual_write: DualWriteConfig,
    pub proxy: ProxyConfig,
}

/// Builds a `Config` from parsed CLI/env `Args`, validating the
/// combinations that would otherwise fail much later and far less
/// legibly (e.g. dual-write mirroring with the database disabled, or
/// proxying enabled with no upstream URL).
pub fn validate_config(args: &Args) -> anyhow::Result<Config> {
    if args.mirror_fs && !args.database_enabled {
        anyhow::bail!("mirror_fs requires database.enabled = true");
    }
    if args.database_enabled && args.database_url.is_none() {
        anyhow::bail!("database.enabled requires --database-url");
    }
    if args.proxy_enabled && args.proxy_url.is_none() {
        anyhow::bail!("proxy.enabled requires --proxy-url");
    }

    let include = args
        .proxy_include
        .iter()
        .filter(|s| !s.is_empty())
        .map(|pattern| {
            Regex::new(pattern)
                .map_err(|e| anyhow::anyhow!("invalid proxy include pattern {pattern:?}: {e}"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let secret = match &args.upload_hmac_secret {
        Some(s) if !s.is_empty() => s.as_bytes().to_vec(),
        _ => {
            tracing::warn!(
                "no UPLOAD_HMAC_SECRET configured; generating an ephemeral one for this process \
                 (upload sessions will not survive a restart)"
            );
            random_secret()
        }
    };

    Ok(Config {
        host: args.host.clone(),
        port: args.port,
        root_dir: args.root_dir.clone(),
        database_url: args.database_url.clone(),
        database_max_connections: args.database_max_connections,
        registry_url: args.registry_url.trim_end_matches('/').to_string(),
        upload_hmac_secret: secret,
        dual_write: DualWriteConfig {
            database_enabled: args.database_enabled,
            mirror_fs: args.mirror_fs,
            fallback_on_db_miss: args.fallback_on_db_miss,
            delete_enabled: args.delete_enabled,
            readonly: args.readonly,
        },
        proxy: ProxyConfig {
            enabled: args.proxy_enabled,
            url: args.proxy_url.clone(),
            include,
        },
    })
}

/// Ephemeral fallback secret for dev/test runs with no configured HMAC
/// key, sourced from the uuid crate already in the dependency tree rather
/// than pulling in a dedicated CSPRNG crate for 32 bytes.
fn random_secret() -> Vec<u8> {
    let mut bytes = Vec::with_capacity(32);
    bytes.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    bytes.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args {
            host: "127.0.0.1".into(),
            port: 5000,
            root_dir: "/tmp/registry".into(),
            database_url: Some("postgres://localhost/registry".into()),
            database_max_connections: 10,
            registry_url: "http://localhost:5000/".into(),
            upload_hmac_secret: Some("secret".into()),
            database_enabled: true,
            mirror_fs: false,
            fallback_on_db_miss: false,
            delete_enabled: true,
            readonly: false,
            proxy_enabled: false,
            proxy_url: None,
            proxy_include: vec![],
        }
    }

    #[test]
    fn trims_trailing_slash_from_registry_url() {
        let cfg = validate_config(&base_args()).unwrap();
        assert_eq!(cfg.registry_url, "http://localhost:5000");
    }

    #[test]
    fn rejects_mirror_fs_without_database() {
        let mut args = base_args();
        args.database_enabled = false;
        args.mirror_fs = true;
        assert!(validate_config(&args).is_err());
    }

    #[test]
    fn rejects_proxy_without_url() {
        let mut args = base_args();
        args.proxy_enabled = true;
        args.proxy_url = None;
        assert!(validate_config(&args).is_err());
    }

    #[test]
    fn compiles_proxy_include_patterns() {
        let mut args = base_args();
        args.proxy_include = vec!["^foo/".into()];
        let cfg = validate_config(&args).unwrap();
        assert_eq!(cfg.proxy.include.len(), 1);
        assert!(cfg.proxy.include[0].is_match("foo/bar"));
    }
}
