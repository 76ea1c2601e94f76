//! Configuration for the warren client and server.
//!
//! Connection defaults are loaded from `~/.config/warren/config.toml`; the
//! SSH algorithm preferences and session limits are fixed here rather than
//! exposed as configuration.

use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::{Algorithm, HashAlg, PrivateKey};
use russh::{MethodKind, MethodSet, Preferred};
use serde::{Deserialize, Serialize};

use crate::error;

/// Default listening port for the server role.
pub const DEFAULT_PORT: u16 = 8022;

/// Wait bound on the transport reaching its open state.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket subprotocol carrying SSH protocol data.
pub const SSH_SUBPROTOCOL: &str = "ssh";

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub url: Option<String>,
    pub username: Option<String>,
    pub port: Option<u16>,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    pub fn config_path() -> Result<PathBuf> {
        let proj_dirs =
            ProjectDirs::from("", "", "warren").context("Could not determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }
}

/// Ordered algorithm preferences offered during key exchange.
///
/// Kex, host-key, and cipher lists are ordered by preference; the session
/// library takes the first mutually supported entry of each.
pub fn preferred() -> Preferred {
    Preferred {
        kex: Cow::Owned(vec![
            russh::kex::CURVE25519,
            russh::kex::CURVE25519_PRE_RFC_8731,
            russh::kex::DH_G14_SHA256,
        ]),
        key: Cow::Owned(vec![
            Algorithm::Ed25519,
            Algorithm::Rsa {
                hash: Some(HashAlg::Sha512),
            },
            Algorithm::Rsa {
                hash: Some(HashAlg::Sha256),
            },
        ]),
        cipher: Cow::Owned(vec![
            russh::cipher::CHACHA20_POLY1305,
            russh::cipher::AES_256_GCM,
            russh::cipher::AES_256_CTR,
            russh::cipher::AES_128_CTR,
        ]),
        mac: Preferred::DEFAULT.mac.clone(),
        compression: Preferred::DEFAULT.compression.clone(),
    }
}

/// Session configuration for the client role.
///
/// Protocol extension toggles (nodelay, keepalive) live here; russh has no
/// free-form extension-flag set.
pub fn client_config() -> Arc<russh::client::Config> {
    Arc::new(russh::client::Config {
        preferred: preferred(),
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    })
}

/// Session configuration for the server role.
pub fn server_config(host_key: PrivateKey) -> Arc<russh::server::Config> {
    let mut config = russh::server::Config {
        preferred: preferred(),
        auth_rejection_time: Duration::from_millis(250),
        auth_rejection_time_initial: Some(Duration::from_millis(0)),
        nodelay: true,
        ..Default::default()
    };

    config.methods = MethodSet::empty();
    config.methods.push(MethodKind::None);
    config.methods.push(MethodKind::PublicKey);
    config.keys.push(host_key);

    Arc::new(config)
}

/// Load the server host key from `path`, or generate an ephemeral ed25519
/// key when no path is given.
pub fn load_or_generate_host_key(path: Option<&Path>) -> error::Result<PrivateKey> {
    match path {
        Some(path) => russh::keys::load_secret_key(path, None).map_err(|e| {
            error::Error::HostKey(format!("failed to load {}: {e}", path.display()))
        }),
        None => {
            tracing::info!("no host key supplied, generating an ephemeral ed25519 key");
            PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
                .map_err(|e| error::Error::HostKey(e.to_string()))
        }
    }
}
