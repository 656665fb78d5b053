//! Configuration loading for the `zwire` binary.
//!
//! The login flow that normally produces a session is out of scope, so the
//! binary reads the same material from a JSON file instead:
//!
//! ```json
//! {
//!   "uid": "1234567890",
//!   "imei": "…",
//!   "secret_key": "base64…",
//!   "user_agent": "Mozilla/5.0 …",
//!   "cookies": ["zpw_sek=…; Domain=.zalo.me; Path=/"],
//!   "api_type": 30,
//!   "api_version": 665,
//!   "endpoints": ["wss://ws1.chat.zalo.me/ws"],
//!   "socket": { "ping_interval": 180000, "retries": { "1006": { "max": 5, "times": [1000, 5000] } } }
//! }
//! ```
//!
//! Environment variables override file values: `ZWIRE_IMEI`,
//! `ZWIRE_SECRET_KEY`, `ZWIRE_USER_AGENT`, `ZWIRE_SELF_LISTEN`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::constants::{CLIENT_ORIGIN, DEFAULT_LANGUAGE};
use crate::session::{Session, SocketSettings};
use crate::ws::http_to_ws_scheme;

/// Session material for the CLI.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Logged-in user id.
    pub uid: String,
    /// Device IMEI.
    pub imei: String,
    /// Base64 session secret key - never serialized back out.
    #[serde(skip_serializing)]
    pub secret_key: String,
    /// Browser user-agent the session was created with.
    pub user_agent: String,
    /// `accept-language` value; defaults to `vi`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// `Set-Cookie` strings scoped to the web client origin.
    pub cookies: Vec<String>,
    /// API type.
    pub api_type: u32,
    /// API version.
    pub api_version: u32,
    /// Ordered socket endpoints; `http(s)` URLs are converted to `ws(s)`.
    pub endpoints: Vec<String>,
    /// Deliver events that originate from this account.
    pub self_listen: bool,
    /// Socket settings as the server would supply them.
    pub socket: SocketSettings,
}

impl Config {
    /// Default config file path (`<config dir>/zwire/config.json`).
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().context("Could not determine config directory")?;
        Ok(dir.join("zwire").join("config.json"))
    }

    /// Load from `path` (or the default path), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_path()?,
        };
        let mut config = Self::load_from_file(&path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(imei) = lookup("ZWIRE_IMEI") {
            self.imei = imei;
        }

        if let Some(secret_key) = lookup("ZWIRE_SECRET_KEY") {
            self.secret_key = secret_key;
        }

        if let Some(user_agent) = lookup("ZWIRE_USER_AGENT") {
            self.user_agent = user_agent;
        }

        if let Some(self_listen) = lookup("ZWIRE_SELF_LISTEN") {
            if let Ok(enabled) = self_listen.parse::<bool>() {
                self.self_listen = enabled;
            } else {
                log::warn!("Ignoring ZWIRE_SELF_LISTEN={self_listen}: expected true or false");
            }
        }
    }

    /// Validate and build a [`Session`].
    pub fn into_session(self) -> Result<Session> {
        let mut builder = Session::builder()
            .uid(self.uid)
            .imei(self.imei)
            .secret_key(self.secret_key)
            .user_agent(self.user_agent)
            .language(self.language.unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()))
            .api(self.api_type, self.api_version)
            .settings(self.socket)
            .endpoints(self.endpoints.iter().map(|e| http_to_ws_scheme(e)))
            .self_listen(self.self_listen);
        for cookie in self.cookies {
            builder = builder.cookie(cookie, CLIENT_ORIGIN);
        }
        builder.build().context("Invalid session configuration")
    }
}
