//! Session context consulted by the realtime client and the HTTP glue.
//!
//! A [`Session`] is produced once by the login/collaborator layer and then
//! shared read-only: identifiers, the secret key, the cookie jar, the ordered
//! socket endpoint list, and the server-supplied socket settings (ping
//! interval, retry tables, rotation codes).

use std::collections::HashMap;
use std::sync::Arc;

use reqwest::cookie::{CookieStore, Jar};
use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

use crate::constants::{CLIENT_ORIGIN, DEFAULT_LANGUAGE, HANDSHAKE_SIGN_TYPE};
use crate::params::sign_key;

/// Construction errors. These never reach the network.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A required credential is missing or empty.
    #[error("session is missing {0}")]
    MissingField(&'static str),
    /// No socket endpoints were supplied.
    #[error("session has no socket endpoints")]
    NoEndpoints,
    /// An endpoint or base URL could not be parsed.
    #[error("invalid url {url}: {source}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// Parser error.
        #[source]
        source: url::ParseError,
    },
}

/// Retry rule for one close code: attempt budget and delay table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRule {
    /// Maximum attempts, the initial connection included.
    pub max: u32,
    /// Delays in milliseconds, indexed by retry number. A bare number is
    /// accepted as a one-entry table.
    #[serde(deserialize_with = "one_or_many")]
    pub times: Vec<u64>,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(u64),
        Many(Vec<u64>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(delay) => vec![delay],
        OneOrMany::Many(delays) => delays,
    })
}

/// Server-supplied socket settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketSettings {
    /// Keepalive interval in milliseconds; `0` disables keepalive.
    pub ping_interval: u64,
    /// Retry rules keyed by close code.
    pub retries: HashMap<u16, RetryRule>,
    /// Close codes that advance to the next endpoint before reconnecting.
    pub rotate_error_codes: Vec<u16>,
    /// Close codes eligible for retry. Empty means every code in `retries`.
    pub close_and_retry_codes: Vec<u16>,
}

/// Authenticated session shared by the listener and HTTP calls.
#[derive(Clone)]
pub struct Session {
    uid: String,
    imei: String,
    secret_key: String,
    user_agent: String,
    language: String,
    api_type: u32,
    api_version: u32,
    cookies: Arc<Jar>,
    settings: SocketSettings,
    endpoints: Vec<String>,
    self_listen: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("uid", &self.uid)
            .field("api_type", &self.api_type)
            .field("api_version", &self.api_version)
            .field("endpoints", &self.endpoints)
            .field("self_listen", &self.self_listen)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a new session builder.
    #[must_use]
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// Logged-in user id.
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Device IMEI.
    pub fn imei(&self) -> &str {
        &self.imei
    }

    /// Base64 session secret key for HTTP body encryption.
    pub fn secret_key(&self) -> &str {
        &self.secret_key
    }

    /// User-agent sent with every request.
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// `accept-language` value.
    pub fn language(&self) -> &str {
        &self.language
    }

    /// API type identifier.
    pub fn api_type(&self) -> u32 {
        self.api_type
    }

    /// API version identifier.
    pub fn api_version(&self) -> u32 {
        self.api_version
    }

    /// Shared cookie jar.
    pub fn cookie_jar(&self) -> Arc<Jar> {
        Arc::clone(&self.cookies)
    }

    /// Socket settings.
    pub fn settings(&self) -> &SocketSettings {
        &self.settings
    }

    /// Ordered socket endpoint list (never empty).
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Whether events originating from this session are delivered.
    pub fn self_listen(&self) -> bool {
        self.self_listen
    }

    /// `Cookie` header value the web client would send.
    pub fn cookie_header(&self) -> Option<String> {
        let origin = Url::parse(CLIENT_ORIGIN).ok()?;
        self.cookies
            .cookies(&origin)
            .and_then(|value| value.to_str().ok().map(str::to_string))
    }

    /// Append `params` and optionally the API version/type to `base`.
    ///
    /// Parameters already present in `base` are left untouched.
    pub fn make_url<I, K, V>(
        &self,
        base: &str,
        params: I,
        with_api_version: bool,
    ) -> Result<String, SessionError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut url = Url::parse(base).map_err(|source| SessionError::InvalidUrl {
            url: base.to_string(),
            source,
        })?;

        let mut present: Vec<String> = url.query_pairs().map(|(k, _)| k.into_owned()).collect();
        let mut extra: Vec<(String, String)> = Vec::new();
        for (key, value) in params {
            let key = key.as_ref();
            if !present.iter().any(|p| p == key) {
                present.push(key.to_string());
                extra.push((key.to_string(), value.as_ref().to_string()));
            }
        }
        if with_api_version {
            if !present.iter().any(|p| p == "zpw_ver") {
                extra.push(("zpw_ver".to_string(), self.api_version.to_string()));
            }
            if !present.iter().any(|p| p == "zpw_type") {
                extra.push(("zpw_type".to_string(), self.api_type.to_string()));
            }
        }

        if !extra.is_empty() {
            url.query_pairs_mut().extend_pairs(extra);
        }
        Ok(url.into())
    }

    /// Time-stamped, signed handshake URL for one endpoint.
    pub fn handshake_url(&self, endpoint: &str, now_ms: i64) -> Result<String, SessionError> {
        let unsigned = self.make_url(endpoint, [("t", now_ms.to_string())], true)?;
        let parsed = Url::parse(&unsigned).map_err(|source| SessionError::InvalidUrl {
            url: unsigned.clone(),
            source,
        })?;
        let signkey = sign_key(
            HANDSHAKE_SIGN_TYPE,
            parsed.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())),
        );
        self.make_url(&unsigned, [("signkey", signkey)], false)
    }
}

/// Builder for [`Session`].
#[derive(Debug, Default)]
pub struct SessionBuilder {
    uid: Option<String>,
    imei: Option<String>,
    secret_key: Option<String>,
    user_agent: Option<String>,
    language: Option<String>,
    api_type: u32,
    api_version: u32,
    cookies: Vec<(String, String)>,
    settings: SocketSettings,
    endpoints: Vec<String>,
    self_listen: bool,
}

impl SessionBuilder {
    /// Logged-in user id (required).
    #[must_use]
    pub fn uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    /// Device IMEI (required).
    #[must_use]
    pub fn imei(mut self, imei: impl Into<String>) -> Self {
        self.imei = Some(imei.into());
        self
    }

    /// Base64 session secret key (required).
    #[must_use]
    pub fn secret_key(mut self, key: impl Into<String>) -> Self {
        self.secret_key = Some(key.into());
        self
    }

    /// User-agent (required).
    #[must_use]
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    /// `accept-language`, defaults to [`DEFAULT_LANGUAGE`].
    #[must_use]
    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// API type and version (both required, non-zero).
    #[must_use]
    pub fn api(mut self, api_type: u32, api_version: u32) -> Self {
        self.api_type = api_type;
        self.api_version = api_version;
        self
    }

    /// Add a cookie as a `Set-Cookie` string scoped to `url`.
    #[must_use]
    pub fn cookie(mut self, set_cookie: impl Into<String>, url: impl Into<String>) -> Self {
        self.cookies.push((set_cookie.into(), url.into()));
        self
    }

    /// Socket settings from the server.
    #[must_use]
    pub fn settings(mut self, settings: SocketSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Ordered socket endpoints (at least one required).
    #[must_use]
    pub fn endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoints = endpoints.into_iter().map(Into::into).collect();
        self
    }

    /// Deliver events that originate from this session.
    #[must_use]
    pub fn self_listen(mut self, enable: bool) -> Self {
        self.self_listen = enable;
        self
    }

    /// Validate and build the session.
    pub fn build(self) -> Result<Session, SessionError> {
        fn required(value: Option<String>, name: &'static str) -> Result<String, SessionError> {
            value
                .filter(|v| !v.is_empty())
                .ok_or(SessionError::MissingField(name))
        }

        let uid = required(self.uid, "uid")?;
        let imei = required(self.imei, "imei")?;
        let secret_key = required(self.secret_key, "secret_key")?;
        let user_agent = required(self.user_agent, "user_agent")?;
        if self.api_type == 0 {
            return Err(SessionError::MissingField("api_type"));
        }
        if self.api_version == 0 {
            return Err(SessionError::MissingField("api_version"));
        }
        if self.endpoints.is_empty() {
            return Err(SessionError::NoEndpoints);
        }
        for endpoint in &self.endpoints {
            Url::parse(endpoint).map_err(|source| SessionError::InvalidUrl {
                url: endpoint.clone(),
                source,
            })?;
        }

        let jar = Jar::default();
        for (set_cookie, scope) in &self.cookies {
            let scope_url = Url::parse(scope).map_err(|source| SessionError::InvalidUrl {
                url: scope.clone(),
                source,
            })?;
            jar.add_cookie_str(set_cookie, &scope_url);
        }

        Ok(Session {
            uid,
            imei,
            secret_key,
            user_agent,
            language: self
                .language
                .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
            api_type: self.api_type,
            api_version: self.api_version,
            cookies: Arc::new(jar),
            settings: self.settings,
            endpoints: self.endpoints,
            self_listen: self.self_listen,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::builder()
            .uid("1234567890")
            .imei("imei-abc")
            .secret_key("AAAAAAAAAAAAAAAAAAAAAA==")
            .user_agent("Mozilla/5.0")
            .api(30, 665)
            .cookie("zpw_sek=abc; Domain=chat.zalo.me; Path=/", CLIENT_ORIGIN)
            .endpoints(["wss://ws1.example.test/websocket", "wss://ws2.example.test/websocket"])
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_fields() {
        let err = Session::builder().imei("x").build().unwrap_err();
        assert!(matches!(err, SessionError::MissingField("uid")));

        let err = Session::builder()
            .uid("1")
            .imei("x")
            .secret_key("k")
            .user_agent("ua")
            .api(30, 665)
            .build()
            .unwrap_err();
        assert!(matches!(err, SessionError::NoEndpoints));
    }

    #[test]
    fn test_builder_rejects_bad_endpoint() {
        let err = Session::builder()
            .uid("1")
            .imei("x")
            .secret_key("k")
            .user_agent("ua")
            .api(30, 665)
            .endpoints(["not a url"])
            .build()
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidUrl { .. }));
    }

    #[test]
    fn test_cookie_header_from_jar() {
        assert_eq!(session().cookie_header().as_deref(), Some("zpw_sek=abc"));
    }

    #[test]
    fn test_make_url_appends_api_version() {
        let url = session()
            .make_url("https://api.example.test/path?a=1", [("b", "2"), ("a", "9")], true)
            .unwrap();
        assert_eq!(url, "https://api.example.test/path?a=1&b=2&zpw_ver=665&zpw_type=30");
    }

    #[test]
    fn test_make_url_without_api_version() {
        let url = session()
            .make_url("https://api.example.test/", [("b", "2")], false)
            .unwrap();
        assert_eq!(url, "https://api.example.test/?b=2");
    }

    #[test]
    fn test_handshake_url_is_signed() {
        let url = session()
            .handshake_url("wss://ws1.example.test/websocket", 1_700_000_000_000)
            .unwrap();
        let parsed = Url::parse(&url).unwrap();
        let pairs: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let signkey = pairs.iter().find(|(k, _)| k == "signkey").unwrap().1.clone();
        let unsigned: Vec<_> = pairs.into_iter().filter(|(k, _)| k != "signkey").collect();

        assert!(unsigned.contains(&("t".to_string(), "1700000000000".to_string())));
        assert!(unsigned.contains(&("zpw_type".to_string(), "30".to_string())));
        assert_eq!(signkey, sign_key(HANDSHAKE_SIGN_TYPE, unsigned));
    }

    #[test]
    fn test_retry_rule_accepts_bare_number() {
        let settings: SocketSettings = serde_json::from_str(
            r#"{"ping_interval": 20000, "retries": {"1006": {"max": 3, "times": 5000}, "1000": {"max": 2, "times": [100, 200]}}}"#,
        )
        .unwrap();
        assert_eq!(settings.retries[&1006].times, vec![5000]);
        assert_eq!(settings.retries[&1000].times, vec![100, 200]);
        assert!(settings.rotate_error_codes.is_empty());
    }
}
