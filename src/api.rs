//! Encrypted HTTP request primitive.
//!
//! Every endpoint wrapper of the platform follows the same shape, which
//! this client implements once:
//!
//! 1. Serialize the call's parameters and seal them with the session secret
//!    key into a single `params` field.
//! 2. Send it (query string for GET, form body for POST) with the session's
//!    cookies and user-agent.
//! 3. The reply is `{error_code, error_message, data}` where `data` is
//!    sealed with the same key; opened, it is another
//!    `{error_code, error_message, data}` whose `data` is the result.

use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::constants::HTTP_REQUEST_TIMEOUT;
use crate::crypto::{decode_aes, encode_aes, CryptoError};
use crate::session::{Session, SessionError};

/// HTTP glue errors.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// HTTP client could not be built.
    #[error("build http client: {0}")]
    Client(#[source] reqwest::Error),
    /// Request URL could not be built.
    #[error("build url: {0}")]
    Url(#[from] SessionError),
    /// Parameters could not be serialized.
    #[error("encode params: {0}")]
    Encode(#[source] serde_json::Error),
    /// Sealing or opening a body failed.
    #[error("{op}: {source}")]
    Crypto {
        /// Operation that failed.
        op: &'static str,
        /// Underlying error.
        #[source]
        source: CryptoError,
    },
    /// Transport-level HTTP failure.
    #[error("http request: {0}")]
    Http(#[from] reqwest::Error),
    /// Non-success HTTP status.
    #[error("http status {0}")]
    Status(reqwest::StatusCode),
    /// The server reported an error code.
    #[error("server error {code}: {message}")]
    Server {
        /// Server error code.
        code: i64,
        /// Server error message.
        message: String,
    },
    /// The reply did not have the expected shape.
    #[error("decode response: {0}")]
    Decode(#[source] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct Reply<T> {
    #[serde(default)]
    error_code: i64,
    #[serde(default)]
    error_message: Option<String>,
    data: Option<T>,
}

impl<T> Reply<T> {
    fn into_data(self) -> Result<Option<T>, ApiError> {
        if self.error_code != 0 {
            return Err(ApiError::Server {
                code: self.error_code,
                message: self.error_message.unwrap_or_default(),
            });
        }
        Ok(self.data)
    }
}

/// HTTP client bound to one session.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    session: Session,
}

impl ApiClient {
    /// Client sharing the session's cookie jar and user-agent.
    pub fn new(session: Session) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(HTTP_REQUEST_TIMEOUT)
            .cookie_provider(session.cookie_jar())
            .user_agent(session.user_agent())
            .build()
            .map_err(ApiError::Client)?;
        Ok(Self { client, session })
    }

    /// Session this client signs for.
    pub fn session(&self) -> &Session {
        &self.session
    }

    fn seal<P: Serialize + ?Sized>(&self, params: &P) -> Result<String, ApiError> {
        let json = serde_json::to_string(params).map_err(ApiError::Encode)?;
        encode_aes(self.session.secret_key(), &json)
            .map_err(|source| ApiError::Crypto { op: "seal params", source })
    }

    /// GET `url` with sealed `params` in the query string.
    pub async fn get<T, P>(&self, url: &str, params: &P) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        P: Serialize + ?Sized,
    {
        let sealed = self.seal(params)?;
        let url = self.session.make_url(url, [("params", sealed)], true)?;
        log::debug!("[Api] GET {}", crate::ws::redact_query(&url));
        let response = self.client.get(&url).send().await?;
        self.resolve(response).await
    }

    /// POST `url` with sealed `params` as a form body.
    pub async fn post<T, P>(&self, url: &str, params: &P) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        P: Serialize + ?Sized,
    {
        let sealed = self.seal(params)?;
        let url = self
            .session
            .make_url(url, std::iter::empty::<(&str, &str)>(), true)?;
        log::debug!("[Api] POST {}", crate::ws::redact_query(&url));
        let response = self
            .client
            .post(&url)
            .form(&[("params", sealed)])
            .send()
            .await?;
        self.resolve(response).await
    }

    async fn resolve<T: DeserializeOwned>(&self, response: Response) -> Result<T, ApiError> {
        let status = response.status();
        if !status.is_success() {
            log::warn!("[Api] HTTP {status}");
            return Err(ApiError::Status(status));
        }

        let body = response.bytes().await?;
        let outer: Reply<String> = serde_json::from_slice(&body).map_err(ApiError::Decode)?;
        let sealed = outer.into_data()?.unwrap_or_default();
        let opened = decode_aes(self.session.secret_key(), &sealed)
            .map_err(|source| ApiError::Crypto { op: "open response", source })?;

        let inner: Reply<serde_json::Value> =
            serde_json::from_str(&opened).map_err(ApiError::Decode)?;
        let data = inner.into_data()?.unwrap_or(serde_json::Value::Null);
        T::deserialize(data).map_err(ApiError::Decode)
    }
}
