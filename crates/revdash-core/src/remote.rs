//! Shared HTTP plumbing for the remote adapters.

use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::error::ErrorCode;

/// Timeout applied to every remote request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const USER_AGENT: &str = concat!("revdash/", env!("CARGO_PKG_VERSION"));

/// Failure talking to a remote service.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("{url}: {message}")]
    Transport { url: String, message: String },

    #[error("{url}: HTTP {status}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("{url}: not found")]
    NotFound { url: String },

    #[error("{url}: unauthorized")]
    Unauthorized { url: String },

    #[error("{url}: undecodable response: {message}")]
    Decode { url: String, message: String },
}

impl FetchError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Transport { .. } | Self::Status { .. } => ErrorCode::RemoteFetchFailed,
            Self::NotFound { .. } => ErrorCode::RemoteNotFound,
            Self::Unauthorized { .. } => ErrorCode::RemoteUnauthorized,
            Self::Decode { .. } => ErrorCode::RemoteParseFailed,
        }
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    #[must_use]
    pub const fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    /// Classify a ureq failure for `url`.
    #[must_use]
    pub fn from_ureq(url: &str, err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(404, _) => Self::NotFound {
                url: url.to_string(),
            },
            ureq::Error::Status(401 | 403, _) => Self::Unauthorized {
                url: url.to_string(),
            },
            ureq::Error::Status(status, response) => Self::Status {
                url: url.to_string(),
                status,
                body: response.into_string().unwrap_or_default(),
            },
            ureq::Error::Transport(transport) => Self::Transport {
                url: url.to_string(),
                message: transport.to_string(),
            },
        }
    }
}

/// Agent with the crate's timeout and user agent.
#[must_use]
pub fn agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()
}

/// Agent that reports redirects instead of following them, for cookie
/// exchanges.
#[must_use]
pub fn agent_without_redirects() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(USER_AGENT)
        .redirects(0)
        .build()
}

/// Send `request` and decode a JSON body.
///
/// # Errors
///
/// Returns the classified [`FetchError`].
pub fn call_json<T: DeserializeOwned>(url: &str, request: ureq::Request) -> Result<T, FetchError> {
    tracing::debug!(url, "fetch");
    let response = request
        .call()
        .map_err(|err| FetchError::from_ureq(url, err))?;
    response.into_json::<T>().map_err(|err| FetchError::Decode {
        url: url.to_string(),
        message: err.to_string(),
    })
}

/// Send `request` and return the body text.
///
/// # Errors
///
/// Returns the classified [`FetchError`].
pub fn call_text(url: &str, request: ureq::Request) -> Result<String, FetchError> {
    tracing::debug!(url, "fetch");
    let response = request
        .call()
        .map_err(|err| FetchError::from_ureq(url, err))?;
    response.into_string().map_err(|err| FetchError::Transport {
        url: url.to_string(),
        message: err.to_string(),
    })
}
