use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("request to {provider} failed: {source}")]
    Transport {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider} returned HTTP {status}: {body}")]
    Status {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("could not decode {provider} response: {reason}")]
    Decode {
        provider: &'static str,
        reason: String,
    },

    #[error("{provider} returned an empty response")]
    Empty { provider: &'static str },

    #[error("missing API key: set {0}")]
    MissingApiKey(&'static str),

    #[error("no provider registered for model {0}")]
    UnknownModel(String),

    #[error("stream consumer went away")]
    Disconnected,

    #[error("primary call failed ({primary}); fallback transport also failed ({fallback})")]
    FallbackFailed {
        primary: Box<GatewayError>,
        fallback: Box<GatewayError>,
    },
}

impl GatewayError {
    pub fn decode(provider: &'static str, reason: impl Into<String>) -> Self {
        GatewayError::Decode {
            provider,
            reason: reason.into(),
        }
    }

    /// Connect/timeout failures, rate limiting and server-side errors are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Transport { source, .. } => {
                source.is_timeout() || source.is_connect()
            }
            GatewayError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}
