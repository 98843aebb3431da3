use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("request to {path} failed: {source}")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{path} returned HTTP {status}")]
    Status {
        path: String,
        status: reqwest::StatusCode,
    },

    #[error("unexpected payload from {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid gateway URL: {0}")]
    InvalidUrl(String),

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("invalid push channel URL: {0}")]
    InvalidUrl(String),

    #[error("handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),
}
