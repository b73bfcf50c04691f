use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("token and character ID are required to initialize the session")]
    MissingCredentials,

    #[error("session has no live connection")]
    NotConnected,

    #[error("failed to retrieve new conversation ID after creating new conversation")]
    NoConversationId,

    #[error("remote error: {0}")]
    Remote(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
