use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::error;

use crate::config::{Config, ConfigStore, Slot};
use crate::error::SessionError;
use crate::remote::Connector;
use crate::session::{PersonaSession, SpeechSettings, TurnResult};

/// Shared server state: the configuration plus one swappable session per persona.
pub struct AppState {
    config: Arc<ConfigStore>,
    connector: Arc<dyn Connector>,
    speech: SpeechSettings,
    character1: RwLock<Arc<PersonaSession>>,
    character2: RwLock<Arc<PersonaSession>>,
}

impl AppState {
    pub async fn new(
        config: Arc<ConfigStore>,
        connector: Arc<dyn Connector>,
        speech: SpeechSettings,
    ) -> Self {
        let snapshot = config.snapshot().await;
        let build = |slot| {
            Arc::new(PersonaSession::new(
                snapshot.persona(slot),
                connector.clone(),
                speech,
            ))
        };
        let character1 = RwLock::new(build(Slot::Character1));
        let character2 = RwLock::new(build(Slot::Character2));

        Self {
            config,
            connector,
            speech,
            character1,
            character2,
        }
    }

    fn slot(&self, slot: Slot) -> &RwLock<Arc<PersonaSession>> {
        match slot {
            Slot::Character1 => &self.character1,
            Slot::Character2 => &self.character2,
        }
    }

    async fn session(&self, slot: Slot) -> Arc<PersonaSession> {
        self.slot(slot).read().await.clone()
    }

    /// Replaces both sessions with fresh ones built from `config`. Requests
    /// already holding the old sessions finish on them.
    async fn rebuild_sessions(&self, config: &Config) {
        for slot in [Slot::Character1, Slot::Character2] {
            let session =
                PersonaSession::new(config.persona(slot), self.connector.clone(), self.speech);
            *self.slot(slot).write().await = Arc::new(session);
        }
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(&'static str),
    Internal(&'static str),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
}

#[derive(Debug, Serialize)]
pub struct MessageBody {
    message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct NewConversations {
    message: &'static str,
    character1_history_id: String,
    character2_history_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartConversation {
    #[serde(default)]
    initial_message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartedConversation {
    character2: TurnResult,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueConversation {
    #[serde(default)]
    last_message: Option<String>,
    #[serde(default)]
    character: Option<String>,
}

pub fn router(state: Arc<AppState>, public_dir: &Path) -> Router {
    Router::new()
        .route("/config", get(get_config).post(save_config))
        .route("/start-new-conversations", post(start_new_conversations))
        .route("/start-conversation", post(start_conversation))
        .route("/continue-conversation", post(continue_conversation))
        .fallback_service(ServeDir::new(public_dir))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn get_config(State(state): State<Arc<AppState>>) -> Json<Config> {
    Json(state.config.snapshot().await)
}

async fn save_config(
    State(state): State<Arc<AppState>>,
    Json(config): Json<Config>,
) -> Json<MessageBody> {
    state.config.replace(config.clone()).await;
    state.rebuild_sessions(&config).await;
    Json(MessageBody {
        message: "Configuration saved successfully.",
    })
}

async fn start_new_conversations(
    State(state): State<Arc<AppState>>,
) -> Result<Json<NewConversations>, ApiError> {
    let character1 = state.session(Slot::Character1).await;
    let character2 = state.session(Slot::Character2).await;

    let (history1, history2) = restart(&character1, &character2).await.map_err(|e| {
        error!("Error starting new conversations: {e}");
        ApiError::Internal("Failed to start new conversations.")
    })?;

    state
        .config
        .set_history_ids(history1.clone(), history2.clone())
        .await;

    Ok(Json(NewConversations {
        message: "New conversations started successfully for both characters.",
        character1_history_id: history1,
        character2_history_id: history2,
    }))
}

async fn start_conversation(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartConversation>,
) -> Result<Json<StartedConversation>, ApiError> {
    let initial_message = request
        .initial_message
        .filter(|message| !message.is_empty())
        .ok_or(ApiError::BadRequest("Initial message is required."))?;

    let config = state.config.snapshot().await;
    let character1 = state.session(Slot::Character1).await;
    let character2 = state.session(Slot::Character2).await;

    let prefixed = format!("{}: {initial_message}", config.name(Slot::Character1));
    let reply = seed(&character1, &character2, &prefixed).await.map_err(|e| {
        error!("Error starting conversation: {e}");
        ApiError::Internal("Failed to start conversation.")
    })?;

    Ok(Json(StartedConversation { character2: reply }))
}

/// Drops both sessions and starts a new remote conversation for each.
async fn restart(
    character1: &PersonaSession,
    character2: &PersonaSession,
) -> Result<(String, String), SessionError> {
    character1.reset().await;
    character2.reset().await;
    character1.initialize().await?;
    character2.initialize().await?;
    let history1 = character1.create_new_conversation().await?;
    let history2 = character2.create_new_conversation().await?;
    Ok((history1, history2))
}

/// Only the second persona answers the seed message.
async fn seed(
    character1: &PersonaSession,
    character2: &PersonaSession,
    prefixed: &str,
) -> Result<TurnResult, SessionError> {
    character1.initialize().await?;
    character2.initialize().await?;
    character2.send_message(prefixed).await
}

async fn continue_conversation(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ContinueConversation>,
) -> Result<Json<TurnResult>, ApiError> {
    let target = request
        .character
        .filter(|character| !character.is_empty())
        .ok_or(ApiError::BadRequest("Character is required."))?;
    let target = Slot::from_str(&target)
        .map_err(|_| ApiError::BadRequest("Character must be character1 or character2."))?;
    let last_message = request
        .last_message
        .filter(|message| !message.is_empty())
        .ok_or(ApiError::BadRequest("Last message is required."))?;

    let config = state.config.snapshot().await;
    let prefixed = format!("{}: {last_message}", config.name(target.other()));

    let reply = state
        .session(target)
        .await
        .send_message(&prefixed)
        .await
        .map_err(|e| {
            error!("Error continuing conversation with {target}: {e}");
            ApiError::Internal("Failed to continue conversation.")
        })?;

    Ok(Json(reply))
}
