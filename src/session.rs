use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::PersonaSettings;
use crate::error::SessionError;
use crate::remote::{Connection, Connector};

pub const UNPARSABLE_REPLY: &str = "Unable to parse response";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
}

/// When to ask for the speech rendering of a fresh turn.
///
/// The backend does not make a turn replayable right away, so the first
/// request waits `delay`; each failed attempt doubles the wait.
#[derive(Debug, Clone, Copy)]
pub struct SpeechSettings {
    pub delay: Duration,
    pub attempts: u32,
}

impl Default for SpeechSettings {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(1000),
            attempts: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnResult {
    pub message: String,
    pub speech_url: Option<String>,
}

struct Inner {
    state: SessionState,
    history_id: Option<String>,
    voice_id: Option<String>,
    connection: Option<Box<dyn Connection>>,
}

/// The remote chat session of one persona.
///
/// Every operation holds the session lock for its whole duration, so a reset
/// can never interleave with an initialization or a send.
pub struct PersonaSession {
    name: String,
    token: String,
    character_id: String,
    connector: Arc<dyn Connector>,
    speech: SpeechSettings,
    inner: Mutex<Inner>,
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

impl PersonaSession {
    pub fn new(
        settings: PersonaSettings,
        connector: Arc<dyn Connector>,
        speech: SpeechSettings,
    ) -> Self {
        Self {
            name: settings.name,
            token: settings.token,
            character_id: settings.character_id,
            connector,
            speech,
            inner: Mutex::new(Inner {
                state: SessionState::Uninitialized,
                history_id: non_empty(settings.history_id),
                voice_id: non_empty(settings.voice_id),
                connection: None,
            }),
        }
    }

    pub async fn initialize(&self) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;
        self.initialize_locked(&mut inner).await
    }

    /// Starts a fresh remote conversation on the live connection.
    pub async fn create_new_conversation(&self) -> Result<String, SessionError> {
        let mut inner = self.inner.lock().await;
        self.create_locked(&mut inner).await
    }

    /// Drops the connection; the next call goes through the full initialization.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        Self::reset_locked(&mut inner);
        info!("Reset session for {}", self.label());
    }

    pub async fn send_message(&self, text: &str) -> Result<TurnResult, SessionError> {
        let mut inner = self.inner.lock().await;
        self.initialize_locked(&mut inner).await?;

        let Inner {
            connection,
            voice_id,
            ..
        } = &mut *inner;
        let connection = connection.as_mut().ok_or(SessionError::NotConnected)?;

        let turn = match connection.send_message(text).await {
            Ok(turn) => turn,
            Err(e) => {
                error!("Error sending message to {}: {e}", self.label());
                return Err(e);
            }
        };
        info!("Message sent to {}: {text}", self.label());

        let Some(candidate) = turn
            .primary()
            .filter(|candidate| !candidate.raw_content.is_empty())
        else {
            warn!("Unable to parse response from {}", self.label());
            return Ok(TurnResult {
                message: UNPARSABLE_REPLY.to_string(),
                speech_url: None,
            });
        };
        info!("Received response from {}: {}", self.label(), candidate.raw_content);

        let speech_url = match voice_id.as_deref() {
            Some(voice_id) => {
                self.speech_for(
                    connection.as_mut(),
                    &turn.turn_id,
                    &candidate.candidate_id,
                    voice_id,
                )
                .await
            }
            None => {
                warn!("No voice ID known for {}, skipping speech", self.label());
                None
            }
        };

        Ok(TurnResult {
            message: candidate.raw_content.clone(),
            speech_url,
        })
    }

    fn label(&self) -> String {
        if self.name.is_empty() {
            format!("character ID {}", self.character_id)
        } else {
            format!("{} (character ID {})", self.name, self.character_id)
        }
    }

    fn reset_locked(inner: &mut Inner) {
        inner.connection = None;
        inner.state = SessionState::Uninitialized;
    }

    async fn initialize_locked(&self, inner: &mut Inner) -> Result<(), SessionError> {
        if inner.state == SessionState::Ready {
            return Ok(());
        }
        inner.state = SessionState::Initializing;

        match self.establish(inner).await {
            Ok(connection) => {
                inner.connection = Some(connection);
                inner.state = SessionState::Ready;
                Ok(())
            }
            Err(e) => {
                error!("Error initializing session for {}: {e}", self.label());
                Self::reset_locked(inner);
                Err(e)
            }
        }
    }

    async fn establish(&self, inner: &mut Inner) -> Result<Box<dyn Connection>, SessionError> {
        if self.token.is_empty() || self.character_id.is_empty() {
            return Err(SessionError::MissingCredentials);
        }

        let mut connection = self.connector.connect(&self.token).await?;
        info!("Client initialized for {}", self.label());
        connection.connect_character(&self.character_id).await?;
        info!("Connected to {}", self.label());

        match inner.history_id.clone() {
            Some(history_id) => {
                connection.attach_chat(&history_id).await?;
                info!("Loaded chat history {history_id} for {}", self.label());
            }
            None => {
                let history_id = self.create_conversation(connection.as_mut()).await?;
                inner.history_id = Some(history_id);
            }
        }

        if inner.voice_id.is_none() {
            inner.voice_id = connection.current_voice(&self.character_id).await?;
            info!(
                "Retrieved voice ID {} for {}",
                inner.voice_id.as_deref().unwrap_or("<none>"),
                self.label()
            );
        }

        Ok(connection)
    }

    async fn create_locked(&self, inner: &mut Inner) -> Result<String, SessionError> {
        let connection = inner
            .connection
            .as_mut()
            .ok_or(SessionError::NotConnected)?;
        let history_id = self.create_conversation(connection.as_mut()).await?;
        inner.history_id = Some(history_id.clone());
        Ok(history_id)
    }

    /// Creates a conversation, falling back to the most recent existing one
    /// when creation fails. The creation error wins if nothing can be adopted.
    async fn create_conversation(
        &self,
        connection: &mut dyn Connection,
    ) -> Result<String, SessionError> {
        let error = match connection.create_chat().await {
            Ok(Some(history_id)) => {
                info!(
                    "Created a new conversation for {}, new history ID: {history_id}",
                    self.label()
                );
                return Ok(history_id);
            }
            Ok(None) => SessionError::NoConversationId,
            Err(e) => e,
        };
        error!("Error creating a new conversation for {}: {error}", self.label());

        match connection.list_chats(&self.character_id).await {
            Ok(chats) => {
                if let Some(chat) = chats.into_iter().next() {
                    match connection.attach_chat(&chat.chat_id).await {
                        Ok(()) => {
                            info!(
                                "Recovered using existing conversation for {}, history ID: {}",
                                self.label(),
                                chat.chat_id
                            );
                            return Ok(chat.chat_id);
                        }
                        Err(e) => error!(
                            "Error attaching to {} for {}: {e}",
                            chat.chat_id,
                            self.label()
                        ),
                    }
                }
            }
            Err(e) => error!("Error retrieving conversation list for {}: {e}", self.label()),
        }

        Err(error)
    }

    async fn speech_for(
        &self,
        connection: &mut dyn Connection,
        turn_id: &str,
        candidate_id: &str,
        voice_id: &str,
    ) -> Option<String> {
        let mut delay = self.speech.delay;
        for attempt in 1..=self.speech.attempts.max(1) {
            tokio::time::sleep(delay).await;
            match connection.replay_speech(turn_id, candidate_id, voice_id).await {
                Ok(Some(url)) => return Some(url),
                Ok(None) => warn!(
                    "No replay URL in speech response for {} (attempt {attempt})",
                    self.label()
                ),
                Err(e) => warn!(
                    "Error generating speech for {} (attempt {attempt}): {e}",
                    self.label()
                ),
            }
            delay = delay.saturating_mul(2);
        }
        None
    }

    #[cfg(test)]
    async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    #[cfg(test)]
    async fn history_id(&self) -> Option<String> {
        self.inner.lock().await.history_id.clone()
    }
}
