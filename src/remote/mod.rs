pub(crate) mod character_ai;
#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::SessionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub candidate_id: String,
    pub raw_content: String,
}

/// One reply turn, with every candidate the backend generated for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub turn_id: String,
    pub primary_candidate_id: String,
    pub candidates: Vec<Candidate>,
}

impl Turn {
    pub fn primary(&self) -> Option<&Candidate> {
        self.candidates
            .iter()
            .find(|candidate| candidate.candidate_id == self.primary_candidate_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChatSummary {
    pub chat_id: String,
}

/// Opens authenticated connections to the conversational backend.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, token: &str) -> Result<Box<dyn Connection>, SessionError>;
}

/// A live, authenticated connection bound to at most one character and chat.
#[async_trait]
pub trait Connection: Send {
    async fn connect_character(&mut self, character_id: &str) -> Result<(), SessionError>;

    /// Makes an existing chat the target of subsequent messages.
    async fn attach_chat(&mut self, chat_id: &str) -> Result<(), SessionError>;

    /// Starts a fresh chat with the connected character and attaches to it.
    /// Returns the new chat id when the backend reports one.
    async fn create_chat(&mut self) -> Result<Option<String>, SessionError>;

    /// Lists existing chats with the character, most recent first.
    async fn list_chats(&mut self, character_id: &str) -> Result<Vec<ChatSummary>, SessionError>;

    async fn send_message(&mut self, text: &str) -> Result<Turn, SessionError>;

    async fn current_voice(&mut self, character_id: &str) -> Result<Option<String>, SessionError>;

    /// Renders one candidate of a turn to speech and returns a playable URL.
    async fn replay_speech(
        &mut self,
        turn_id: &str,
        candidate_id: &str,
        voice_id: &str,
    ) -> Result<Option<String>, SessionError>;
}
