use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;
use uuid::Uuid;

use super::{Candidate, ChatSummary, Connection, Connector, Turn};
use crate::error::SessionError;

#[derive(Debug, Clone)]
pub struct Endpoints {
    /// Account and character metadata.
    pub rest_base: String,
    /// Chats, history and speech replay.
    pub chat_base: String,
    pub socket_url: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            rest_base: "https://plus.character.ai".to_string(),
            chat_base: "https://neo.character.ai".to_string(),
            socket_url: "wss://neo.character.ai/ws/".to_string(),
        }
    }
}

/// Character.AI backend: REST for metadata and speech, the chat socket for turns.
pub struct CharacterAi {
    http: reqwest::Client,
    endpoints: Endpoints,
}

impl CharacterAi {
    pub fn new(endpoints: Endpoints) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoints,
        }
    }
}

#[derive(Deserialize)]
struct UserEnvelope {
    user: UserProfile,
}

#[derive(Deserialize)]
struct UserProfile {
    user: Account,
}

#[derive(Debug, Clone, Deserialize)]
struct Account {
    id: u64,
    username: String,
}

#[derive(Deserialize)]
struct CharacterEnvelope {
    character: CharacterInfo,
}

#[derive(Deserialize)]
struct CharacterInfo {
    #[serde(default)]
    default_voice_id: Option<String>,
}

#[derive(Deserialize)]
struct RecentChats {
    #[serde(default)]
    chats: Vec<ChatSummary>,
}

#[derive(Deserialize)]
struct ReplayResponse {
    #[serde(rename = "replayUrl", default)]
    replay_url: Option<String>,
}

#[derive(Deserialize)]
struct WireTurn {
    turn_key: TurnKey,
    #[serde(default)]
    author: Author,
    #[serde(default)]
    primary_candidate_id: String,
    #[serde(default)]
    candidates: Vec<WireCandidate>,
}

#[derive(Deserialize)]
struct TurnKey {
    turn_id: String,
}

#[derive(Default, Deserialize)]
struct Author {
    #[serde(default)]
    is_human: bool,
}

#[derive(Deserialize)]
struct WireCandidate {
    candidate_id: String,
    #[serde(default)]
    raw_content: String,
    #[serde(default)]
    is_final: bool,
}

#[async_trait]
impl Connector for CharacterAi {
    async fn connect(&self, token: &str) -> Result<Box<dyn Connection>, SessionError> {
        let authorization = format!("Token {token}");

        let envelope: UserEnvelope = self
            .http
            .get(format!("{}/chat/user/", self.endpoints.rest_base))
            .header("Authorization", &authorization)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut request = self.endpoints.socket_url.as_str().into_client_request()?;
        let cookie = HeaderValue::from_str(&format!("HTTP_AUTHORIZATION=\"{authorization}\""))
            .map_err(|e| SessionError::Remote(format!("invalid token: {e}")))?;
        request.headers_mut().insert("Cookie", cookie);
        let (socket, _) = connect_async(request).await?;

        debug!("Logged in as {}", envelope.user.user.username);

        Ok(Box::new(CharacterAiConnection {
            http: self.http.clone(),
            endpoints: self.endpoints.clone(),
            authorization,
            account: envelope.user.user,
            socket,
            character_id: None,
            chat_id: None,
        }))
    }
}

struct CharacterAiConnection {
    http: reqwest::Client,
    endpoints: Endpoints,
    authorization: String,
    account: Account,
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    character_id: Option<String>,
    chat_id: Option<String>,
}

impl CharacterAiConnection {
    fn character(&self) -> Result<String, SessionError> {
        self.character_id.clone().ok_or(SessionError::NotConnected)
    }

    fn chat(&self) -> Result<String, SessionError> {
        self.chat_id.clone().ok_or(SessionError::NotConnected)
    }

    async fn character_info(&self, character_id: &str) -> Result<CharacterInfo, SessionError> {
        let envelope: CharacterEnvelope = self
            .http
            .post(format!("{}/chat/character/info/", self.endpoints.rest_base))
            .header("Authorization", &self.authorization)
            .json(&json!({ "external_id": character_id }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(envelope.character)
    }

    /// Sends a socket command and returns its request id.
    async fn command(&mut self, command: &str, payload: Value) -> Result<String, SessionError> {
        let request_id = Uuid::new_v4().to_string();
        let frame = json!({
            "command": command,
            "request_id": request_id,
            "payload": payload,
            "origin_id": "web-next",
        });
        self.socket.send(Message::Text(frame.to_string())).await?;
        Ok(request_id)
    }

    /// Next frame answering `request_id`; frames for other requests are skipped.
    async fn reply_to(&mut self, request_id: &str) -> Result<Value, SessionError> {
        loop {
            let frame = match self.socket.next().await {
                Some(Ok(Message::Text(text))) => serde_json::from_str::<Value>(&text)?,
                Some(Ok(Message::Close(_))) | None => {
                    return Err(SessionError::Remote("chat socket closed".to_string()));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            };
            if frame["request_id"].as_str() != Some(request_id) {
                continue;
            }
            if frame["command"] == "neo_error" {
                let comment = frame["comment"].as_str().unwrap_or("unknown error");
                return Err(SessionError::Remote(comment.to_string()));
            }
            return Ok(frame);
        }
    }
}

/// The chat id carried by a `create_chat_response` frame, if this is one.
fn created_chat(frame: &Value) -> Option<Option<String>> {
    if frame["command"] != "create_chat_response" {
        return None;
    }
    Some(frame["chat"]["chat_id"].as_str().map(str::to_owned))
}

/// The character's turn once generation has finished; `None` for human
/// echoes, partial updates and unrelated frames.
fn finished_turn(frame: &Value) -> Result<Option<Turn>, SessionError> {
    let Some(turn) = frame.get("turn") else {
        return Ok(None);
    };
    let turn: WireTurn = serde_json::from_value(turn.clone())?;
    if turn.author.is_human || !turn.candidates.iter().any(|candidate| candidate.is_final) {
        return Ok(None);
    }
    Ok(Some(Turn {
        turn_id: turn.turn_key.turn_id,
        primary_candidate_id: turn.primary_candidate_id,
        candidates: turn
            .candidates
            .into_iter()
            .map(|candidate| Candidate {
                candidate_id: candidate.candidate_id,
                raw_content: candidate.raw_content,
            })
            .collect(),
    }))
}

#[async_trait]
impl Connection for CharacterAiConnection {
    async fn connect_character(&mut self, character_id: &str) -> Result<(), SessionError> {
        self.character_info(character_id).await?;
        self.character_id = Some(character_id.to_owned());
        Ok(())
    }

    async fn attach_chat(&mut self, chat_id: &str) -> Result<(), SessionError> {
        self.http
            .get(format!("{}/chat/{chat_id}/", self.endpoints.chat_base))
            .header("Authorization", &self.authorization)
            .send()
            .await?
            .error_for_status()?;
        self.chat_id = Some(chat_id.to_owned());
        Ok(())
    }

    async fn create_chat(&mut self) -> Result<Option<String>, SessionError> {
        let character_id = self.character()?;
        let payload = json!({
            "chat": {
                "chat_id": Uuid::new_v4().to_string(),
                "creator_id": self.account.id.to_string(),
                "visibility": "VISIBILITY_PRIVATE",
                "character_id": character_id,
                "type": "TYPE_ONE_ON_ONE",
            },
            "with_greeting": true,
        });
        let request_id = self.command("create_chat", payload).await?;

        loop {
            let frame = self.reply_to(&request_id).await?;
            if let Some(created) = created_chat(&frame) {
                if let Some(chat_id) = &created {
                    self.chat_id = Some(chat_id.clone());
                }
                return Ok(created);
            }
        }
    }

    async fn list_chats(&mut self, character_id: &str) -> Result<Vec<ChatSummary>, SessionError> {
        let recent: RecentChats = self
            .http
            .get(format!("{}/chats/recent/{character_id}", self.endpoints.chat_base))
            .header("Authorization", &self.authorization)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(recent.chats)
    }

    async fn send_message(&mut self, text: &str) -> Result<Turn, SessionError> {
        let character_id = self.character()?;
        let chat_id = self.chat()?;
        let candidate_id = Uuid::new_v4().to_string();
        let payload = json!({
            "num_candidates": 1,
            "tts_enabled": false,
            "selected_language": "",
            "character_id": character_id,
            "user_name": self.account.username,
            "turn": {
                "turn_key": {
                    "turn_id": Uuid::new_v4().to_string(),
                    "chat_id": chat_id,
                },
                "author": {
                    "author_id": self.account.id.to_string(),
                    "is_human": true,
                    "name": self.account.username,
                },
                "candidates": [{ "candidate_id": candidate_id, "raw_content": text }],
                "primary_candidate_id": candidate_id,
            },
        });
        let request_id = self.command("create_and_generate_turn", payload).await?;

        loop {
            let frame = self.reply_to(&request_id).await?;
            if let Some(turn) = finished_turn(&frame)? {
                return Ok(turn);
            }
        }
    }

    async fn current_voice(&mut self, character_id: &str) -> Result<Option<String>, SessionError> {
        Ok(self.character_info(character_id).await?.default_voice_id)
    }

    async fn replay_speech(
        &mut self,
        turn_id: &str,
        candidate_id: &str,
        voice_id: &str,
    ) -> Result<Option<String>, SessionError> {
        let response: ReplayResponse = self
            .http
            .post(format!("{}/multimodal/api/v1/memo/replay", self.endpoints.chat_base))
            .header("Authorization", &self.authorization)
            .json(&json!({
                "candidateId": candidate_id,
                "roomId": self.chat()?,
                "turnId": turn_id,
                "voiceId": voice_id,
                "voiceQuery": "",
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.replay_url)
    }
}
