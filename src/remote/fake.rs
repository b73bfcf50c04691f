//! Scripted in-memory backend for tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{Candidate, ChatSummary, Connection, Connector, Turn};
use crate::error::SessionError;

/// How the fake answers. Every connection shares the same script and log.
pub struct Script {
    pub fail_connect: bool,
    pub fail_create: bool,
    pub create_yields_nothing: bool,
    /// `None` makes listing fail.
    pub existing_chats: Option<Vec<String>>,
    pub fail_send: bool,
    /// Reply whose primary candidate id matches none of its candidates.
    pub unparsable_reply: bool,
    pub default_voice: Option<String>,
    /// Replay attempts that fail before `speech_url` is returned.
    pub speech_failures: u32,
    pub speech_url: Option<String>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            fail_connect: false,
            fail_create: false,
            create_yields_nothing: false,
            existing_chats: Some(Vec::new()),
            fail_send: false,
            unparsable_reply: false,
            default_voice: Some("voice-default".to_string()),
            speech_failures: 0,
            speech_url: Some("https://audio.test/replay.mp3".to_string()),
        }
    }
}

#[derive(Default)]
struct Shared {
    script: Script,
    /// `(token, call)` pairs in call order.
    calls: Vec<(String, String)>,
    /// Conversations created per token.
    created: HashMap<String, u32>,
    turns: u32,
    replays: u32,
}

#[derive(Clone, Default)]
pub struct FakeBackend {
    shared: Arc<Mutex<Shared>>,
}

impl FakeBackend {
    pub fn new(script: Script) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                script,
                ..Shared::default()
            })),
        }
    }

    pub fn script(&self, update: impl FnOnce(&mut Script)) {
        update(&mut self.shared.lock().unwrap().script);
    }

    /// Calls made through connections opened with `token`.
    pub fn calls_for(&self, token: &str) -> Vec<String> {
        self.shared
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(owner, _)| owner == token)
            .map(|(_, call)| call.clone())
            .collect()
    }

    pub fn count(&self, token: &str, prefix: &str) -> usize {
        self.calls_for(token)
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.shared.lock().unwrap().calls.len()
    }
}

#[async_trait]
impl Connector for FakeBackend {
    async fn connect(&self, token: &str) -> Result<Box<dyn Connection>, SessionError> {
        let mut shared = self.shared.lock().unwrap();
        shared.calls.push((token.to_string(), "login".to_string()));
        if shared.script.fail_connect {
            return Err(SessionError::Remote("login rejected".to_string()));
        }
        Ok(Box::new(FakeConnection {
            token: token.to_string(),
            shared: self.shared.clone(),
        }))
    }
}

struct FakeConnection {
    token: String,
    shared: Arc<Mutex<Shared>>,
}

impl FakeConnection {
    fn record(&self, call: String) -> std::sync::MutexGuard<'_, Shared> {
        let mut shared = self.shared.lock().unwrap();
        shared.calls.push((self.token.clone(), call));
        shared
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn connect_character(&mut self, character_id: &str) -> Result<(), SessionError> {
        self.record(format!("connect_character:{character_id}"));
        Ok(())
    }

    async fn attach_chat(&mut self, chat_id: &str) -> Result<(), SessionError> {
        self.record(format!("attach:{chat_id}"));
        Ok(())
    }

    async fn create_chat(&mut self) -> Result<Option<String>, SessionError> {
        let mut shared = self.record("create".to_string());
        if shared.script.fail_create {
            return Err(SessionError::Remote("create failed".to_string()));
        }
        if shared.script.create_yields_nothing {
            return Ok(None);
        }
        let created = shared.created.entry(self.token.clone()).or_default();
        *created += 1;
        Ok(Some(format!("{}-chat-{created}", self.token)))
    }

    async fn list_chats(&mut self, character_id: &str) -> Result<Vec<ChatSummary>, SessionError> {
        let shared = self.record(format!("list:{character_id}"));
        match &shared.script.existing_chats {
            Some(chats) => Ok(chats
                .iter()
                .map(|chat_id| ChatSummary {
                    chat_id: chat_id.clone(),
                })
                .collect()),
            None => Err(SessionError::Remote("listing failed".to_string())),
        }
    }

    async fn send_message(&mut self, text: &str) -> Result<Turn, SessionError> {
        let mut shared = self.record(format!("send:{text}"));
        if shared.script.fail_send {
            return Err(SessionError::Remote("send failed".to_string()));
        }
        shared.turns += 1;
        let candidate_id = format!("cand-{}", shared.turns);
        let primary_candidate_id = if shared.script.unparsable_reply {
            "missing".to_string()
        } else {
            candidate_id.clone()
        };
        Ok(Turn {
            turn_id: format!("turn-{}", shared.turns),
            primary_candidate_id,
            candidates: vec![Candidate {
                candidate_id,
                raw_content: format!("reply to {text}"),
            }],
        })
    }

    async fn current_voice(&mut self, character_id: &str) -> Result<Option<String>, SessionError> {
        let shared = self.record(format!("voice:{character_id}"));
        Ok(shared.script.default_voice.clone())
    }

    async fn replay_speech(
        &mut self,
        turn_id: &str,
        candidate_id: &str,
        voice_id: &str,
    ) -> Result<Option<String>, SessionError> {
        let mut shared = self.record(format!("replay:{turn_id}:{candidate_id}:{voice_id}"));
        shared.replays += 1;
        if shared.replays <= shared.script.speech_failures {
            return Err(SessionError::Remote("turn not ready".to_string()));
        }
        Ok(shared.script.speech_url.clone())
    }
}
