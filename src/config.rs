use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use strum::{Display, EnumString};
use tokio::sync::RwLock;
use tracing::{error, info};

/// One of the two fixed persona positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Slot {
    Character1,
    Character2,
}

impl Slot {
    pub fn other(self) -> Self {
        match self {
            Slot::Character1 => Slot::Character2,
            Slot::Character2 => Slot::Character1,
        }
    }
}

/// The persisted document, kept in the flat layout the web UI reads and writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(deserialize_with = "lenient_string")]
    pub character1_name: String,
    #[serde(deserialize_with = "lenient_string")]
    pub character1_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub character1_token: String,
    #[serde(deserialize_with = "lenient_string")]
    pub character1_voice_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub character1_history_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub character1_audio_device: String,
    #[serde(deserialize_with = "lenient_string")]
    pub character2_name: String,
    #[serde(deserialize_with = "lenient_string")]
    pub character2_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub character2_token: String,
    #[serde(deserialize_with = "lenient_string")]
    pub character2_voice_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub character2_history_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub character2_audio_device: String,
    #[serde(deserialize_with = "lenient_string")]
    pub web_next_auth: String,
    /// Seconds between persona turns. Stored and served as written.
    pub character_interaction_interval: Value,
    /// Seconds between topics.
    pub time_between_topics: Value,
    pub topics: Value,
    /// Keys this server does not know about; written back untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            character1_name: String::new(),
            character1_id: String::new(),
            character1_token: String::new(),
            character1_voice_id: String::new(),
            character1_history_id: String::new(),
            character1_audio_device: String::new(),
            character2_name: String::new(),
            character2_id: String::new(),
            character2_token: String::new(),
            character2_voice_id: String::new(),
            character2_history_id: String::new(),
            character2_audio_device: String::new(),
            web_next_auth: String::new(),
            character_interaction_interval: json!(60),
            time_between_topics: json!(180),
            topics: json!([]),
            extra: serde_json::Map::new(),
        }
    }
}

/// Text fields accept whatever the web UI wrote: numbers and booleans keep
/// their text, `null` and structured values read as empty.
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(text) => text,
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Null | Value::Array(_) | Value::Object(_) => String::new(),
    })
}

/// Settings of a single persona, as seen by its session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersonaSettings {
    pub name: String,
    pub character_id: String,
    pub token: String,
    pub voice_id: String,
    pub history_id: String,
}

impl Config {
    pub fn persona(&self, slot: Slot) -> PersonaSettings {
        match slot {
            Slot::Character1 => PersonaSettings {
                name: self.character1_name.clone(),
                character_id: self.character1_id.clone(),
                token: self.character1_token.clone(),
                voice_id: self.character1_voice_id.clone(),
                history_id: self.character1_history_id.clone(),
            },
            Slot::Character2 => PersonaSettings {
                name: self.character2_name.clone(),
                character_id: self.character2_id.clone(),
                token: self.character2_token.clone(),
                voice_id: self.character2_voice_id.clone(),
                history_id: self.character2_history_id.clone(),
            },
        }
    }

    pub fn name(&self, slot: Slot) -> &str {
        match slot {
            Slot::Character1 => &self.character1_name,
            Slot::Character2 => &self.character2_name,
        }
    }

    pub fn set_history_id(&mut self, slot: Slot, history_id: String) {
        match slot {
            Slot::Character1 => self.character1_history_id = history_id,
            Slot::Character2 => self.character2_history_id = history_id,
        }
    }
}

/// In-memory configuration backed by a single JSON file.
///
/// I/O and parse failures are logged and swallowed: a failed load keeps the
/// previous record, a failed save loses the write.
pub struct ConfigStore {
    path: PathBuf,
    data: RwLock<Config>,
}

impl ConfigStore {
    /// Creates the store with defaults and loads whatever is on disk.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let store = Self {
            path: path.into(),
            data: RwLock::new(Config::default()),
        };
        store.load().await;
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => match serde_json::from_str::<Config>(&text) {
                Ok(config) => {
                    *self.data.write().await = config;
                    info!("Configuration loaded successfully.");
                }
                Err(e) => error!("Error loading config: {e}"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Config file not found. Creating a new one with default configuration.");
                self.save().await;
            }
            Err(e) => error!("Error loading config: {e}"),
        }
    }

    pub async fn save(&self) {
        let data = self.data.read().await;
        self.persist(&data).await;
    }

    pub async fn snapshot(&self) -> Config {
        self.data.read().await.clone()
    }

    /// Swaps the whole record and writes it out.
    pub async fn replace(&self, config: Config) {
        let mut data = self.data.write().await;
        *data = config;
        self.persist(&data).await;
    }

    pub async fn set_history_ids(&self, character1: String, character2: String) {
        let mut data = self.data.write().await;
        data.set_history_id(Slot::Character1, character1);
        data.set_history_id(Slot::Character2, character2);
        self.persist(&data).await;
    }

    async fn persist(&self, config: &Config) {
        let serialized = match serde_json::to_string_pretty(config) {
            Ok(serialized) => serialized,
            Err(e) => {
                error!("Error saving config: {e}");
                return;
            }
        };
        match tokio::fs::write(&self.path, serialized).await {
            Ok(()) => info!("Configuration saved successfully."),
            Err(e) => error!("Error saving config: {e}"),
        }
    }
}
