mod config;
mod error;
mod logging;
mod remote;
mod routes;
mod session;

use anyhow::Context;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;
use tracing::info;

use crate::config::ConfigStore;
use crate::remote::character_ai::{CharacterAi, Endpoints};
use crate::routes::AppState;
use crate::session::SpeechSettings;

/// `PERSONA_RELAY_*` environment variables.
#[derive(Deserialize, Debug)]
struct Environment {
    #[serde(default = "default_speech_delay_ms")]
    speech_delay_ms: u64,
    #[serde(default = "default_speech_attempts")]
    speech_attempts: u32,
    rest_base: Option<String>,
    chat_base: Option<String>,
    socket_url: Option<String>,
}

fn default_speech_delay_ms() -> u64 {
    SpeechSettings::default().delay.as_millis() as u64
}

fn default_speech_attempts() -> u32 {
    SpeechSettings::default().attempts
}

impl Environment {
    fn speech(&self) -> SpeechSettings {
        SpeechSettings {
            delay: Duration::from_millis(self.speech_delay_ms),
            attempts: self.speech_attempts,
        }
    }

    fn endpoints(&self) -> Endpoints {
        let defaults = Endpoints::default();
        Endpoints {
            rest_base: self.rest_base.clone().unwrap_or(defaults.rest_base),
            chat_base: self.chat_base.clone().unwrap_or(defaults.chat_base),
            socket_url: self.socket_url.clone().unwrap_or(defaults.socket_url),
        }
    }
}

#[derive(StructOpt, Debug)]
#[structopt(
    name = "persona-relay",
    about = "Relay a conversation between two remote chat personas"
)]
struct Args {
    /// Path to the JSON configuration file
    #[structopt(short = "c", long, default_value = "config.json")]
    config: PathBuf,

    /// Append-only event log
    #[structopt(short, long, default_value = "bot.log")]
    log_file: PathBuf,

    /// Directory with the static web UI
    #[structopt(long, default_value = "public")]
    public_dir: PathBuf,

    #[structopt(long, default_value = "127.0.0.1")]
    host: String,

    #[structopt(short, long, default_value = "5500")]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let environment = envy::prefixed("PERSONA_RELAY_").from_env::<Environment>()?;
    let args = Args::from_args();

    logging::init(&args.log_file)?;

    let config = Arc::new(ConfigStore::open(&args.config).await);
    info!("Using configuration file {}", config.path().display());

    let connector = Arc::new(CharacterAi::new(environment.endpoints()));
    let state = Arc::new(AppState::new(config, connector, environment.speech()).await);
    let app = routes::router(state, &args.public_dir);

    let listener = tokio::net::TcpListener::bind((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", args.host, args.port))?;
    info!("Server running at http://{}:{}", args.host, args.port);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
