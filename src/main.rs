use anyhow::Context as _;
use poise::serenity_prelude as serenity;
use serenity::{
    Client,
    async_trait,
    model::{gateway::GatewayIntents, gateway::Ready, guild::Guild, voice::VoiceState},
    prelude::*,
};
use songbird::{SerenityInit, driver::DecodeMode};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{error, info};
use dotenvy::dotenv;

mod backend;
mod command;
mod config;
mod error;
mod orchestrator;
mod pipeline;
mod rooms;
mod session;
mod timer;
mod workers;

use backend::discord::{DiscordBackend, WorkerRegistry};
use config::Config;
use dashmap::DashMap;
use orchestrator::{Event, Orchestrator};
use pipeline::UploadPipeline;
use pipeline::remote::{HttpObjectStore, HttpSpeechService, SpeechService};
use workers::WorkerId;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;

pub struct Data {
    pub events: UnboundedSender<Event>,
}

async fn on_error(error: poise::FrameworkError<'_, Data, Error>) {
    match error {
        poise::FrameworkError::Setup { error, .. } => panic!("Failed to start bot: {:?}", error),
        poise::FrameworkError::Command { error, ctx, .. } => {
            error!("Error in command `{}`: {:?}", ctx.command().name, error);
        }
        error => {
            if let Err(e) = poise::builtins::on_error(error).await {
                error!("Error while handling error: {}", e);
            }
        }
    }
}

/// Gateway handler for the main bot: forwards occupancy changes and guild
/// availability to the orchestrator.
struct MainHandler {
    events: UnboundedSender<Event>,
}

#[async_trait]
impl EventHandler for MainHandler {
    async fn ready(&self, _ctx: serenity::Context, ready: Ready) {
        info!("Logged in as {}", ready.user.name);
        info!("Connected to {} guilds", ready.guilds.len());
    }

    async fn guild_create(&self, _ctx: serenity::Context, guild: Guild, _is_new: Option<bool>) {
        let _ = self.events.send(Event::GuildAvailable { guild: guild.id });
    }

    async fn voice_state_update(
        &self,
        _ctx: serenity::Context,
        old: Option<VoiceState>,
        new: VoiceState,
    ) {
        let Some(guild) = new.guild_id else {
            return;
        };
        let _ = self.events.send(Event::Occupancy {
            guild,
            member: new.user_id,
            from: old.as_ref().and_then(|state| state.channel_id),
            to: new.channel_id,
        });
    }
}

/// Gateway handler for one recorder client: on login it hands its voice
/// driver to the registry and reports the slot online.
struct WorkerHandler {
    worker: WorkerId,
    registry: WorkerRegistry,
    events: UnboundedSender<Event>,
}

#[async_trait]
impl EventHandler for WorkerHandler {
    async fn ready(&self, ctx: serenity::Context, ready: Ready) {
        match songbird::get(&ctx).await {
            Some(driver) => {
                self.registry.insert(self.worker, driver);
                let _ = self.events.send(Event::WorkerOnline {
                    worker: self.worker,
                    user: ready.user.id,
                });
                info!(worker = self.worker, "Recorder logged in as {}", ready.user.name);
            }
            None => error!(worker = self.worker, "Recorder started without a voice driver"),
        }
    }
}

async fn spawn_recorder_clients(
    config: &Config,
    registry: WorkerRegistry,
    events: UnboundedSender<Event>,
) -> anyhow::Result<()> {
    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;
    for (worker, token) in config.recorder_tokens.iter().enumerate() {
        let handler = WorkerHandler {
            worker,
            registry: Arc::clone(&registry),
            events: events.clone(),
        };
        let songbird_config = songbird::Config::default().decode_mode(DecodeMode::Decode);
        let mut client = Client::builder(token, intents)
            .event_handler(handler)
            .register_songbird_from_config(songbird_config)
            .await
            .with_context(|| format!("Failed to build recorder client {worker}"))?;
        tokio::spawn(async move {
            if let Err(e) = client.start().await {
                error!(worker, "Recorder client stopped: {:?}", e);
            }
        });
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = Config::from_env().context("Failed to load configuration")?;
    std::fs::create_dir_all(&config.recordings_dir).ok();

    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let options = poise::FrameworkOptions {
        commands: vec![command::start_recording(), command::stop_recording()],
        prefix_options: poise::PrefixFrameworkOptions {
            prefix: Some("!".into()),
            edit_tracker: Some(Arc::new(poise::EditTracker::for_timespan(
                Duration::from_secs(3600),
            ))),
            ..Default::default()
        },
        on_error: |error| Box::pin(on_error(error)),
        ..Default::default()
    };

    let framework = poise::Framework::builder()
        .setup({
            let events = events_tx.clone();
            let command_guild = config.command_guild;
            move |ctx, _ready, framework| {
                Box::pin(async move {
                    poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                    if let Some(guild_id) = command_guild {
                        let guild_id = serenity::model::id::GuildId::new(guild_id);
                        poise::builtins::register_in_guild(
                            ctx,
                            &framework.options().commands,
                            guild_id,
                        )
                        .await?;
                        info!("Registered commands for guild {}", guild_id);
                    }
                    Ok(Data { events })
                })
            }
        })
        .options(options)
        .build();

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILD_VOICE_STATES;

    let mut client = Client::builder(&config.discord_token, intents)
        .framework(framework)
        .event_handler(MainHandler {
            events: events_tx.clone(),
        })
        .await
        .context("Failed to build the main client")?;

    let registry: WorkerRegistry = Arc::new(DashMap::new());
    let backend = Arc::new(DiscordBackend::new(
        client.http.clone(),
        client.cache.clone(),
        Arc::clone(&registry),
    ));

    let store = Arc::new(HttpObjectStore::new(config.storage.clone()));
    let speech: Option<Arc<dyn SpeechService>> = config
        .speech
        .clone()
        .map(|speech| Arc::new(HttpSpeechService::new(speech)) as Arc<dyn SpeechService>);
    let pipeline = Arc::new(UploadPipeline::new(
        store,
        speech,
        config.storage.folder.clone(),
    ));

    let orchestrator = Orchestrator::new(&config, backend, pipeline, events_tx.clone());
    tokio::spawn(orchestrator.run(events_rx));

    spawn_recorder_clients(&config, Arc::clone(&registry), events_tx.clone()).await?;

    client.start().await.context("Main client stopped")?;
    Ok(())
}
