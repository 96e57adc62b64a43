//! Manual recording controls.
//!
//! The commands only validate input and post an event; whether a session
//! actually starts or stops is the orchestrator's call.

use crate::orchestrator::Event;
use crate::{Context, Error};
use poise::serenity_prelude as serenity;

/// The voice channel named in the command, or the caller's current one.
fn resolve_voice_channel(
    ctx: &Context<'_>,
    guild_id: serenity::GuildId,
    channel: Option<serenity::model::channel::Channel>,
) -> Result<Option<serenity::ChannelId>, &'static str> {
    if let Some(ch) = channel {
        return match ch {
            serenity::model::channel::Channel::Guild(ch)
                if ch.kind == serenity::model::channel::ChannelType::Voice =>
            {
                Ok(Some(ch.id))
            }
            _ => Err("The specified channel is not a voice channel!"),
        };
    }
    let user_id = ctx.author().id;
    let cache = &ctx.serenity_context().cache;
    Ok(cache
        .guild(guild_id)
        .and_then(|guild| guild.voice_states.get(&user_id).and_then(|vs| vs.channel_id)))
}

#[poise::command(prefix_command, slash_command, rename = "start-recording", guild_only)]
pub async fn start_recording(
    ctx: Context<'_>,
    #[description = "Voice channel to record (leave empty for your current channel)"]
    channel: Option<serenity::model::channel::Channel>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("This command must be used in a guild")?;

    let room = match resolve_voice_channel(&ctx, guild_id, channel) {
        Ok(Some(room)) => room,
        Ok(None) => {
            ctx.say(
                "You're not in a voice channel. Please join one or specify a channel: \
                 `/start-recording channel:#your-voice-channel`",
            )
            .await?;
            return Ok(());
        }
        Err(message) => {
            ctx.say(message).await?;
            return Ok(());
        }
    };

    ctx.data()
        .events
        .send(Event::ManualStart {
            guild: guild_id,
            room,
        })
        .map_err(|_| "The recording service is not running")?;

    ctx.say(format!("🎙️ **Recording requested** for <#{room}>"))
        .await?;
    Ok(())
}

#[poise::command(prefix_command, slash_command, rename = "stop-recording", guild_only)]
pub async fn stop_recording(
    ctx: Context<'_>,
    #[description = "Voice channel to stop (leave empty for your current channel)"]
    channel: Option<serenity::model::channel::Channel>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("This command must be used in a guild")?;

    let room = match resolve_voice_channel(&ctx, guild_id, channel) {
        Ok(Some(room)) => room,
        Ok(None) => {
            ctx.say(
                "You're not in a voice channel. Please join one or specify a channel: \
                 `/stop-recording channel:#your-voice-channel`",
            )
            .await?;
            return Ok(());
        }
        Err(message) => {
            ctx.say(message).await?;
            return Ok(());
        }
    };

    ctx.data()
        .events
        .send(Event::ManualStop {
            guild: guild_id,
            room,
        })
        .map_err(|_| "The recording service is not running")?;

    ctx.say(format!("🛑 **Stop requested** for <#{room}>")).await?;
    Ok(())
}
