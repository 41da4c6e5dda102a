use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cadenza::ChatId;
use cadenza::config::Config;
use cadenza::dispatcher::{Dispatcher, Reply};
use cadenza::resolver::youtube::YouTubeSearch;
use cadenza::resolver::{Resolver, SearchProvider};
use cadenza::session::{PlayerEvent, SessionRegistry};
use cadenza::supervisor::FfmpegTranscoder;
use cadenza::transport::NullTransport;

// ============================================================================
// CLI Types
// ============================================================================

/// Cadenza - voice-chat media playback controller
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the playback controller with a local stdin command console
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "cadenza.yaml")]
        config: String,
    },
}

// ============================================================================
// Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> std::process::ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => serve(&config).await,
    }
}

// ============================================================================
// Serve
// ============================================================================

/// Chat id for the local console, standing in for a real platform chat.
const CONSOLE_CHAT_ID: ChatId = 0;

async fn serve(config_path: &str) -> Result<()> {
    let config = Config::load(config_path).await?;

    let transport = Arc::new(NullTransport);
    let transcoder = Arc::new(FfmpegTranscoder::new(
        config.player.transcoder_settings(),
        transport.clone(),
    ));
    let provider = YouTubeSearch::from_key(
        config.search.youtube_api_key.clone(),
        config.search.endpoint.clone(),
        config.search.max_results,
    )
    .map(|provider| Arc::new(provider) as Arc<dyn SearchProvider>);
    if provider.is_none() {
        info!("no YouTube API key configured; search falls back to manual-open links");
    }
    let resolver = Resolver::new(provider);

    let (events_tx, mut events_rx) = mpsc::channel(64);
    let registry = SessionRegistry::new(
        transport,
        transcoder,
        config.session.settings(),
        events_tx,
    );
    let sweep_task = registry.spawn_sweep_task();
    let dispatcher = Dispatcher::new(registry.clone(), resolver);

    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            report_event(event);
        }
    });

    info!("console ready; commands: play <url|query>, skip, pause, resume, stop, queue, quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "quit" {
                    break;
                }
                let reply = dispatch_line(&dispatcher, line).await;
                report_reply(reply);
            }
        }
    }

    sweep_task.abort();
    registry.shutdown().await;
    Ok(())
}

async fn dispatch_line(dispatcher: &Dispatcher, line: &str) -> Reply {
    let (command, rest) = line
        .split_once(' ')
        .map(|(command, rest)| (command, rest.trim()))
        .unwrap_or((line, ""));
    match command {
        "play" => dispatcher.handle_play(CONSOLE_CHAT_ID, "console", rest).await,
        "skip" => dispatcher.handle_skip(CONSOLE_CHAT_ID).await,
        "pause" => dispatcher.handle_pause(CONSOLE_CHAT_ID).await,
        "resume" => dispatcher.handle_resume(CONSOLE_CHAT_ID).await,
        "stop" => dispatcher.handle_stop(CONSOLE_CHAT_ID).await,
        "queue" => dispatcher.handle_queue(CONSOLE_CHAT_ID).await,
        other => Reply::Rejected {
            reason: format!("unknown command '{other}'"),
        },
    }
}

fn report_reply(reply: Reply) {
    match reply {
        Reply::Accepted { title, position: None } => info!(%title, "playing now"),
        Reply::Accepted {
            title,
            position: Some(position),
        } => info!(%title, position, "queued"),
        Reply::ManualOpen { link, note } => info!(%link, "{note}"),
        Reply::Skipped => info!("skipped"),
        Reply::Paused => info!("paused"),
        Reply::Resumed => info!("resumed"),
        Reply::Stopped => info!("stopped"),
        Reply::Queue {
            now_playing,
            upcoming,
        } => {
            info!(now_playing = now_playing.as_deref().unwrap_or("-"), "queue");
            for (index, title) in upcoming.iter().enumerate() {
                info!("  {}. {title}", index + 1);
            }
        }
        Reply::Rejected { reason } => warn!("{reason}"),
    }
}

fn report_event(event: PlayerEvent) {
    match event {
        PlayerEvent::NowPlaying {
            chat_id,
            title,
            requested_by,
        } => info!(chat_id, %title, %requested_by, "now playing"),
        PlayerEvent::TrackFinished { chat_id, title } => {
            info!(chat_id, %title, "track finished");
        }
        PlayerEvent::TrackFailed {
            chat_id,
            title,
            reason,
        } => warn!(chat_id, %title, %reason, "track failed"),
        PlayerEvent::QueueDrained { chat_id } => info!(chat_id, "queue drained"),
        PlayerEvent::VoiceJoinFailed { chat_id, reason } => {
            warn!(chat_id, %reason, "voice join failed");
        }
        PlayerEvent::StopEscalated { chat_id, title } => {
            warn!(chat_id, %title, "stop escalated to force kill");
        }
    }
}

// ============================================================================
// Initialization
// ============================================================================

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
