use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gemilive::{
    create_router, AppState, AudioBackendFactory, Config, LiveSession, NatsConnector,
    SessionDeps, SessionStatus, Speaker,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gemilive", version)]
#[command(about = "Real-time voice conversations with a live model")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (extension optional)
    #[arg(long, global = true, default_value = "config/gemilive")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP control API
    Serve,

    /// Talk from the terminal until Ctrl-C
    Talk {
        /// Replay a WAV file instead of opening the microphone
        #[arg(long, value_name = "PATH")]
        input_wav: Option<String>,

        /// Capture device name
        #[arg(long, value_name = "DEVICE")]
        device: Option<String>,

        /// Play replies on the default output device
        #[arg(long)]
        speakers: bool,

        /// Save the reply audio to a WAV file
        #[arg(long, value_name = "PATH")]
        record: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut cfg = Config::load(&cli.config)?;

    info!("{} v{}", cfg.service.name, env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Serve => serve(cfg).await,
        Commands::Talk {
            input_wav,
            device,
            speakers,
            record,
        } => {
            if input_wav.is_some() {
                cfg.audio.input_wav = input_wav;
            }
            if device.is_some() {
                cfg.audio.input_device = device;
            }
            if record.is_some() {
                cfg.audio.record_path = record;
            }
            cfg.audio.speakers |= speakers;
            talk(cfg).await
        }
    }
}

fn build_session(cfg: &Config) -> Result<LiveSession> {
    let session_config = cfg.session_config();
    info!("Live model: {} (voice {})", session_config.model, session_config.voice);
    info!("NATS bridge: {}", session_config.nats_url);

    let deps = SessionDeps {
        microphone: AudioBackendFactory::microphone(cfg.audio.source())?,
        connector: Arc::new(NatsConnector::new(session_config.nats_url.clone())),
        output: AudioBackendFactory::output(cfg.audio.speakers, cfg.audio.record_path())?,
    };

    Ok(LiveSession::spawn(session_config, deps))
}

async fn serve(cfg: Config) -> Result<()> {
    let session = build_session(&cfg)?;
    let app = create_router(AppState::new(session.clone()));

    let addr = cfg.http_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .context("HTTP server failed")?;

    session.stop().await;
    Ok(())
}

async fn talk(cfg: Config) -> Result<()> {
    let session = build_session(&cfg)?;
    let mut status = session.subscribe_status();
    let mut transcripts = session.subscribe_transcripts();
    let mut printed = 0;

    session.start().await?;
    println!("Connecting... (Ctrl-C to stop)");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,

            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                match current {
                    SessionStatus::Listening => println!("Listening. Say something."),
                    SessionStatus::Error => {
                        let snapshot = session.snapshot().await?;
                        warn!("Session ended with an error");
                        println!("{}", snapshot.error.unwrap_or_else(|| "Unknown error".to_string()));
                        break;
                    }
                    SessionStatus::Idle => {
                        println!("The session was closed.");
                        break;
                    }
                    SessionStatus::Connecting => {}
                }
            }

            changed = transcripts.changed() => {
                if changed.is_err() {
                    break;
                }
                let history = transcripts.borrow_and_update().clone();
                for transcript in history.iter().skip(printed) {
                    let who = match transcript.speaker {
                        Speaker::User => "you",
                        Speaker::Assistant => "assistant",
                    };
                    println!("[{}] {}: {}", transcript.timestamp.format("%H:%M:%S"), who, transcript.text);
                }
                printed = history.len();
            }
        }
    }

    session.stop().await;

    let snapshot = session.snapshot().await?;
    info!(
        "Sent {} frames ({} dropped), played {} reply chunks ({} dropped)",
        snapshot.frames_sent, snapshot.frames_dropped, snapshot.chunks_played, snapshot.chunks_dropped
    );

    Ok(())
}
