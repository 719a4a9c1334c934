//! `live-interp`: run one interpretation session from the terminal.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

use live_interp::relay::{BroadcastRelay, LocalRelay, SupabaseRelay};
use live_interp::voice::device::{CpalCaptureProvider, CpalOutput};
use live_interp::voice::{
    GeminiLiveConnector, Role, SessionNotice, SessionOrchestrator, TargetLanguage, TranscriptChannel,
};
use live_interp::Config;

/// Real-time speech interpretation over Gemini Live
#[derive(Parser, Debug)]
#[command(name = "live-interp", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Target language code (e.g. es, ja), or "auto"
    #[arg(long, short = 't', global = true, value_name = "LANG")]
    target: Option<String>,

    /// Prebuilt voice name for synthesized speech
    #[arg(long, global = true, value_name = "VOICE")]
    voice: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Capture the microphone and publish the transcript
    Speak {
        /// Also play the translated audio locally
        #[arg(long)]
        hear_translation: bool,
    },
    /// Play translations of a Speaker's relayed transcript
    Listen,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "live_interp=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    if let Some(code) = cli.target.as_deref() {
        config.session.target_language = TargetLanguage::parse(code)?;
    }
    if let Some(voice) = cli.voice {
        config.session.voice_id = voice;
    }
    let role = match cli.command {
        Commands::Speak { hear_translation } => {
            config.session.policy.speaker_hears_translation |= hear_translation;
            Role::Speaker
        }
        Commands::Listen => Role::Listener,
    };

    let connector = GeminiLiveConnector::new(config.api_key()?)
        .with_endpoint(config.gemini.endpoint.clone())
        .with_model(config.gemini.model.clone())
        .with_setup_timeout(config.gemini.setup_timeout());

    let relay: Arc<dyn BroadcastRelay> = match config.relay.supabase.clone() {
        Some(supabase) => Arc::new(SupabaseRelay::new(supabase)?),
        None => {
            tracing::warn!("No Supabase relay configured, transcripts stay in this process");
            Arc::new(LocalRelay::new())
        }
    };

    let session = SessionOrchestrator::new(
        Arc::new(connector),
        Arc::new(CpalCaptureProvider),
        Arc::new(CpalOutput::new()?),
        relay,
    );

    let mut notices = session.subscribe();
    session.start(role, config.session.clone()).await?;
    eprintln!("{role} session active, press Ctrl+C to stop");

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break Ok(()),
            notice = notices.recv() => match notice {
                Ok(SessionNotice::Transcript(event)) => {
                    let tag = match event.channel {
                        TranscriptChannel::Input => "heard",
                        TranscriptChannel::Output => "said",
                    };
                    println!("[{:>7.2}s] {tag}: {}", event.at.as_secs_f64(), event.text);
                }
                Ok(SessionNotice::Ended { cause: Some(cause) }) => {
                    break Err(anyhow::anyhow!("Session ended: {cause}"));
                }
                Ok(SessionNotice::Ended { cause: None }) => break Ok(()),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Notice stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break Ok(()),
            },
        }
    };

    session.stop();
    eprintln!("Stopped.");
    outcome
}
