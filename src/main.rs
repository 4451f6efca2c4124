use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use livrya_narration::channel::{ConnectionState, EventChannel};
use livrya_narration::config::StudioConfig;
use livrya_narration::markers;
use livrya_narration::narration::{HttpNarrationApi, NarrationSession, NarrationSnapshot};
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "livrya-narration")]
#[command(about = "Narration markers and chapter narration client for Livrya")]
#[command(version)]
struct Args {
    /// Config file (defaults to <config dir>/livrya/narration.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Convert visual markers to TTS markup
    ToMarkup {
        /// Text to convert, or - to read stdin
        text: String,
    },
    /// Convert TTS markup back to visual markers
    ToVisual {
        /// Text to convert, or - to read stdin
        text: String,
    },
    /// Print the renderable segments of visual text as JSON
    Segments {
        /// Text to parse, or - to read stdin
        text: String,
    },
    /// Narrate a chapter and follow its progress (Ctrl-C cancels)
    Narrate {
        chapter_id: String,
        /// Follow an already running job without starting one
        #[arg(long)]
        watch_only: bool,
    },
    /// Regenerate audio for a single speech
    SpeechAudio { speech_id: String },
}

/// The event channel exhausted its reconnect attempts.
#[derive(Debug, thiserror::Error)]
#[error("can't reach the narration server at {url}")]
struct Unreachable {
    url: String,
}

/// Process exit status for a failed command: 2 for lost connectivity, 1 otherwise.
fn exit_status(error: &anyhow::Error) -> u8 {
    if error.downcast_ref::<Unreachable>().is_some() {
        2
    } else {
        1
    }
}

fn read_text(arg: String) -> Result<String> {
    if arg != "-" {
        return Ok(arg);
    }
    let mut text = String::new();
    std::io::stdin()
        .read_to_string(&mut text)
        .context("Failed to read stdin")?;
    Ok(text)
}

fn init_tracing(config: &StudioConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn print_snapshot(snapshot: &NarrationSnapshot) {
    let mut line = format!(
        "{:<10} {}/{} speeches ({}%)",
        snapshot.status.as_str(),
        snapshot.completed_speeches,
        snapshot.total_speeches,
        snapshot.overall_progress()
    );
    let failed = snapshot.failed_speeches().len();
    if failed > 0 {
        line.push_str(&format!(", {failed} failed"));
    }
    if let Some(error) = &snapshot.error {
        line.push_str(&format!(": {error}"));
    }
    println!("{line}");
}

fn main() -> ExitCode {
    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(exit_status(&e))
        }
    }
}

fn run(args: Args) -> Result<()> {
    let config = StudioConfig::load(args.config.as_deref())?;
    init_tracing(&config);

    match args.command {
        Commands::ToMarkup { text } => {
            print!("{}", markers::to_markup(&read_text(text)?));
            Ok(())
        }
        Commands::ToVisual { text } => {
            print!("{}", markers::to_visual(&read_text(text)?));
            Ok(())
        }
        Commands::Segments { text } => {
            let segments = markers::parse(&read_text(text)?);
            println!("{}", serde_json::to_string_pretty(&segments)?);
            Ok(())
        }
        Commands::Narrate {
            chapter_id,
            watch_only,
        } => runtime()?.block_on(narrate(config, chapter_id, watch_only)),
        Commands::SpeechAudio { speech_id } => runtime()?.block_on(speech_audio(config, speech_id)),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start tokio runtime")
}

fn session_for(config: &StudioConfig) -> Result<(NarrationSession, Arc<EventChannel>)> {
    let api = HttpNarrationApi::new(
        config.api_url.clone(),
        config.auth_token.clone(),
        config.request_timeout(),
    )?;
    let token = config.auth_token.clone();
    let channel = EventChannel::with_token_provider(
        config.socket_url(),
        config.channel.clone(),
        Arc::new(move || token.clone()),
    );
    let session = NarrationSession::new(Arc::new(api), Arc::clone(&channel));
    Ok((session, channel))
}

async fn narrate(config: StudioConfig, chapter_id: String, watch_only: bool) -> Result<()> {
    let (session, channel) = session_for(&config)?;
    let mut snapshots = session.subscribe();
    let mut connection = channel.connection_state();

    session.bind(&chapter_id);
    channel.connect();
    if !watch_only {
        session.start().await?;
    }

    let mut was_connected = false;
    let mut cancelling = false;
    let outcome = loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let snapshot = Arc::clone(&snapshots.borrow_and_update());
                print_snapshot(&snapshot);
                if snapshot.status.is_terminal() || (cancelling && snapshot.is_idle()) {
                    break Ok(());
                }
            }
            changed = connection.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let state = *connection.borrow_and_update();
                match state {
                    ConnectionState::Connected => {
                        if was_connected {
                            if let Err(e) = session.resync().await {
                                break Err(e.into());
                            }
                        }
                        was_connected = true;
                    }
                    ConnectionState::GaveUp => {
                        break Err(Unreachable {
                            url: channel.url().to_string(),
                        }
                        .into());
                    }
                    other => eprintln!("event channel {other}"),
                }
            }
            _ = tokio::signal::ctrl_c(), if !cancelling => {
                cancelling = true;
                if session.snapshot().is_narrating() {
                    eprintln!("Cancelling narration...");
                    if let Err(e) = session.cancel().await {
                        break Err(e.into());
                    }
                } else {
                    break Ok(());
                }
            }
        }
    };

    channel.disconnect().await;
    outcome
}

async fn speech_audio(config: StudioConfig, speech_id: String) -> Result<()> {
    let (session, _channel) = session_for(&config)?;
    let audio = session.generate_speech_audio(&speech_id).await?;
    match audio.audio_url {
        Some(url) => println!("{url}"),
        None => bail!("Backend accepted the request but returned no audio URL"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lost_connectivity_exits_with_two() {
        let unreachable = anyhow::Error::new(Unreachable {
            url: "ws://127.0.0.1:1".into(),
        });
        assert_eq!(exit_status(&unreachable), 2);
        assert_eq!(exit_status(&anyhow::anyhow!("Backend rejected")), 1);
    }

    #[tokio::test]
    async fn narrate_returns_when_the_channel_gives_up() {
        let mut config = StudioConfig {
            api_url: "http://127.0.0.1:1/api".into(),
            ws_url: Some("not a url".into()),
            ..StudioConfig::default()
        };
        config.channel.reconnect.max_attempts = 1;
        config.channel.reconnect.base_delay_ms = 10;

        let error = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            narrate(config, "ch-1".into(), true),
        )
        .await
        .expect("narrate should stop once the channel gives up")
        .unwrap_err();
        assert!(error.downcast_ref::<Unreachable>().is_some());
        assert_eq!(exit_status(&error), 2);
    }
}
