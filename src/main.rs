//! # Office Voice - Command Line Entry Point
//!
//! Runs one realtime voice conversation with an office character from the terminal.
//!
//! ## Usage:
//! ```text
//! office-voice                 # talk to the configured default persona
//! office-voice "Michael Chen"  # talk to a specific persona
//! office-voice --role HR       # pick the persona the way the dialogue system does
//! office-voice --list          # list registered personas
//! office-voice --devices       # list audio input/output devices
//! ```
//!
//! The session runs until Ctrl+C / SIGTERM, or until it stops by itself (remote
//! hangup, lost device, repeated send failures).

use anyhow::{Context, Result};
use office_voice::audio::io::list_devices;
use office_voice::characters::CharacterProfileStore;
use office_voice::config::AppConfig;
use office_voice::context::AppContext;
use office_voice::session::{SessionOrchestrator, TranscriptCallback};
use office_voice::VoiceResult;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// What the command line asked for.
enum Command {
    Talk(Option<String>),
    Role(String),
    List,
    Devices,
}

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads `.env`** and sets up logging
/// 2. **Loads configuration** from `config.toml` and `APP_` environment variables
/// 3. **Builds the application context** (credential, character profiles)
/// 4. **Starts the voice session** on a blocking thread (a signal cancels the connect)
/// 5. **Waits** for a shutdown signal or for the session to end, then stops cleanly
#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    let command = parse_args(std::env::args().skip(1))?;

    match command {
        Command::List => {
            let characters = CharacterProfileStore::load(config.characters_file.as_deref().map(Path::new))?;
            for name in characters.names() {
                let profile = characters.get(&name)?;
                println!("{} (voice: {})", name, profile.voice);
            }
            return Ok(());
        }
        Command::Devices => {
            let (inputs, outputs) = list_devices()?;
            println!("Input devices:");
            for name in inputs {
                println!("  {}", name);
            }
            println!("Output devices:");
            for name in outputs {
                println!("  {}", name);
            }
            return Ok(());
        }
        Command::Talk(_) | Command::Role(_) => {}
    }

    info!("Starting office-voice v{}", env!("CARGO_PKG_VERSION"));

    let persona = match command {
        Command::Talk(Some(persona)) => persona,
        Command::Role(role) => CharacterProfileStore::persona_for_role(&role).to_string(),
        _ => config.default_persona.clone(),
    };

    let context = AppContext::from_config(config)?;
    info!(
        endpoint = %context.config.endpoint_url(),
        persona = %persona,
        "Configuration loaded"
    );

    let orchestrator = Arc::new(SessionOrchestrator::with_defaults(context));

    let on_transcript: TranscriptCallback = Arc::new(|text: &str| {
        info!(transcript = %text, "AI");
    });

    let starter = orchestrator.clone();
    let start_persona = persona.clone();
    let start = tokio::task::spawn_blocking(move || starter.start(&start_persona, Some(on_transcript)));

    let stopper = orchestrator.clone();
    let stop = move || {
        if let Err(e) = stopper.stop() {
            error!("Failed to stop voice session: {}", e);
        }
    };

    let session_id = match start_or_shutdown(start, wait_for_shutdown(), stop).await? {
        Some(session_id) => session_id,
        None => {
            info!(
                uptime_seconds = orchestrator.context().uptime().as_secs(),
                "Stopped before the session started"
            );
            return Ok(());
        }
    };

    info!(session_id = %session_id, persona = %persona, "Talking; press Ctrl+C to stop");

    tokio::select! {
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping voice session...");
        }
        _ = wait_for_session_end(&orchestrator) => {
            warn!("Voice session ended on its own");
        }
    }

    let stopper = orchestrator.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || stopper.stop()).await? {
        error!("Failed to stop voice session: {}", e);
    }

    if let Some(summary) = orchestrator.last_summary() {
        info!(
            reason = %summary.reason,
            duration_seconds = summary.duration_seconds(),
            frames_sent = summary.stats.frames_sent,
            barge_ins = summary.stats.barge_ins,
            "Session summary"
        );
    }

    info!(
        uptime_seconds = orchestrator.context().uptime().as_secs(),
        "Stopped gracefully"
    );
    Ok(())
}

/// Wait for the session start, unless `shutdown` resolves first.
///
/// On shutdown `stop` cancels the pending connect; should the start win that race
/// anyway, the fresh session is stopped again. Returns `None` when interrupted.
async fn start_or_shutdown<S>(
    mut start: JoinHandle<VoiceResult<Uuid>>,
    shutdown: impl Future<Output = ()>,
    stop: S,
) -> Result<Option<Uuid>>
where
    S: Fn() + Clone + Send + 'static,
{
    tokio::select! {
        result = &mut start => {
            let session_id = result.context("session start task failed")??;
            Ok(Some(session_id))
        }
        _ = shutdown => {
            info!("Shutdown signal received while connecting, cancelling...");
            tokio::task::spawn_blocking(stop.clone())
                .await
                .context("session stop task failed")?;

            match start.await.context("session start task failed")? {
                Ok(session_id) => {
                    warn!(session_id = %session_id, "Session became active during shutdown, stopping it");
                    tokio::task::spawn_blocking(stop)
                        .await
                        .context("session stop task failed")?;
                }
                Err(e) => info!("Session start abandoned: {}", e),
            }
            Ok(None)
        }
    }
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Command> {
    let command = match args.next().as_deref() {
        None => Command::Talk(None),
        Some("--list") => Command::List,
        Some("--devices") => Command::Devices,
        Some("--role") => {
            let role = args.next().context("--role needs a value, e.g. --role HR")?;
            Command::Role(role)
        }
        Some(flag) if flag.starts_with("--") => {
            anyhow::bail!("unknown option {}; usage: office-voice [PERSONA | --role ROLE | --list | --devices]", flag)
        }
        Some(persona) => Command::Talk(Some(persona.to_string())),
    };
    Ok(command)
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g. "debug", "office_voice=trace")
/// - If not set, defaults to "office_voice=debug"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "office_voice=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();

    Ok(())
}

/// Resolve on Ctrl+C, or SIGTERM on Unix.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Resolve once the session is no longer active (it stopped itself).
async fn wait_for_session_end(orchestrator: &SessionOrchestrator) {
    while orchestrator.is_active() {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use office_voice::cancel::CancellationToken;
    use office_voice::VoiceError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_shutdown_while_connecting_cancels_start() {
        let connecting = CancellationToken::new();
        let token = connecting.clone();
        // Stands in for a connect that keeps retrying
        let start = tokio::task::spawn_blocking(move || {
            if token.sleep(Duration::from_secs(30)) {
                Ok(Uuid::new_v4())
            } else {
                Err(VoiceError::Cancelled)
            }
        });

        let stops = Arc::new(AtomicUsize::new(0));
        let counter = stops.clone();
        let stop = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            connecting.cancel();
        };

        let started = Instant::now();
        let result = start_or_shutdown(start, async {}, stop).await.unwrap();

        assert!(result.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_session_started_during_shutdown_is_stopped() {
        let id = Uuid::new_v4();
        let start = tokio::task::spawn_blocking(move || {
            std::thread::sleep(Duration::from_millis(50));
            Ok(id)
        });

        let stops = Arc::new(AtomicUsize::new(0));
        let counter = stops.clone();
        let stop = move || {
            counter.fetch_add(1, Ordering::SeqCst);
        };

        let result = start_or_shutdown(start, async {}, stop).await.unwrap();

        assert!(result.is_none());
        assert_eq!(stops.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_start_completes_without_shutdown() {
        let id = Uuid::new_v4();
        let start = tokio::task::spawn_blocking(move || Ok(id));
        let stop = || {};

        let result = start_or_shutdown(start, std::future::pending(), stop).await.unwrap();
        assert_eq!(result, Some(id));
    }

    #[test]
    fn test_parse_args() {
        let args = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter();
        assert!(matches!(parse_args(args(&[])).unwrap(), Command::Talk(None)));
        assert!(matches!(parse_args(args(&["--role", "HR"])).unwrap(), Command::Role(role) if role == "HR"));
        assert!(parse_args(args(&["--role"])).is_err());
        assert!(parse_args(args(&["--bogus"])).is_err());
    }
}
