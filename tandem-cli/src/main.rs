//! Tandem CLI: run two call clients over the in-process loopback relay

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tandem_core::loopback::{LoopbackCapture, LoopbackPeerFactory, LoopbackRelay};
use tandem_core::prelude::*;
use tandem_core::EnvelopeKind;
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(flatten)]
    timing: TimingArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone, Default)]
struct TimingArgs {
    /// JSON file with call settings; flags below override it
    #[arg(long, env = "TANDEM_CONFIG")]
    config: Option<PathBuf>,

    /// Seconds an outgoing call may ring unanswered
    #[arg(long, env = "TANDEM_RING_TIMEOUT_SECS")]
    ring_timeout_secs: Option<u64>,

    /// Seconds to wait for the remote session description
    #[arg(long, env = "TANDEM_RESPONSE_TIMEOUT_SECS")]
    response_timeout_secs: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Place a call between two in-process clients
    Demo {
        /// Caller identity
        #[arg(long, default_value = "alice")]
        caller: String,

        /// Callee identity
        #[arg(long, default_value = "bob")]
        callee: String,

        /// Callee declines instead of accepting
        #[arg(long)]
        decline: bool,

        /// Callee never answers
        #[arg(long, conflicts_with = "decline")]
        no_answer: bool,

        /// Request audio only
        #[arg(long)]
        audio_only: bool,

        /// Seconds to stay connected before hanging up
        #[arg(long, default_value = "2")]
        hold_secs: u64,
    },

    /// Both clients call each other at the same moment
    Glare {
        /// First identity
        #[arg(long, default_value = "alice")]
        first: String,

        /// Second identity
        #[arg(long, default_value = "bob")]
        second: String,
    },

    /// Print the effective call settings as JSON
    Config,
}

impl TimingArgs {
    fn call_config(&self) -> Result<CallConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => CallConfig::default(),
        };
        if let Some(secs) = self.ring_timeout_secs {
            config.ring_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.response_timeout_secs {
            config.response_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tandem=info,tandem_core=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.timing.call_config()?;

    match cli.command {
        Commands::Demo {
            caller,
            callee,
            decline,
            no_answer,
            audio_only,
            hold_secs,
        } => {
            let answer = if decline {
                Answer::Decline
            } else if no_answer {
                Answer::Ignore
            } else {
                Answer::Accept
            };
            let constraints = if audio_only {
                MediaConstraints::audio_only()
            } else {
                config.constraints.clone()
            };
            handle_demo(
                config,
                &caller,
                &callee,
                answer,
                constraints,
                Duration::from_secs(hold_secs),
            )
            .await?;
        }
        Commands::Glare { first, second } => {
            handle_glare(config, &first, &second).await?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Answer {
    Accept,
    Decline,
    Ignore,
}

async fn start_client(
    relay: &Arc<LoopbackRelay>,
    identity: &str,
    config: CallConfig,
) -> Result<CallService> {
    let service = CallService::builder(identity)
        .with_signaling(relay.clone())
        .with_directory(relay.clone())
        .with_capture_device(Arc::new(LoopbackCapture::new()))
        .with_peer_factory(Arc::new(LoopbackPeerFactory::new()))
        .with_config(config)
        .build()
        .await
        .with_context(|| format!("starting client {identity}"))?;
    Ok(service)
}

/// Print every event of one client until its call settles
fn spawn_printer(service: &CallService) -> tokio::task::JoinHandle<()> {
    let name = service.local().to_string();
    let mut events = service.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&name, &event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(client = %name, missed = n, "Event printer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn print_event(name: &str, event: &CallEvent) {
    match event {
        CallEvent::IncomingCall { from, .. } => println!("📞 [{name}] incoming call from {from}"),
        CallEvent::IncomingCallWithdrawn { from, .. } => {
            println!("📵 [{name}] {from} hung up before an answer");
        }
        CallEvent::StateChanged {
            old_state,
            new_state,
            ..
        } => println!("   [{name}] {old_state:?} -> {new_state:?}"),
        CallEvent::RemoteTrackAdded { track, .. } => {
            println!("🎥 [{name}] receiving {} ({})", track.kind.as_str(), track.id);
        }
        CallEvent::CallFailed { reason, .. } => println!("❌ [{name}] call failed: {reason}"),
        CallEvent::CallEnded { reason, .. } => match reason {
            Some(reason) => println!("✅ [{name}] call ended: {reason}"),
            None => println!("✅ [{name}] call ended"),
        },
    }
}

async fn wait_until(
    service: &CallService,
    limit: Duration,
    pred: impl Fn(&CallSnapshot) -> bool,
) -> Result<CallSnapshot> {
    let mut rx = service.watch();
    tokio::time::timeout(limit, async {
        loop {
            {
                let snapshot = rx.borrow_and_update();
                if pred(&snapshot) {
                    return Ok::<_, anyhow::Error>(snapshot.clone());
                }
            }
            rx.changed()
                .await
                .context("call manager stopped while waiting")?;
        }
    })
    .await
    .with_context(|| format!("{} did not settle in {limit:?}", service.local()))?
}

fn settle_limit(config: &CallConfig) -> Duration {
    config.ring_timeout + config.response_timeout + Duration::from_secs(5)
}

async fn handle_demo(
    config: CallConfig,
    caller: &str,
    callee: &str,
    answer: Answer,
    constraints: MediaConstraints,
    hold: Duration,
) -> Result<()> {
    let limit = settle_limit(&config);
    let relay = Arc::new(LoopbackRelay::new());
    let a = start_client(&relay, caller, config.clone()).await?;
    let b = start_client(&relay, callee, config).await?;
    let printers = [spawn_printer(&a), spawn_printer(&b)];

    println!("📞 {caller} is calling {callee}...");
    let call_id = a
        .place_call_with(CallIdentity::new(callee), constraints)
        .await?;
    tracing::info!(call_id = %call_id, "Call placed");

    wait_until(&b, limit, |s| s.state == CallState::Requesting).await?;
    match answer {
        Answer::Accept => {
            b.accept_incoming().await?;
        }
        Answer::Decline => b.decline_incoming().await?,
        Answer::Ignore => println!("   {callee} lets it ring"),
    }

    let settled = wait_until(&a, limit, |s| {
        s.state == CallState::Connected || s.state.is_terminal()
    })
    .await?;

    if settled.state == CallState::Connected {
        println!(
            "✅ connected: {} local / {} remote tracks",
            settled.local_tracks.len(),
            settled.remote_tracks.len()
        );
        tokio::time::sleep(hold / 2).await;
        if a.toggle_track(MediaType::Audio, false).await? {
            println!("🔇 {caller} muted the microphone");
        }
        tokio::time::sleep(hold / 2).await;
        a.end_call().await?;
    }

    let a_final = wait_until(&a, limit, |s| s.state.is_terminal()).await?;
    let b_final = wait_until(&b, limit, |s| s.state.is_terminal()).await?;
    print_summary(&a_final);
    print_summary(&b_final);

    a.shutdown().await;
    b.shutdown().await;
    for printer in printers {
        printer.abort();
    }
    Ok(())
}

async fn handle_glare(config: CallConfig, first: &str, second: &str) -> Result<()> {
    let limit = settle_limit(&config);
    let relay = Arc::new(LoopbackRelay::new());
    let a = start_client(&relay, first, config.clone()).await?;
    let b = start_client(&relay, second, config).await?;

    relay.hold();
    let first_call = a.place_call(CallIdentity::new(second)).await?;
    let second_call = b.place_call(CallIdentity::new(first)).await?;
    wait_until(&a, limit, |s| s.state == CallState::Ringing).await?;
    wait_until(&b, limit, |s| s.state == CallState::Ringing).await?;
    println!("📞 {first} ({first_call}) and {second} ({second_call}) called each other");
    relay.release();

    let a_state = wait_until(&a, limit, |s| {
        s.state == CallState::Connected || s.state.is_terminal()
    })
    .await?;
    let b_state = wait_until(&b, limit, |s| {
        s.state == CallState::Connected || s.state.is_terminal()
    })
    .await?;

    let offers: Vec<String> = relay
        .sent_envelopes()
        .into_iter()
        .filter(|e| e.kind == EnvelopeKind::Offer)
        .map(|e| e.from.to_string())
        .collect();
    println!(
        "✅ settled on {:?}; offers sent by: {}",
        a_state.call_id,
        offers.join(", ")
    );
    print_summary(&a_state);
    print_summary(&b_state);

    a.end_call().await.ok();
    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

fn print_summary(snapshot: &CallSnapshot) {
    let remote = snapshot
        .remote
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_default();
    let reason = snapshot
        .last_error
        .map(|r| r.to_string())
        .unwrap_or_else(|| "-".to_string());
    let duration = snapshot
        .duration()
        .map(|d| format!("{}s", d.num_seconds()))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "📊 {} with {remote}: {:?} (reason: {reason}, connected for {duration})",
        snapshot.local, snapshot.state
    );
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_demo_flags() {
        let cli = Cli::try_parse_from([
            "tandem",
            "--ring-timeout-secs",
            "5",
            "demo",
            "--decline",
            "--audio-only",
        ])
        .unwrap();
        assert_eq!(cli.timing.ring_timeout_secs, Some(5));
        match cli.command {
            Commands::Demo {
                decline,
                audio_only,
                no_answer,
                ..
            } => {
                assert!(decline);
                assert!(audio_only);
                assert!(!no_answer);
            }
            _ => panic!("expected demo"),
        }
    }

    #[test]
    fn test_decline_conflicts_with_no_answer() {
        assert!(Cli::try_parse_from(["tandem", "demo", "--decline", "--no-answer"]).is_err());
    }

    #[test]
    fn test_timing_overrides() {
        let timing = TimingArgs {
            ring_timeout_secs: Some(3),
            response_timeout_secs: Some(4),
            ..TimingArgs::default()
        };
        let config = timing.call_config().unwrap();
        assert_eq!(config.ring_timeout, Duration::from_secs(3));
        assert_eq!(config.response_timeout, Duration::from_secs(4));
        assert_eq!(config.candidate_buffer, CallConfig::default().candidate_buffer);
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let timing = TimingArgs {
            config: Some(PathBuf::from("/nonexistent/tandem.json")),
            ..TimingArgs::default()
        };
        assert!(timing.call_config().is_err());
    }

    #[tokio::test]
    async fn test_demo_runs_to_completion() {
        handle_demo(
            CallConfig::default(),
            "alice",
            "bob",
            Answer::Accept,
            MediaConstraints::audio_only(),
            Duration::from_millis(20),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_glare_runs_to_completion() {
        handle_glare(CallConfig::default(), "alice", "bob").await.unwrap();
    }
}
