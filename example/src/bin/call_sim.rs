use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use call_session::media::{MediaSource, MediaStream};
use call_session::{
    spawn_controller, CallConfig, CallHandle, CallId, Controller, EmittedEvents, IncomingCallFeed,
    InitArgs, Participant, SignalingEvent,
};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use example::*;

/// drives a call controller from a script read on stdin, one command per line
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// participant id of this client. overrides localId from --config
    #[arg(long)]
    local_id: Option<String>,
    /// JSON config file. --local-id and --history override it
    #[arg(long)]
    config: Option<PathBuf>,
    /// keep call history in this JSON file
    #[arg(long)]
    history: Option<PathBuf>,
    #[arg(long, default_value = "info")]
    log_level: log::LevelFilter,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.log_level);

    let config = match &cli.config {
        Some(path) => CallConfig::from_file(path)?,
        None => CallConfig::default(),
    };
    let config = apply_overrides(&cli, config);

    // used to receive events from the Controller
    let (event_tx, event_rx) = mpsc::unbounded_channel::<EmittedEvents>();
    // used to hand remote signals to the Controller
    let (signal_tx, signal_rx) = mpsc::unbounded_channel::<SignalingEvent>();

    let mut args = InitArgs::new(config, event_tx);
    let feed = IncomingCallFeed::new();
    args.incoming = feed.clone();
    let history = args.history.clone();
    let controller = Controller::init(args)?;
    let (handle, controller_task) = spawn_controller(controller, signal_rx);

    tokio::spawn(print_events(event_rx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let cmd = match parse_line(&line) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => continue,
            Err(e) => {
                log::error!("{}: {}", line.trim(), e);
                continue;
            }
        };
        if let Err(e) = execute(cmd, &handle, &feed, &signal_tx, &history).await {
            log::error!("{}: {}", line.trim(), e);
        }
    }

    drop(handle);
    controller_task.await?;
    println!("history:");
    for record in history.list().await? {
        println!("  {}", serde_json::to_string(&record)?);
    }
    Ok(())
}

fn apply_overrides(cli: &Cli, mut config: CallConfig) -> CallConfig {
    if let Some(local_id) = &cli.local_id {
        config.local_id = local_id.clone();
    }
    if cli.history.is_some() {
        config.history_path = cli.history.clone();
    }
    config
}

async fn active_call(handle: &CallHandle) -> Result<CallId> {
    match handle.session().await? {
        Some(session) => Ok(session.call_id),
        None => anyhow::bail!("no active call"),
    }
}

async fn execute(
    cmd: ScriptCommand,
    handle: &CallHandle,
    feed: &IncomingCallFeed,
    signal_tx: &mpsc::UnboundedSender<SignalingEvent>,
    history: &call_session::CallHistoryRecorder,
) -> Result<()> {
    let signal = match cmd {
        ScriptCommand::Incoming(call) => {
            if !feed.publish(call) {
                log::warn!("nobody is listening for incoming calls");
            }
            return Ok(());
        }
        ScriptCommand::Dial {
            conversation_id,
            call_type,
            topology,
        } => {
            let call_id = handle.dial(&conversation_id, call_type, topology).await?;
            println!("dialed {}", call_id);
            return Ok(());
        }
        ScriptCommand::Accept => return Ok(handle.accept().await?),
        ScriptCommand::Decline => return Ok(handle.decline().await?),
        ScriptCommand::Hangup => return Ok(handle.hangup().await?),
        ScriptCommand::Retry(trigger) => {
            let retried = handle.retry_playback(trigger, None).await?;
            println!("retried playback on {} targets", retried);
            return Ok(());
        }
        ScriptCommand::Wait(duration) => {
            tokio::time::sleep(duration).await;
            return Ok(());
        }
        ScriptCommand::Status => {
            match handle.session().await? {
                Some(session) => println!("{}", serde_json::to_string_pretty(&session)?),
                None => println!("idle"),
            }
            return Ok(());
        }
        ScriptCommand::History => {
            for record in history.list().await? {
                println!("{}", serde_json::to_string(&record)?);
            }
            return Ok(());
        }
        ScriptCommand::Fatal(reason) => SignalingEvent::Fatal {
            call_id: None,
            reason,
        },
        remote => {
            let call_id = active_call(handle).await?;
            match remote {
                ScriptCommand::RemoteAccept => SignalingEvent::RemoteAccepted { call_id },
                ScriptCommand::RemoteReject => SignalingEvent::RemoteRejected { call_id },
                ScriptCommand::RemoteHangup => SignalingEvent::RemoteHangup { call_id },
                ScriptCommand::Connected => SignalingEvent::MediaConnected { call_id },
                ScriptCommand::Lost => SignalingEvent::ConnectionLost { call_id },
                ScriptCommand::Join { id, name } => SignalingEvent::ParticipantJoined {
                    call_id,
                    participant: Participant::remote(&id, &name),
                },
                ScriptCommand::Leave(participant_id) => SignalingEvent::ParticipantLeft {
                    call_id,
                    participant_id,
                },
                ScriptCommand::Track(participant_id) => SignalingEvent::TrackAdded {
                    call_id,
                    source: MediaSource::Remote(Arc::new(MediaStream::new(
                        &format!("{}-stream", participant_id),
                        vec![],
                    ))),
                    participant_id,
                },
                ScriptCommand::Untrack(participant_id) => SignalingEvent::TrackRemoved {
                    call_id,
                    participant_id,
                },
                other => anyhow::bail!("unhandled command {:?}", other),
            }
        }
    };

    signal_tx
        .send(signal)
        .map_err(|_| anyhow::anyhow!("controller stopped"))?;
    Ok(())
}

async fn print_events(mut event_rx: mpsc::UnboundedReceiver<EmittedEvents>) {
    while let Some(evt) = event_rx.recv().await {
        match evt {
            EmittedEvents::Signal(signal) => match serde_json::to_string(&signal) {
                Ok(json) => println!("-> {}", json),
                Err(e) => log::error!("failed to serialize signal: {}", e),
            },
            other => println!("event: {:?}", other),
        }
    }
}
