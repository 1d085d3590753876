use std::io::Write;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use call_session::media::RetryTrigger;
use call_session::{CallId, CallType, IncomingCall, Topology};

/// installs the logger used by every binary in this crate
pub fn init_logger(level: log::LevelFilter) {
    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{}:{} [{}] {} - {}",
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.level(),
                chrono::Local::now().format("%H:%M:%S.%3f"),
                record.args()
            )
        })
        .filter(None, level)
        .init();
}

/// one line of a call_sim script. remote events apply to the active call
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptCommand {
    /// `incoming <call id> <from> [audio|video] [room]`
    Incoming(IncomingCall),
    /// `dial <conversation> [audio|video] [p2p|sfu]`
    Dial {
        conversation_id: String,
        call_type: CallType,
        topology: Topology,
    },
    Accept,
    Decline,
    Hangup,
    RemoteAccept,
    RemoteReject,
    RemoteHangup,
    Connected,
    Lost,
    /// `join <participant> [display name...]`
    Join { id: String, name: String },
    Leave(String),
    Track(String),
    Untrack(String),
    Fatal(String),
    Retry(RetryTrigger),
    /// `wait <seconds>`
    Wait(Duration),
    Status,
    History,
}

fn call_type(arg: Option<&str>) -> Result<CallType> {
    match arg {
        Some(s) => s.parse(),
        None => Ok(CallType::Audio),
    }
}

fn required<'a>(arg: Option<&'a str>, what: &str) -> Result<&'a str> {
    arg.with_context(|| format!("missing {}", what))
}

/// blank lines and `#` comments yield None
pub fn parse_line(line: &str) -> Result<Option<ScriptCommand>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let mut words = line.split_whitespace();
    let verb = required(words.next(), "command")?;

    let cmd = match verb {
        "incoming" => {
            let call_id = required(words.next(), "call id")?;
            let from = required(words.next(), "initiator")?;
            ScriptCommand::Incoming(IncomingCall {
                call_id: CallId::from(call_id),
                conversation_id: format!("conv-{}", from),
                initiator_id: from.to_string(),
                call_type: call_type(words.next())?,
                room_id: words.next().map(str::to_string),
            })
        }
        "dial" => {
            let conversation_id = required(words.next(), "conversation")?.to_string();
            let call_type = call_type(words.next())?;
            let topology = match words.next() {
                None | Some("p2p") => Topology::PeerToPeer,
                Some("sfu") => Topology::Sfu,
                Some(other) => bail!("invalid topology: {}", other),
            };
            ScriptCommand::Dial {
                conversation_id,
                call_type,
                topology,
            }
        }
        "accept" => ScriptCommand::Accept,
        "decline" => ScriptCommand::Decline,
        "hangup" => ScriptCommand::Hangup,
        "remote-accept" => ScriptCommand::RemoteAccept,
        "remote-reject" => ScriptCommand::RemoteReject,
        "remote-hangup" => ScriptCommand::RemoteHangup,
        "connected" => ScriptCommand::Connected,
        "lost" => ScriptCommand::Lost,
        "join" => {
            let id = required(words.next(), "participant")?.to_string();
            let rest: Vec<&str> = words.collect();
            let name = if rest.is_empty() {
                id.clone()
            } else {
                rest.join(" ")
            };
            return Ok(Some(ScriptCommand::Join { id, name }));
        }
        "leave" => ScriptCommand::Leave(required(words.next(), "participant")?.to_string()),
        "track" => ScriptCommand::Track(required(words.next(), "participant")?.to_string()),
        "untrack" => ScriptCommand::Untrack(required(words.next(), "participant")?.to_string()),
        "fatal" => {
            let reason: Vec<&str> = words.collect();
            return Ok(Some(ScriptCommand::Fatal(reason.join(" "))));
        }
        "retry" => {
            let trigger = required(words.next(), "trigger")?;
            let trigger: RetryTrigger = serde_json::from_value(trigger.into())
                .with_context(|| format!("invalid trigger: {}", trigger))?;
            ScriptCommand::Retry(trigger)
        }
        "wait" => {
            let secs: f64 = required(words.next(), "seconds")?
                .parse()
                .context("invalid number of seconds")?;
            ScriptCommand::Wait(Duration::from_secs_f64(secs.max(0.0)))
        }
        "status" => ScriptCommand::Status,
        "history" => ScriptCommand::History,
        other => bail!("unknown command: {}", other),
    };

    if let Some(extra) = words.next() {
        bail!("unexpected argument: {}", extra);
    }
    Ok(Some(cmd))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_incoming_with_defaults() {
        let cmd = parse_line("incoming c1 bob").unwrap().unwrap();
        match cmd {
            ScriptCommand::Incoming(call) => {
                assert_eq!(call.call_id, CallId::from("c1"));
                assert_eq!(call.call_type, CallType::Audio);
                assert_eq!(call.room_id, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parses_dial_and_join() {
        assert_eq!(
            parse_line("dial team video sfu").unwrap(),
            Some(ScriptCommand::Dial {
                conversation_id: "team".into(),
                call_type: CallType::Video,
                topology: Topology::Sfu,
            })
        );
        assert_eq!(
            parse_line("join carol Carol Smith").unwrap(),
            Some(ScriptCommand::Join {
                id: "carol".into(),
                name: "Carol Smith".into()
            })
        );
    }

    #[test]
    fn parses_retry_and_wait() {
        assert_eq!(
            parse_line("retry pointer-interaction").unwrap(),
            Some(ScriptCommand::Retry(RetryTrigger::PointerInteraction))
        );
        assert_eq!(
            parse_line("wait 1.5").unwrap(),
            Some(ScriptCommand::Wait(Duration::from_millis(1500)))
        );
    }

    #[test]
    fn skips_comments_and_rejects_garbage() {
        assert_eq!(parse_line("  # comment").unwrap(), None);
        assert_eq!(parse_line("").unwrap(), None);
        assert!(parse_line("teleport").is_err());
        assert!(parse_line("accept now").is_err());
        assert!(parse_line("dial team video mesh").is_err());
        assert!(parse_line("retry shake").is_err());
    }
}
