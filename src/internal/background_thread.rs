use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{CallError, CallResult};
use crate::internal::data_types::*;
use crate::internal::events::SignalingEvent;
use crate::media::RetryTrigger;
use crate::Controller;

pub enum UserCommand {
    Dial {
        conversation_id: ConversationId,
        call_type: CallType,
        topology: Topology,
        response: oneshot::Sender<CallResult<CallId>>,
    },
    Accept {
        response: oneshot::Sender<CallResult<()>>,
    },
    Decline {
        response: oneshot::Sender<CallResult<()>>,
    },
    Hangup {
        response: oneshot::Sender<CallResult<()>>,
    },
    Session {
        response: oneshot::Sender<Option<CallSnapshot>>,
    },
    RetryPlayback {
        trigger: RetryTrigger,
        participant: Option<ParticipantId>,
        response: oneshot::Sender<usize>,
    },
}

/// talks to a Controller running on its own task. cheap to clone
#[derive(Clone)]
pub struct CallHandle {
    tx: mpsc::UnboundedSender<UserCommand>,
}

/// moves the controller onto a task that also drains `signals`. the task stops when every
/// CallHandle has been dropped, hanging up any active call first
pub fn spawn_controller(
    controller: Controller,
    signals: mpsc::UnboundedReceiver<SignalingEvent>,
) -> (CallHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(run(controller, rx, signals));
    (CallHandle { tx }, handle)
}

impl CallHandle {
    pub async fn dial(
        &self,
        conversation_id: &str,
        call_type: CallType,
        topology: Topology,
    ) -> CallResult<CallId> {
        let (response, rx) = oneshot::channel();
        self.send(UserCommand::Dial {
            conversation_id: conversation_id.to_string(),
            call_type,
            topology,
            response,
        })?;
        rx.await.map_err(|_| CallError::ControllerClosed)?
    }

    pub async fn accept(&self) -> CallResult<()> {
        let (response, rx) = oneshot::channel();
        self.send(UserCommand::Accept { response })?;
        rx.await.map_err(|_| CallError::ControllerClosed)?
    }

    pub async fn decline(&self) -> CallResult<()> {
        let (response, rx) = oneshot::channel();
        self.send(UserCommand::Decline { response })?;
        rx.await.map_err(|_| CallError::ControllerClosed)?
    }

    pub async fn hangup(&self) -> CallResult<()> {
        let (response, rx) = oneshot::channel();
        self.send(UserCommand::Hangup { response })?;
        rx.await.map_err(|_| CallError::ControllerClosed)?
    }

    pub async fn session(&self) -> CallResult<Option<CallSnapshot>> {
        let (response, rx) = oneshot::channel();
        self.send(UserCommand::Session { response })?;
        rx.await.map_err(|_| CallError::ControllerClosed)
    }

    pub async fn status(&self) -> CallResult<CallStatus> {
        Ok(self
            .session()
            .await?
            .map(|s| s.status)
            .unwrap_or(CallStatus::Idle))
    }

    pub async fn retry_playback(
        &self,
        trigger: RetryTrigger,
        participant: Option<ParticipantId>,
    ) -> CallResult<usize> {
        let (response, rx) = oneshot::channel();
        self.send(UserCommand::RetryPlayback {
            trigger,
            participant,
            response,
        })?;
        rx.await.map_err(|_| CallError::ControllerClosed)
    }

    fn send(&self, cmd: UserCommand) -> CallResult<()> {
        self.tx.send(cmd).map_err(|_| CallError::ControllerClosed)
    }
}

fn respond<T>(response: oneshot::Sender<T>, value: T) {
    if response.send(value).is_err() {
        log::debug!("caller dropped the response channel");
    }
}

fn handle_command(controller: &mut Controller, cmd: UserCommand) {
    match cmd {
        UserCommand::Dial {
            conversation_id,
            call_type,
            topology,
            response,
        } => respond(response, controller.dial(&conversation_id, call_type, topology)),
        UserCommand::Accept { response } => respond(response, controller.accept()),
        UserCommand::Decline { response } => respond(response, controller.decline()),
        UserCommand::Hangup { response } => respond(response, controller.hangup()),
        UserCommand::Session { response } => respond(response, controller.session()),
        UserCommand::RetryPlayback {
            trigger,
            participant,
            response,
        } => respond(
            response,
            controller.retry_playback(trigger, participant.as_deref()),
        ),
    }
}

pub async fn run(
    mut controller: Controller,
    mut rx: mpsc::UnboundedReceiver<UserCommand>,
    mut signals: mpsc::UnboundedReceiver<SignalingEvent>,
) {
    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(cmd) => handle_command(&mut controller, cmd),
                None => break,
            },
            Some(event) = signals.recv() => controller.handle_signal(event),
            _ = controller.next_internal() => {}
        }
    }

    if let Err(e) = controller.hangup() {
        log::error!("failed to hang up on shutdown: {}", e);
    }
    log::debug!("call controller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CallConfig, IncomingCall, IncomingCallFeed, InitArgs};

    #[tokio::test]
    async fn handle_drives_the_controller() {
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let mut args = InitArgs::new(CallConfig::new("alice"), event_tx);
        let feed = IncomingCallFeed::new();
        args.incoming = feed.clone();
        let history = args.history.clone();
        let controller = Controller::init(args).unwrap();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (handle, task) = spawn_controller(controller, signal_rx);

        assert!(feed.publish(IncomingCall {
            call_id: CallId::from("c1"),
            conversation_id: "conv".into(),
            initiator_id: "bob".into(),
            call_type: CallType::Audio,
            room_id: None,
        }));
        while handle.status().await.unwrap() != CallStatus::RingingIn {
            tokio::task::yield_now().await;
        }

        handle.accept().await.unwrap();
        signal_tx
            .send(SignalingEvent::MediaConnected {
                call_id: CallId::from("c1"),
            })
            .unwrap();
        while handle.status().await.unwrap() != CallStatus::InCall {
            tokio::task::yield_now().await;
        }
        handle.hangup().await.unwrap();
        assert_eq!(handle.status().await.unwrap(), CallStatus::Idle);
        assert!(handle.accept().await.is_err());

        drop(handle);
        task.await.unwrap();
        let records = history.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].caller_id, "bob");
    }
}
