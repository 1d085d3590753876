use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;

mod config;
mod error;
mod internal;
mod launch;
pub mod media;

use crate::internal::events::InternalEvent;
use crate::internal::gate::IncomingCallGate;
use crate::internal::registry::ParticipantRegistry;
use crate::media::{
    BindOptions, BindOutcome, MediaProvider, MediaSource, MediaStream, MediaTrackBinder,
    RenderBackend, RetryTrigger, RtpCaptureProvider,
};

// public exports
pub use config::{CallConfig, DEFAULT_RING_TIMEOUT_SECS};
pub use error::{CallError, CallResult};
pub use internal::background_thread::{spawn_controller, CallHandle};
pub use internal::data_types::*;
pub use internal::events::{EmittedEvents, IncomingCall, OutgoingSignal, SignalingEvent};
pub use internal::gate::{Admission, CallerDirectory, NoDirectory};
pub use internal::history::{
    CallHistoryRecord, CallHistoryRecorder, HistoryStatus, HistoryStore, JsonFileStore,
    MemoryStore, DEFAULT_HISTORY_CAPACITY,
};
pub use internal::registry::LayoutBucket;
pub use internal::signaling::{IncomingCallFeed, Subscription};
pub use launch::CallWindowParams;

/// call-session
/// Client side orchestration of a single call: turns signaling events from an external
/// transport into one consistent call lifecycle, binds local and remote media to render
/// targets and records how each call ended.
///
/// The `Controller` never talks to the network. Outgoing signals are emitted on
/// `EmittedEvents` and must be forwarded by the host; inbound signals are fed back in through
/// `handle_signal` (and `call:incoming` through the `IncomingCallFeed`).
///
/// Deferred work (ring timeout, caller lookup, media acquisition, playback retries) reports
/// back through an internal channel. The host must keep calling `next_internal`, or use
/// `spawn_controller` which does that on a background task.
pub struct Controller {
    config: CallConfig,
    /// the active call. None while idle
    session: Option<CallSession>,
    /// recently ended calls, newest last. redelivered signals for them are dropped
    finished: VecDeque<CallId>,
    gate: IncomingCallGate,
    registry: ParticipantRegistry,
    binder: MediaTrackBinder,
    /// remote media that arrived before the call was connected
    pending_tracks: Vec<(ParticipantId, MediaSource)>,
    local_stream: Option<Arc<MediaStream>>,
    media_provider: Arc<dyn MediaProvider>,
    history: CallHistoryRecorder,
    /// used to emit events
    emitted_event_chan: mpsc::UnboundedSender<EmittedEvents>,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    internal_rx: mpsc::UnboundedReceiver<InternalEvent>,
}

/// how many ended call ids are remembered for dropping redelivered signals
const FINISHED_CALLS_KEPT: usize = 64;

// a lazy version of the builder pattern
pub struct InitArgs {
    pub config: CallConfig,
    pub emitted_event_chan: mpsc::UnboundedSender<EmittedEvents>,
    pub incoming: IncomingCallFeed,
    pub render_backend: Box<dyn RenderBackend>,
    pub media_provider: Arc<dyn MediaProvider>,
    pub caller_directory: Arc<dyn CallerDirectory>,
    pub history: CallHistoryRecorder,
}

impl InitArgs {
    /// headless rendering, RTP capture tracks, no caller directory, and the history store
    /// named by the config. must be called from within a tokio runtime
    pub fn new(config: CallConfig, emitted_event_chan: mpsc::UnboundedSender<EmittedEvents>) -> Self {
        let store: Arc<dyn HistoryStore> = match &config.history_path {
            Some(path) => Arc::new(JsonFileStore::new(path)),
            None => Arc::new(MemoryStore::default()),
        };
        let history = CallHistoryRecorder::spawn(store, config.history_capacity);
        Self {
            config,
            emitted_event_chan,
            incoming: IncomingCallFeed::new(),
            render_backend: Box::new(media::HeadlessBackend),
            media_provider: Arc::new(RtpCaptureProvider::default()),
            caller_directory: Arc::new(NoDirectory),
            history,
        }
    }
}

/// The following functions are driven by the UI:
/// dial
/// accept
/// decline
/// hangup
/// retry_playback
///
/// The following functions are driven by signaling
/// handle_signal
/// handle_incoming (usually via the IncomingCallFeed)
impl Controller {
    pub fn init(args: InitArgs) -> CallResult<Self> {
        args.config.validate()?;
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let mut gate = IncomingCallGate::new(
            args.config.local_id.clone(),
            args.config.ring_timeout(),
            args.caller_directory,
            internal_tx.clone(),
        );
        gate.attach_feed(&args.incoming)?;

        let binder = MediaTrackBinder::new(
            args.render_backend,
            args.config.playback_retry.clone(),
            internal_tx.clone(),
        );

        Ok(Self {
            config: args.config,
            session: None,
            finished: VecDeque::with_capacity(FINISHED_CALLS_KEPT),
            gate,
            registry: ParticipantRegistry::new(),
            binder,
            pending_tracks: Vec::new(),
            local_stream: None,
            media_provider: args.media_provider,
            history: args.history,
            emitted_event_chan: args.emitted_event_chan,
            internal_tx,
            internal_rx,
        })
    }

    pub fn status(&self) -> CallStatus {
        self.session
            .as_ref()
            .map(|s| s.status)
            .unwrap_or(CallStatus::Idle)
    }

    pub fn session(&self) -> Option<CallSnapshot> {
        self.session
            .as_ref()
            .map(|s| s.snapshot(self.registry.ids()))
    }

    /// local participant first, then remotes in join order
    pub fn participants(&self) -> Vec<Participant> {
        self.registry.iter().cloned().collect()
    }

    pub fn layout(&self) -> LayoutBucket {
        self.registry.layout()
    }

    pub fn binder(&self) -> &MediaTrackBinder {
        &self.binder
    }

    pub fn history(&self) -> &CallHistoryRecorder {
        &self.history
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    /// starts an outgoing call. continues with RemoteAccepted or RemoteRejected
    pub fn dial(
        &mut self,
        conversation_id: &str,
        call_type: CallType,
        topology: Topology,
    ) -> CallResult<CallId> {
        if let Some(session) = &self.session {
            return Err(CallError::invalid_state("dial", session.status));
        }

        let call_id = CallId::new();
        let caller = CallerInfo {
            id: self.config.local_id.clone(),
            display_name: self.config.local_display_name.clone(),
            avatar_url: None,
        };
        self.session = Some(CallSession {
            call_id: call_id.clone(),
            conversation_id: conversation_id.to_string(),
            call_type,
            topology,
            direction: CallDirection::Outgoing,
            status: CallStatus::RingingOut,
            caller,
            room_id: None,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
            connected_at: None,
        });

        log::info!("dialing {} ({}, {})", conversation_id, call_type, topology);
        self.emit(EmittedEvents::Signal(OutgoingSignal::Dial {
            call_id: call_id.clone(),
            conversation_id: conversation_id.to_string(),
            call_type,
            topology,
        }));
        self.emit(EmittedEvents::StateChanged {
            call_id: call_id.clone(),
            status: CallStatus::RingingOut,
        });
        Ok(call_id)
    }

    /// answers the ringing call and starts acquiring local media
    pub fn accept(&mut self) -> CallResult<()> {
        let call_id = self.require("accept", CallStatus::RingingIn)?;

        if let Some(pending) = self.gate.resolve(&call_id) {
            if let Some(session) = self.session.as_mut() {
                session.caller = pending.caller.clone();
            }
        }
        self.emit(EmittedEvents::Signal(OutgoingSignal::Accept {
            call_id: call_id.clone(),
        }));
        self.set_status(CallStatus::Connecting);

        if let Some(session) = &self.session {
            let caller = Participant::from(&session.caller);
            if self.registry.add(caller) {
                self.participants_changed();
            }
        }
        self.acquire_local_media();
        Ok(())
    }

    pub fn decline(&mut self) -> CallResult<()> {
        let call_id = self.require("decline", CallStatus::RingingIn)?;
        self.emit(EmittedEvents::Signal(OutgoingSignal::Reject { call_id }));
        self.finish(Some(HistoryStatus::Declined));
        Ok(())
    }

    /// ends whatever call is active. a no-op when there is none, so repeated calls are safe
    pub fn hangup(&mut self) -> CallResult<()> {
        let (call_id, status) = match &self.session {
            Some(session) => (session.call_id.clone(), session.status),
            None => {
                log::debug!("hangup with no active call");
                return Ok(());
            }
        };

        let (signal, outcome) = match status {
            CallStatus::RingingIn => (
                OutgoingSignal::Reject { call_id },
                HistoryStatus::Declined,
            ),
            CallStatus::RingingOut => (
                OutgoingSignal::Hangup { call_id },
                HistoryStatus::Declined,
            ),
            _ => (
                OutgoingSignal::Hangup { call_id },
                HistoryStatus::Answered,
            ),
        };
        self.emit(EmittedEvents::Signal(signal));
        self.finish(Some(outcome));
        Ok(())
    }

    /// forwards a playback retry trigger (user gesture, visibility change, unmute) to the
    /// binder. returns how many blocked targets were retried
    pub fn retry_playback(&mut self, trigger: RetryTrigger, participant: Option<&str>) -> usize {
        self.binder.retry_playback(trigger, participant)
    }

    /// offers a raw `call:incoming` signal to the gate
    pub fn handle_incoming(&mut self, signal: IncomingCall) -> Admission {
        if self.is_finished(&signal.call_id) {
            log::info!("dropping redelivered incoming call {}: already ended", signal.call_id);
            return Admission::Duplicate;
        }
        let idle = self.session.is_none();
        let admission = self.gate.offer(signal, idle);
        if admission != Admission::Admitted {
            return admission;
        }

        let (signal, caller) = match self.gate.pending() {
            Some(pending) => (pending.signal.clone(), pending.caller.clone()),
            None => return admission,
        };
        log::info!(
            "incoming {} call {} from {}",
            signal.call_type,
            signal.call_id,
            signal.initiator_id
        );
        self.session = Some(CallSession {
            call_id: signal.call_id.clone(),
            conversation_id: signal.conversation_id.clone(),
            call_type: signal.call_type,
            topology: if signal.room_id.is_some() {
                Topology::Sfu
            } else {
                Topology::PeerToPeer
            },
            direction: CallDirection::Incoming,
            status: CallStatus::RingingIn,
            caller: caller.clone(),
            room_id: signal.room_id.clone(),
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
            connected_at: None,
        });
        self.emit(EmittedEvents::IncomingCall {
            call_id: signal.call_id.clone(),
            call_type: signal.call_type,
            caller,
        });
        self.emit(EmittedEvents::StateChanged {
            call_id: signal.call_id,
            status: CallStatus::RingingIn,
        });
        admission
    }

    /// applies a signal from the remote side. signals for another call, or that don't fit
    /// the current state, are logged and dropped
    pub fn handle_signal(&mut self, event: SignalingEvent) {
        let (call_id, status) = match (&self.session, event.call_id()) {
            (Some(session), Some(id)) if &session.call_id == id => {
                (session.call_id.clone(), session.status)
            }
            (Some(session), None) => (session.call_id.clone(), session.status),
            _ => {
                log::info!(
                    "ignoring {} for {:?}: not the active call",
                    event.name(),
                    event.call_id()
                );
                return;
            }
        };

        match event {
            SignalingEvent::RemoteAccepted { .. } => {
                if status != CallStatus::RingingOut {
                    return self.ignore("remote-accepted", status);
                }
                self.set_status(CallStatus::Connecting);
                self.acquire_local_media();
            }
            SignalingEvent::RemoteRejected { .. } => {
                if status != CallStatus::RingingOut {
                    return self.ignore("remote-rejected", status);
                }
                log::info!("call {} was rejected", call_id);
                self.finish(Some(HistoryStatus::Declined));
            }
            SignalingEvent::RemoteHangup { .. } => {
                log::info!("remote hung up call {}", call_id);
                self.finish(Some(abort_outcome(status)));
            }
            SignalingEvent::MediaConnected { .. } => {
                if status != CallStatus::Connecting {
                    return self.ignore("media-connected", status);
                }
                self.media_connected();
            }
            SignalingEvent::ConnectionLost { .. } => {
                log::warn!("lost connection for call {} while {}", call_id, status);
                self.finish(Some(abort_outcome(status)));
            }
            SignalingEvent::ParticipantJoined { participant, .. } => {
                if participant.id == self.config.local_id {
                    log::debug!("ignoring join of the local participant");
                    return;
                }
                let participant = Participant {
                    is_local: false,
                    ..participant
                };
                if self.registry.add(participant) {
                    self.participants_changed();
                }
            }
            SignalingEvent::ParticipantLeft { participant_id, .. } => {
                self.pending_tracks.retain(|(p, _)| p != &participant_id);
                self.binder.unbind_participant(&participant_id);
                if self.registry.remove(&participant_id).is_some() {
                    self.participants_changed();
                }
            }
            SignalingEvent::TrackAdded {
                participant_id,
                source,
                ..
            } => {
                if participant_id == self.config.local_id {
                    log::debug!("ignoring remote track for the local participant");
                    return;
                }
                if !self.registry.contains(&participant_id) {
                    self.registry
                        .add(Participant::remote(&participant_id, UNKNOWN_CALLER));
                    self.participants_changed();
                }
                if status == CallStatus::InCall {
                    self.bind_remote(&participant_id, source);
                } else {
                    // bound once media connects
                    self.pending_tracks.retain(|(p, _)| p != &participant_id);
                    self.pending_tracks.push((participant_id, source));
                }
            }
            SignalingEvent::TrackRemoved { participant_id, .. } => {
                self.pending_tracks.retain(|(p, _)| p != &participant_id);
                let target = self.config.target_for(&participant_id);
                self.binder.unbind(&target);
            }
            SignalingEvent::Fatal { reason, .. } => {
                let err = CallError::Signaling(reason);
                log::error!("call {}: {}", call_id, err);
                self.emit(EmittedEvents::CallFailed {
                    call_id,
                    reason: err.to_string(),
                });
                self.finish(Some(abort_outcome(status)));
            }
        }
    }

    /// waits for the next incoming call or deferred result and applies it. cancel safe:
    /// nothing is applied until a message has been received
    pub async fn next_internal(&mut self) {
        tokio::select! {
            signal = self.gate.next_signal() => match signal {
                Some(signal) => {
                    self.handle_incoming(signal);
                }
                None => {
                    log::warn!("incoming call feed closed");
                    self.gate.detach_feed();
                }
            },
            event = self.internal_rx.recv() => {
                if let Some(event) = event {
                    self.apply_internal(event);
                }
            }
        }
    }

    fn apply_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::RingExpired { call_id } => self.ring_expired(call_id),
            InternalEvent::CallerResolved { call_id, caller } => {
                self.caller_resolved(call_id, caller)
            }
            InternalEvent::LocalMedia { call_id, result } => self.local_media(call_id, result),
            InternalEvent::PlaybackRetryDue { target, generation } => {
                self.binder.on_retry_due(&target, generation)
            }
        }
    }

    fn ring_expired(&mut self, call_id: CallId) {
        if self.gate.expire(&call_id).is_none() {
            return;
        }
        if self.current_status(&call_id) != Some(CallStatus::RingingIn) {
            return;
        }
        let err = CallError::SignalingTimeout {
            seconds: self.config.ring_timeout_secs,
        };
        log::info!("call {}: {}", call_id, err);
        self.emit(EmittedEvents::Signal(OutgoingSignal::Reject { call_id }));
        self.finish(Some(HistoryStatus::Missed));
    }

    fn caller_resolved(&mut self, call_id: CallId, caller: CallerInfo) {
        self.gate.set_caller(&call_id, caller.clone());
        match self.session.as_mut() {
            Some(session) if session.call_id == call_id => session.caller = caller.clone(),
            _ => {
                log::debug!("caller resolved for stale call {}", call_id);
                return;
            }
        }
        if self.registry.contains(&caller.id) {
            self.registry.add(Participant::from(&caller));
        }
        self.emit(EmittedEvents::CallerResolved { call_id, caller });
    }

    fn local_media(&mut self, call_id: CallId, result: Result<Arc<MediaStream>, String>) {
        let relevant = matches!(
            self.current_status(&call_id),
            Some(CallStatus::Connecting) | Some(CallStatus::InCall)
        );
        let stream = match result {
            Ok(stream) if relevant => stream,
            Ok(stream) => {
                log::info!("discarding local media for stale call {}", call_id);
                self.release_in_background(stream);
                return;
            }
            Err(reason) if relevant => {
                let err = CallError::MediaAcquisitionFailed(reason);
                log::error!("call {}: {}", call_id, err);
                self.emit(EmittedEvents::CallFailed {
                    call_id: call_id.clone(),
                    reason: err.to_string(),
                });
                self.emit(EmittedEvents::Signal(OutgoingSignal::Hangup { call_id }));
                // never connected, so nothing to record
                self.finish(None);
                return;
            }
            Err(reason) => {
                log::debug!("ignoring media failure for stale call {}: {}", call_id, reason);
                return;
            }
        };

        self.local_stream = Some(stream);
        let local = Participant::local(&self.config.local_id, &self.config.local_display_name);
        if self.registry.add(local) {
            self.participants_changed();
        }
        if self.status() == CallStatus::InCall {
            self.bind_local_preview();
        }
    }

    fn media_connected(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.start_time = Some(Utc::now());
            session.connected_at = Some(Instant::now());
        }
        self.set_status(CallStatus::InCall);

        self.bind_local_preview();
        let staged = std::mem::take(&mut self.pending_tracks);
        for (participant, source) in staged {
            self.bind_remote(&participant, source);
        }
    }

    fn bind_local_preview(&mut self) {
        let stream = match &self.local_stream {
            Some(stream) => stream.clone(),
            None => return,
        };
        let target = self.config.target_for(&self.config.local_id);
        self.binder.bind(
            &self.config.local_id,
            MediaSource::Local(stream),
            &target,
            BindOptions::local_preview(),
        );
    }

    fn bind_remote(&mut self, participant: &ParticipantId, source: MediaSource) {
        let target = self.config.target_for(participant);
        if self.binder.bind(participant, source, &target, BindOptions::default())
            == BindOutcome::Failed
        {
            log::warn!("no media shown for {}", participant);
        }
    }

    fn acquire_local_media(&self) {
        let (call_id, call_type) = match &self.session {
            Some(session) => (session.call_id.clone(), session.call_type),
            None => return,
        };
        let provider = self.media_provider.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = provider
                .acquire(call_type)
                .await
                .map_err(|e| e.to_string());
            if tx.send(InternalEvent::LocalMedia { call_id, result }).is_err() {
                log::warn!("local media acquired after the controller went away");
            }
        });
    }

    fn release_in_background(&self, stream: Arc<MediaStream>) {
        let provider = self.media_provider.clone();
        tokio::spawn(async move {
            provider.release(stream).await;
        });
    }

    /// the single path into `ended`. teardown is synchronous, history and media release
    /// finish in the background
    fn finish(&mut self, outcome: Option<HistoryStatus>) {
        match &self.session {
            Some(session) if self.is_finished(&session.call_id) => {
                log::warn!("call {} already finished", session.call_id);
                return;
            }
            Some(_) => {}
            None => return,
        }
        let mut session = match self.session.take() {
            Some(session) => session,
            None => return,
        };
        if self.finished.len() == FINISHED_CALLS_KEPT {
            self.finished.pop_front();
        }
        self.finished.push_back(session.call_id.clone());

        let duration = session.duration_secs();
        let end_time = Utc::now();
        session.status = CallStatus::Ended;
        session.end_time = Some(end_time);
        log::info!(
            "call {} ended after {}s ({})",
            session.call_id,
            duration,
            outcome.map(|o| o.to_string()).unwrap_or_else(|| "unrecorded".into())
        );
        self.emit(EmittedEvents::StateChanged {
            call_id: session.call_id.clone(),
            status: CallStatus::Ended,
        });

        self.gate.resolve(&session.call_id);
        let released = self.binder.release_all();
        log::debug!("released {} bindings", released);
        self.pending_tracks.clear();
        if !self.registry.is_empty() {
            log::debug!("removing {} participants", self.registry.len());
            self.registry.clear();
        }
        if let Some(stream) = self.local_stream.take() {
            self.release_in_background(stream);
        }

        if let Some(status) = outcome {
            self.history.save_detached(CallHistoryRecord {
                call_id: session.call_id,
                conversation_id: session.conversation_id,
                caller_id: session.caller.id,
                caller_name: session.caller.display_name,
                call_type: session.call_type,
                duration,
                start_time: session.start_time.unwrap_or(session.created_at),
                end_time,
                status,
            });
        }
    }

    fn require(&self, operation: &'static str, expected: CallStatus) -> CallResult<CallId> {
        match &self.session {
            Some(session) if session.status == expected => Ok(session.call_id.clone()),
            _ => Err(CallError::invalid_state(operation, self.status())),
        }
    }

    fn is_finished(&self, call_id: &CallId) -> bool {
        self.finished.contains(call_id)
    }

    fn current_status(&self, call_id: &CallId) -> Option<CallStatus> {
        self.session
            .as_ref()
            .filter(|s| &s.call_id == call_id)
            .map(|s| s.status)
    }

    fn set_status(&mut self, status: CallStatus) {
        let call_id = match self.session.as_mut() {
            Some(session) => {
                log::info!("call {}: {} -> {}", session.call_id, session.status, status);
                session.status = status;
                session.call_id.clone()
            }
            None => return,
        };
        self.emit(EmittedEvents::StateChanged { call_id, status });
    }

    fn participants_changed(&mut self) {
        let call_id = match &self.session {
            Some(session) => session.call_id.clone(),
            None => return,
        };
        self.emit(EmittedEvents::ParticipantsChanged {
            call_id: call_id.clone(),
            participants: self.registry.ids(),
        });
        if let Some(layout) = self.registry.layout_update() {
            self.emit(EmittedEvents::LayoutChanged { call_id, layout });
        }
    }

    fn ignore(&self, signal: &'static str, status: CallStatus) {
        log::info!("ignoring signal: {}", CallError::invalid_state(signal, status));
    }

    fn emit(&self, event: EmittedEvents) {
        if let Err(e) = self.emitted_event_chan.send(event) {
            log::error!("failed to emit event: {}", e);
        }
    }
}

/// history outcome when the call ends without a local hangup
fn abort_outcome(status: CallStatus) -> HistoryStatus {
    match status {
        CallStatus::RingingIn => HistoryStatus::Missed,
        CallStatus::RingingOut => HistoryStatus::Declined,
        _ => HistoryStatus::Answered,
    }
}
