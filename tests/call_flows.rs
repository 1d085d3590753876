use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use call_session::media::{
    MediaProvider, MediaSource, MediaStream, NativeViewBackend, ViewRegistry,
};
use call_session::*;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

#[derive(Default)]
struct TestProvider {
    fail: bool,
    /// when set, acquire waits for a permit
    hold: Option<Arc<Notify>>,
    released: Arc<Notify>,
    releases: AtomicUsize,
}

#[async_trait]
impl MediaProvider for TestProvider {
    async fn acquire(&self, _call_type: CallType) -> Result<Arc<MediaStream>> {
        if let Some(hold) = &self.hold {
            hold.notified().await;
        }
        if self.fail {
            bail!("permission denied");
        }
        Ok(Arc::new(MediaStream::new("local", vec![])))
    }

    async fn release(&self, _stream: Arc<MediaStream>) {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.released.notify_one();
    }
}

struct Harness {
    controller: Controller,
    events: mpsc::UnboundedReceiver<EmittedEvents>,
    feed: IncomingCallFeed,
    history: CallHistoryRecorder,
    views: ViewRegistry,
}

fn harness_with(provider: Arc<TestProvider>) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let (tx, events) = mpsc::unbounded_channel();
    let backend = NativeViewBackend::new();
    let views = backend.views();
    let feed = IncomingCallFeed::new();
    let history = CallHistoryRecorder::in_memory();

    let mut config = CallConfig::new("alice");
    config.local_display_name = "Alice".into();
    let controller = Controller::init(InitArgs {
        config,
        emitted_event_chan: tx,
        incoming: feed.clone(),
        render_backend: Box::new(backend),
        media_provider: provider,
        caller_directory: Arc::new(NoDirectory),
        history: history.clone(),
    })
    .unwrap();

    Harness {
        controller,
        events,
        feed,
        history,
        views,
    }
}

fn harness() -> Harness {
    harness_with(Arc::new(TestProvider::default()))
}

fn incoming(call_id: &str, from: &str) -> IncomingCall {
    IncomingCall {
        call_id: CallId::from(call_id),
        conversation_id: "conv".into(),
        initiator_id: from.into(),
        call_type: CallType::Video,
        room_id: None,
    }
}

impl Harness {
    /// applies deferred results until `done` holds
    async fn run_until(&mut self, done: impl Fn(&Controller) -> bool) {
        let controller = &mut self.controller;
        tokio::time::timeout(Duration::from_secs(600), async {
            while !done(controller) {
                controller.next_internal().await;
            }
        })
        .await
        .expect("controller never reached the expected state");
    }

    fn drain(&mut self) -> Vec<EmittedEvents> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    async fn ring(&mut self, call_id: &str, from: &str) {
        assert!(self.feed.publish(incoming(call_id, from)));
        self.run_until(|c| c.status() == CallStatus::RingingIn).await;
    }

    async fn local_media_ready(&mut self) {
        self.run_until(|c| c.participants().iter().any(|p| p.is_local))
            .await;
    }

    async fn records(&self) -> Vec<CallHistoryRecord> {
        self.history.list().await.unwrap()
    }
}

fn states(events: &[EmittedEvents]) -> Vec<CallStatus> {
    events
        .iter()
        .filter_map(|e| match e {
            EmittedEvents::StateChanged { status, .. } => Some(*status),
            _ => None,
        })
        .collect()
}

fn signals(events: &[EmittedEvents]) -> Vec<OutgoingSignal> {
    events
        .iter()
        .filter_map(|e| match e {
            EmittedEvents::Signal(s) => Some(s.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn outgoing_call_answered_for_42_seconds() {
    let mut h = harness();
    let call_id = h
        .controller
        .dial("conv", CallType::Video, Topology::PeerToPeer)
        .unwrap();

    h.controller
        .handle_signal(SignalingEvent::RemoteAccepted {
            call_id: call_id.clone(),
        });
    assert_eq!(h.controller.status(), CallStatus::Connecting);
    h.local_media_ready().await;

    h.controller
        .handle_signal(SignalingEvent::MediaConnected {
            call_id: call_id.clone(),
        });
    assert_eq!(h.controller.status(), CallStatus::InCall);
    assert!(h.controller.session().unwrap().start_time.is_some());

    tokio::time::advance(Duration::from_secs(42)).await;
    h.controller.hangup().unwrap();
    assert_eq!(h.controller.status(), CallStatus::Idle);

    let events = h.drain();
    assert_eq!(
        states(&events),
        vec![
            CallStatus::RingingOut,
            CallStatus::Connecting,
            CallStatus::InCall,
            CallStatus::Ended
        ]
    );
    assert_eq!(
        signals(&events).last(),
        Some(&OutgoingSignal::Hangup {
            call_id: call_id.clone()
        })
    );

    let records = h.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].call_id, call_id);
    assert_eq!(records[0].status, HistoryStatus::Answered);
    assert_eq!(records[0].duration, 42);
    assert_eq!(records[0].caller_id, "alice");
    assert!(records[0].end_time >= records[0].start_time);
}

#[tokio::test(start_paused = true)]
async fn incoming_call_declined() {
    let mut h = harness();
    h.ring("c1", "bob").await;
    let session = h.controller.session().unwrap();
    assert_eq!(session.direction, CallDirection::Incoming);
    assert_eq!(session.caller.display_name, UNKNOWN_CALLER);

    h.controller.decline().unwrap();
    assert_eq!(h.controller.status(), CallStatus::Idle);

    let events = h.drain();
    assert!(matches!(
        &events[0],
        EmittedEvents::IncomingCall { call_id, .. } if call_id.as_str() == "c1"
    ));
    assert_eq!(
        signals(&events),
        vec![OutgoingSignal::Reject {
            call_id: CallId::from("c1")
        }]
    );

    let records = h.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, HistoryStatus::Declined);
    assert_eq!(records[0].duration, 0);
    assert_eq!(records[0].caller_id, "bob");
    assert_eq!(records[0].caller_name, UNKNOWN_CALLER);
}

#[tokio::test(start_paused = true)]
async fn unanswered_call_is_missed_after_30_seconds() {
    let mut h = harness();
    let started = Instant::now();
    h.ring("c1", "bob").await;

    h.run_until(|c| c.status() == CallStatus::Idle).await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(30));
    assert!(elapsed < Duration::from_secs(31));

    let events = h.drain();
    assert_eq!(
        signals(&events),
        vec![OutgoingSignal::Reject {
            call_id: CallId::from("c1")
        }]
    );
    let records = h.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, HistoryStatus::Missed);
}

#[tokio::test(start_paused = true)]
async fn second_incoming_call_is_dropped_without_resetting_the_timer() {
    let mut h = harness();
    let started = Instant::now();
    h.ring("c1", "bob").await;

    tokio::time::advance(Duration::from_secs(20)).await;
    // same initiator again, then someone else
    assert_eq!(
        h.controller.handle_incoming(incoming("c1", "bob")),
        Admission::Duplicate
    );
    assert_eq!(
        h.controller.handle_incoming(incoming("c2", "bob")),
        Admission::Busy
    );
    assert_eq!(
        h.controller.handle_incoming(incoming("c3", "carol")),
        Admission::Busy
    );

    h.run_until(|c| c.status() == CallStatus::Idle).await;
    assert!(started.elapsed() < Duration::from_secs(31));

    let prompts = h
        .drain()
        .into_iter()
        .filter(|e| matches!(e, EmittedEvents::IncomingCall { .. }))
        .count();
    assert_eq!(prompts, 1);
    assert_eq!(h.records().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn echo_of_own_call_is_ignored() {
    let mut h = harness();
    assert_eq!(
        h.controller.handle_incoming(incoming("c1", "alice")),
        Admission::Echo
    );
    assert_eq!(h.controller.status(), CallStatus::Idle);
    assert!(h.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn hangup_is_idempotent() {
    let mut h = harness();
    h.ring("c1", "bob").await;
    h.controller.accept().unwrap();
    h.local_media_ready().await;
    h.controller.handle_signal(SignalingEvent::MediaConnected {
        call_id: CallId::from("c1"),
    });

    tokio::time::advance(Duration::from_secs(5)).await;
    h.controller.hangup().unwrap();
    h.controller.hangup().unwrap();
    // the remote side's hangup crosses ours
    h.controller.handle_signal(SignalingEvent::RemoteHangup {
        call_id: CallId::from("c1"),
    });
    h.controller.hangup().unwrap();

    let ended = states(&h.drain())
        .into_iter()
        .filter(|s| *s == CallStatus::Ended)
        .count();
    assert_eq!(ended, 1);

    let records = h.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, HistoryStatus::Answered);
    assert_eq!(records[0].duration, 5);
    assert_eq!(records[0].caller_id, "bob");
}

#[tokio::test(start_paused = true)]
async fn media_failure_ends_the_call_unrecorded() {
    let provider = Arc::new(TestProvider {
        fail: true,
        ..Default::default()
    });
    let mut h = harness_with(provider);
    h.ring("c1", "bob").await;
    h.controller.accept().unwrap();
    h.run_until(|c| c.status() == CallStatus::Idle).await;

    let events = h.drain();
    let failure = events.iter().find_map(|e| match e {
        EmittedEvents::CallFailed { reason, .. } => Some(reason.clone()),
        _ => None,
    });
    assert!(failure.unwrap().contains("permission denied"));
    assert_eq!(
        signals(&events).last(),
        Some(&OutgoingSignal::Hangup {
            call_id: CallId::from("c1")
        })
    );
    assert!(h.records().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn late_local_media_is_released() {
    let hold = Arc::new(Notify::new());
    let provider = Arc::new(TestProvider {
        hold: Some(hold.clone()),
        ..Default::default()
    });
    let mut h = harness_with(provider.clone());
    h.ring("c1", "bob").await;
    h.controller.accept().unwrap();

    // hangup while the camera is still being opened
    h.controller.hangup().unwrap();
    assert_eq!(h.controller.status(), CallStatus::Idle);
    hold.notify_one();

    let controller = &mut h.controller;
    let released = provider.released.clone();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            tokio::select! {
                _ = released.notified() => break,
                _ = controller.next_internal() => {}
            }
        }
    })
    .await
    .expect("stale stream was never released");

    assert_eq!(provider.releases.load(Ordering::SeqCst), 1);
    assert_eq!(h.controller.status(), CallStatus::Idle);
    assert!(h.controller.participants().is_empty());
    assert!(h.views.is_empty());
}

#[tokio::test(start_paused = true)]
async fn group_call_orders_participants_and_binds_media() {
    let mut h = harness();
    let call_id = h
        .controller
        .dial("team", CallType::Video, Topology::Sfu)
        .unwrap();
    h.controller.handle_signal(SignalingEvent::RemoteAccepted {
        call_id: call_id.clone(),
    });
    for (id, name) in [("bob", "Bob"), ("carol", "Carol")] {
        h.controller.handle_signal(SignalingEvent::ParticipantJoined {
            call_id: call_id.clone(),
            participant: Participant::remote(id, name),
        });
    }
    let bob_stream = Arc::new(MediaStream::new("bob-cam", vec![]));
    h.controller.handle_signal(SignalingEvent::TrackAdded {
        call_id: call_id.clone(),
        participant_id: "bob".into(),
        source: MediaSource::Remote(bob_stream.clone()),
    });
    // nothing is rendered before media connects
    assert!(h.views.is_empty());

    h.local_media_ready().await;
    let ids: Vec<String> = h
        .controller
        .participants()
        .into_iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(ids, vec!["alice", "bob", "carol"]);
    assert_eq!(h.controller.layout(), LayoutBucket::Triple);

    h.controller.handle_signal(SignalingEvent::MediaConnected {
        call_id: call_id.clone(),
    });
    let bob_view = h.views.get("video-bob").unwrap();
    assert!(Arc::ptr_eq(&bob_view.stream, &bob_stream));
    assert!(!bob_view.options.mirror);
    assert!(h.views.get("video-alice").unwrap().options.mirror);

    h.controller.handle_signal(SignalingEvent::ParticipantLeft {
        call_id: call_id.clone(),
        participant_id: "bob".into(),
    });
    assert!(h.views.get("video-bob").is_none());
    assert_eq!(h.controller.layout(), LayoutBucket::Pair);

    let layouts: Vec<LayoutBucket> = h
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            EmittedEvents::LayoutChanged { layout, .. } => Some(layout),
            _ => None,
        })
        .collect();
    assert_eq!(
        layouts,
        vec![LayoutBucket::Pair, LayoutBucket::Triple, LayoutBucket::Pair]
    );

    h.controller.hangup().unwrap();
    assert!(h.views.is_empty());
    assert!(h.controller.participants().is_empty());
}

#[tokio::test(start_paused = true)]
async fn signals_for_other_states_or_calls_are_ignored() {
    let mut h = harness();
    h.controller.handle_signal(SignalingEvent::RemoteAccepted {
        call_id: CallId::from("nobody"),
    });
    assert_eq!(h.controller.status(), CallStatus::Idle);

    let call_id = h
        .controller
        .dial("conv", CallType::Audio, Topology::PeerToPeer)
        .unwrap();
    h.controller.handle_signal(SignalingEvent::MediaConnected {
        call_id: call_id.clone(),
    });
    h.controller.handle_signal(SignalingEvent::RemoteAccepted {
        call_id: CallId::from("someone-else"),
    });
    assert_eq!(h.controller.status(), CallStatus::RingingOut);

    h.controller.handle_signal(SignalingEvent::RemoteRejected {
        call_id: call_id.clone(),
    });
    assert_eq!(h.controller.status(), CallStatus::Idle);
    // a late accept for the finished call
    h.controller.handle_signal(SignalingEvent::RemoteAccepted { call_id });
    assert_eq!(h.controller.status(), CallStatus::Idle);

    let records = h.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, HistoryStatus::Declined);
}

#[tokio::test(start_paused = true)]
async fn fatal_signaling_error_is_surfaced() {
    let mut h = harness();
    h.ring("c1", "bob").await;
    h.controller.handle_signal(SignalingEvent::Fatal {
        call_id: None,
        reason: "socket closed".into(),
    });
    assert_eq!(h.controller.status(), CallStatus::Idle);

    let events = h.drain();
    assert!(events.iter().any(|e| matches!(
        e,
        EmittedEvents::CallFailed { reason, .. } if reason.contains("socket closed")
    )));
    let records = h.records().await;
    assert_eq!(records[0].status, HistoryStatus::Missed);
}

#[tokio::test(start_paused = true)]
async fn redelivered_incoming_for_ended_call_is_dropped() {
    let mut h = harness();
    h.ring("c1", "bob").await;
    h.controller.decline().unwrap();
    h.drain();

    // the signaling layer replays the offer after a reconnect
    assert_eq!(
        h.controller.handle_incoming(incoming("c1", "bob")),
        Admission::Duplicate
    );
    assert_eq!(h.controller.status(), CallStatus::Idle);
    assert!(h.drain().is_empty());

    // a different call still rings
    assert_eq!(
        h.controller.handle_incoming(incoming("c2", "carol")),
        Admission::Admitted
    );
    assert_eq!(h.controller.status(), CallStatus::RingingIn);
    h.controller.decline().unwrap();

    let records = h.records().await;
    let c1 = records
        .iter()
        .filter(|r| r.call_id == CallId::from("c1"))
        .count();
    assert_eq!(c1, 1);
    assert_eq!(records.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn cancelling_an_outgoing_call_records_declined() {
    let mut h = harness();
    let call_id = h
        .controller
        .dial("conv", CallType::Audio, Topology::PeerToPeer)
        .unwrap();
    assert_eq!(h.controller.status(), CallStatus::RingingOut);

    tokio::time::advance(Duration::from_secs(3)).await;
    h.controller.hangup().unwrap();
    assert_eq!(h.controller.status(), CallStatus::Idle);

    let events = h.drain();
    assert_eq!(
        signals(&events).last(),
        Some(&OutgoingSignal::Hangup {
            call_id: call_id.clone()
        })
    );
    let ended = states(&events)
        .into_iter()
        .filter(|s| *s == CallStatus::Ended)
        .count();
    assert_eq!(ended, 1);

    let records = h.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, HistoryStatus::Declined);
    assert_eq!(records[0].duration, 0);
}

#[tokio::test(start_paused = true)]
async fn connection_lost_mid_call_records_answered() {
    let mut h = harness();
    h.ring("c1", "bob").await;
    h.controller.accept().unwrap();
    h.local_media_ready().await;
    h.controller.handle_signal(SignalingEvent::MediaConnected {
        call_id: CallId::from("c1"),
    });
    assert_eq!(h.controller.status(), CallStatus::InCall);
    h.drain();

    tokio::time::advance(Duration::from_secs(17)).await;
    h.controller.handle_signal(SignalingEvent::ConnectionLost {
        call_id: CallId::from("c1"),
    });
    assert_eq!(h.controller.status(), CallStatus::Idle);

    let events = h.drain();
    // the transport is gone, nothing is sent
    assert!(signals(&events).is_empty());
    assert_eq!(states(&events), vec![CallStatus::Ended]);

    let records = h.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, HistoryStatus::Answered);
    assert_eq!(records[0].duration, 17);
}

#[tokio::test(start_paused = true)]
async fn caller_hanging_up_while_ringing_is_missed() {
    let mut h = harness();
    h.ring("c1", "bob").await;
    h.drain();

    h.controller.handle_signal(SignalingEvent::RemoteHangup {
        call_id: CallId::from("c1"),
    });
    assert_eq!(h.controller.status(), CallStatus::Idle);

    let events = h.drain();
    assert!(!signals(&events)
        .iter()
        .any(|s| matches!(s, OutgoingSignal::Reject { .. })));
    assert_eq!(states(&events), vec![CallStatus::Ended]);

    let records = h.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, HistoryStatus::Missed);
}
