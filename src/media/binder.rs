use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;

use super::{BindOptions, MediaSource, PlaybackError, RenderBackend, RetryPolicy, RetryState, RetryTrigger};
use crate::error::CallError;
use crate::internal::data_types::{ParticipantId, TargetId};
use crate::internal::events::InternalEvent;

struct Binding {
    participant: ParticipantId,
    source: MediaSource,
    options: BindOptions,
    /// distinguishes this binding from earlier ones on the same target
    generation: u64,
    /// present while playback is blocked and retries are armed
    retry: Option<RetryState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// same source already bound, nothing was touched
    Unchanged,
    Attached,
    /// a different source was detached first
    Rebound,
    /// attach was refused. logged, never fatal
    Failed,
}

/// owns every source <-> render target relationship. a target holds at most one
/// binding, and the old one is always detached before a new one is attached
pub struct MediaTrackBinder {
    backend: Box<dyn RenderBackend>,
    policy: RetryPolicy,
    bindings: HashMap<TargetId, Binding>,
    events: mpsc::UnboundedSender<InternalEvent>,
    next_generation: u64,
}

fn schedule_retry(
    events: &mpsc::UnboundedSender<InternalEvent>,
    target: &TargetId,
    generation: u64,
    delay: Duration,
) {
    let tx = events.clone();
    let target = target.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        // the binder checks the generation, a stale wakeup is harmless
        let _ = tx.send(InternalEvent::PlaybackRetryDue { target, generation });
    });
}

impl MediaTrackBinder {
    pub(crate) fn new(
        backend: Box<dyn RenderBackend>,
        policy: RetryPolicy,
        events: mpsc::UnboundedSender<InternalEvent>,
    ) -> Self {
        Self {
            backend,
            policy,
            bindings: HashMap::new(),
            events,
            next_generation: 0,
        }
    }

    pub fn bind(
        &mut self,
        participant: &ParticipantId,
        source: MediaSource,
        target: &TargetId,
        options: BindOptions,
    ) -> BindOutcome {
        if let Some(existing) = self.bindings.get_mut(target) {
            if existing.source.same_source(&source) {
                // reassigning the same source restarts playback and flickers
                if existing.options != options {
                    self.backend.apply_options(target, &options);
                    existing.options = options;
                }
                existing.participant = participant.clone();
                return BindOutcome::Unchanged;
            }
        }

        let rebound = match self.bindings.remove(target) {
            Some(old) => {
                log::debug!(
                    "rebinding {}: {} -> {}",
                    target,
                    old.source.describe(),
                    source.describe()
                );
                self.detach_source(target, &old.source);
                true
            }
            None => false,
        };

        if let Err(e) = self.attach_source(target, &source, &options) {
            let err = CallError::TrackAttachFailed {
                target: target.clone(),
                reason: e.to_string(),
            };
            log::warn!("{}", err);
            return BindOutcome::Failed;
        }

        self.next_generation += 1;
        let mut binding = Binding {
            participant: participant.clone(),
            source,
            options,
            generation: self.next_generation,
            retry: None,
        };
        self.start_playback(target, &mut binding);
        self.bindings.insert(target.clone(), binding);

        if rebound {
            BindOutcome::Rebound
        } else {
            BindOutcome::Attached
        }
    }

    /// safe on a target that holds nothing. returns whether anything was detached
    pub fn unbind(&mut self, target: &TargetId) -> bool {
        match self.bindings.remove(target) {
            Some(binding) => {
                self.detach_source(target, &binding.source);
                true
            }
            None => false,
        }
    }

    pub fn unbind_participant(&mut self, participant: &str) -> usize {
        let targets: Vec<TargetId> = self
            .bindings
            .iter()
            .filter(|(_, b)| b.participant == participant)
            .map(|(t, _)| t.clone())
            .collect();
        targets.iter().filter(|t| self.unbind(t)).count()
    }

    /// detaches everything, synchronously
    pub fn release_all(&mut self) -> usize {
        let bindings: Vec<(TargetId, Binding)> = self.bindings.drain().collect();
        for (target, binding) in &bindings {
            self.detach_source(target, &binding.source);
        }
        bindings.len()
    }

    pub fn is_bound(&self, target: &str) -> bool {
        self.bindings.contains_key(target)
    }

    pub fn source(&self, target: &str) -> Option<&MediaSource> {
        self.bindings.get(target).map(|b| &b.source)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// targets whose playback is still blocked
    pub fn blocked_targets(&self) -> Vec<TargetId> {
        self.bindings
            .iter()
            .filter(|(_, b)| b.retry.is_some())
            .map(|(t, _)| t.clone())
            .collect()
    }

    /// feeds a retry trigger to every blocked target, or only to the targets of
    /// one participant (an unmute belongs to a single source).
    /// returns how many targets started playing
    pub fn retry_playback(&mut self, trigger: RetryTrigger, participant: Option<&str>) -> usize {
        let targets: Vec<TargetId> = self
            .bindings
            .iter()
            .filter(|(_, b)| b.retry.is_some())
            .filter(|(_, b)| participant.map(|p| b.participant == p).unwrap_or(true))
            .map(|(t, _)| t.clone())
            .collect();
        targets
            .iter()
            .filter(|t| self.retry_target(t, trigger))
            .count()
    }

    /// a delay trigger scheduled by this binder came due
    pub(crate) fn on_retry_due(&mut self, target: &TargetId, generation: u64) {
        let current = self
            .bindings
            .get(target)
            .map(|b| b.generation == generation && b.retry.is_some())
            .unwrap_or(false);
        if current {
            self.retry_target(target, RetryTrigger::Delay);
        } else {
            log::debug!("ignoring stale playback retry for {}", target);
        }
    }

    fn retry_target(&mut self, target: &TargetId, trigger: RetryTrigger) -> bool {
        let binding = match self.bindings.get_mut(target) {
            Some(b) => b,
            None => return false,
        };
        let state = match binding.retry.as_mut() {
            Some(s) => s,
            None => return false,
        };
        if !self.policy.admit(state, trigger) {
            return false;
        }

        match self.backend.play(target) {
            Ok(()) => {
                log::info!(
                    "playback started on {} after {} retries ({:?})",
                    target,
                    state.attempts(),
                    trigger
                );
                binding.retry = None;
                true
            }
            Err(PlaybackError::Blocked) => {
                if trigger == RetryTrigger::Delay {
                    if let Some(delay) = self.policy.next_delay(state) {
                        schedule_retry(&self.events, target, binding.generation, delay);
                    }
                }
                if self.policy.exhausted(state) {
                    log::warn!("giving up on playback for {}", target);
                    binding.retry = None;
                }
                false
            }
            Err(PlaybackError::Failed(reason)) => {
                log::warn!("playback failed on {}: {}", target, reason);
                binding.retry = None;
                false
            }
        }
    }

    fn start_playback(&mut self, target: &TargetId, binding: &mut Binding) {
        if !self.backend.autoplay_gated() {
            return;
        }
        match self.backend.play(target) {
            Ok(()) => {}
            Err(PlaybackError::Blocked) => {
                log::info!("playback blocked on {}, arming retries", target);
                let mut state = RetryState::default();
                if let Some(delay) = self.policy.next_delay(&mut state) {
                    schedule_retry(&self.events, target, binding.generation, delay);
                }
                binding.retry = Some(state);
            }
            Err(PlaybackError::Failed(reason)) => {
                log::warn!("playback failed on {}: {}", target, reason);
            }
        }
    }

    fn attach_source(
        &mut self,
        target: &TargetId,
        source: &MediaSource,
        options: &BindOptions,
    ) -> Result<()> {
        match source {
            MediaSource::Sfu(track) => track.attach(target),
            MediaSource::Local(stream) | MediaSource::Remote(stream) => {
                self.backend.attach(target, stream, options)
            }
        }
    }

    fn detach_source(&mut self, target: &TargetId, source: &MediaSource) {
        match source {
            MediaSource::Sfu(track) => track.detach(target),
            MediaSource::Local(_) | MediaSource::Remote(_) => self.backend.detach(target),
        }
    }
}
