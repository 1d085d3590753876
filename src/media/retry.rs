use std::collections::HashSet;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// events that give a blocked (autoplay-gated) surface another chance to play
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryTrigger {
    AnimationFrame,
    /// fixed delay after the failed attempt, re-armed with backoff
    Delay,
    /// the source's first unmute
    Unmute,
    VisibilityChange,
    /// first user pointer interaction with the page
    PointerInteraction,
}

/// how a binder retries playback that the platform refused to start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
    /// upper bound on playback attempts after the initial one
    pub max_attempts: u32,
    pub triggers: Vec<RetryTrigger>,
    pub initial_delay_ms: u64,
    /// multiplier applied to the delay each time it re-arms
    pub backoff: f64,
    /// random fraction (0..1) added to each delay
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            triggers: vec![
                RetryTrigger::AnimationFrame,
                RetryTrigger::Delay,
                RetryTrigger::Unmute,
                RetryTrigger::VisibilityChange,
                RetryTrigger::PointerInteraction,
            ],
            initial_delay_ms: 250,
            backoff: 2.0,
            jitter: 0.0,
        }
    }
}

/// per-binding bookkeeping. dropping it is the same as removing every listener
#[derive(Debug, Default, Clone)]
pub struct RetryState {
    attempts: u32,
    fired: HashSet<RetryTrigger>,
    delays_armed: u32,
}

impl RetryState {
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl RetryPolicy {
    pub fn listens_for(&self, trigger: RetryTrigger) -> bool {
        self.triggers.contains(&trigger)
    }

    /// decides whether `trigger` may spend an attempt, and records it if so.
    /// every trigger but `Delay` fires at most once per binding
    pub fn admit(&self, state: &mut RetryState, trigger: RetryTrigger) -> bool {
        if !self.listens_for(trigger) || self.exhausted(state) {
            return false;
        }
        if trigger != RetryTrigger::Delay && !state.fired.insert(trigger) {
            return false;
        }
        state.attempts += 1;
        true
    }

    pub fn exhausted(&self, state: &RetryState) -> bool {
        state.attempts >= self.max_attempts
    }

    /// delay before the next `Delay` attempt, or None if no more should be scheduled
    pub fn next_delay(&self, state: &mut RetryState) -> Option<Duration> {
        if !self.listens_for(RetryTrigger::Delay) || self.exhausted(state) {
            return None;
        }
        let base = self.initial_delay_ms as f64 * self.backoff.max(1.0).powi(state.delays_armed as i32);
        let jitter = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..self.jitter.min(1.0)) * base
        } else {
            0.0
        };
        state.delays_armed += 1;
        Some(Duration::from_millis((base + jitter) as u64))
    }
}
