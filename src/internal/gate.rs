use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::CallResult;
use crate::internal::data_types::*;
use crate::internal::events::{IncomingCall, InternalEvent};
use crate::internal::signaling::{IncomingCallFeed, Subscription};

/// resolves caller display metadata (name, avatar) for an incoming call
#[async_trait]
pub trait CallerDirectory: Send + Sync {
    async fn lookup(&self, id: &ParticipantId) -> Result<CallerInfo>;
}

/// a directory that knows nobody. every caller gets the placeholder label
pub struct NoDirectory;

#[async_trait]
impl CallerDirectory for NoDirectory {
    async fn lookup(&self, id: &ParticipantId) -> Result<CallerInfo> {
        bail!("no caller directory configured for {}", id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// our own outgoing call echoed back
    Echo,
    /// the same call was already admitted
    Duplicate,
    /// another call is pending or active
    Busy,
}

pub struct PendingCall {
    pub signal: IncomingCall,
    pub caller: CallerInfo,
    expiry: JoinHandle<()>,
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.expiry.abort();
    }
}

/// filters raw `call:incoming` signals: drops echoes and duplicates, admits at most
/// one pending call and expires it after the ring timeout
pub struct IncomingCallGate {
    local_id: ParticipantId,
    ring_timeout: Duration,
    pending: Option<PendingCall>,
    directory: Arc<dyn CallerDirectory>,
    events: mpsc::UnboundedSender<InternalEvent>,
    feed: Option<(mpsc::UnboundedReceiver<IncomingCall>, Subscription)>,
}

impl IncomingCallGate {
    pub(crate) fn new(
        local_id: ParticipantId,
        ring_timeout: Duration,
        directory: Arc<dyn CallerDirectory>,
        events: mpsc::UnboundedSender<InternalEvent>,
    ) -> Self {
        Self {
            local_id,
            ring_timeout,
            pending: None,
            directory,
            events,
            feed: None,
        }
    }

    /// subscribes to the feed. the gate is its only consumer
    pub fn attach_feed(&mut self, feed: &IncomingCallFeed) -> CallResult<()> {
        let subscription = feed.subscribe()?;
        self.feed = Some(subscription);
        Ok(())
    }

    pub fn detach_feed(&mut self) {
        if let Some((_rx, subscription)) = self.feed.take() {
            subscription.unsubscribe();
        }
    }

    /// waits for the next raw signal. never resolves without a feed
    pub(crate) async fn next_signal(&mut self) -> Option<IncomingCall> {
        match self.feed.as_mut() {
            Some((rx, _)) => rx.recv().await,
            None => futures::future::pending().await,
        }
    }

    /// `controller_idle` is false while any call is active, outgoing ones included
    pub fn offer(&mut self, signal: IncomingCall, controller_idle: bool) -> Admission {
        if signal.initiator_id == self.local_id {
            log::debug!("ignoring echo of own call {}", signal.call_id);
            return Admission::Echo;
        }
        if let Some(pending) = &self.pending {
            if pending.signal.call_id == signal.call_id {
                log::debug!("duplicate incoming call {}", signal.call_id);
                return Admission::Duplicate;
            }
            log::info!(
                "dropping incoming call {} from {}: call {} is still ringing",
                signal.call_id,
                signal.initiator_id,
                pending.signal.call_id
            );
            return Admission::Busy;
        }
        if !controller_idle {
            log::info!(
                "dropping incoming call {} from {}: already in a call",
                signal.call_id,
                signal.initiator_id
            );
            return Admission::Busy;
        }

        let call_id = signal.call_id.clone();
        let expiry = self.start_expiry_timer(call_id.clone());
        self.resolve_caller(call_id, signal.initiator_id.clone());
        self.pending = Some(PendingCall {
            caller: CallerInfo::placeholder(&signal.initiator_id),
            signal,
            expiry,
        });
        Admission::Admitted
    }

    pub fn pending(&self) -> Option<&PendingCall> {
        self.pending.as_ref()
    }

    pub fn is_pending(&self, call_id: &CallId) -> bool {
        self.pending
            .as_ref()
            .map(|p| &p.signal.call_id == call_id)
            .unwrap_or(false)
    }

    /// clears the pending call (accepted, declined or ended) and cancels its timer
    pub fn resolve(&mut self, call_id: &CallId) -> Option<PendingCall> {
        if self.is_pending(call_id) {
            self.pending.take()
        } else {
            None
        }
    }

    /// called when the ring timer fires. stale expiries return None
    pub fn expire(&mut self, call_id: &CallId) -> Option<PendingCall> {
        let pending = self.resolve(call_id);
        if pending.is_none() {
            log::debug!("ignoring stale ring expiry for {}", call_id);
        }
        pending
    }

    /// stores resolved caller metadata. false if the call is no longer pending
    pub fn set_caller(&mut self, call_id: &CallId, caller: CallerInfo) -> bool {
        match self.pending.as_mut() {
            Some(p) if &p.signal.call_id == call_id => {
                p.caller = caller;
                true
            }
            _ => false,
        }
    }

    fn start_expiry_timer(&self, call_id: CallId) -> JoinHandle<()> {
        let tx = self.events.clone();
        // deadline is fixed at admission, not when the task first runs
        let deadline = tokio::time::Instant::now() + self.ring_timeout;
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if tx.send(InternalEvent::RingExpired { call_id }).is_err() {
                log::warn!("ring timer fired after the controller went away");
            }
        })
    }

    fn resolve_caller(&self, call_id: CallId, initiator: ParticipantId) {
        let tx = self.events.clone();
        let directory = self.directory.clone();
        tokio::spawn(async move {
            let caller = match directory.lookup(&initiator).await {
                Ok(caller) => caller,
                Err(e) => {
                    log::info!("caller lookup for {} failed: {}", &initiator, e);
                    CallerInfo::placeholder(&initiator)
                }
            };
            if tx
                .send(InternalEvent::CallerResolved { call_id, caller })
                .is_err()
            {
                log::warn!("caller resolved after the controller went away");
            }
        });
    }
}
