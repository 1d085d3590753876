use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{CallError, CallResult};
use crate::internal::events::IncomingCall;

struct Slot {
    id: Uuid,
    tx: mpsc::UnboundedSender<IncomingCall>,
}

type Shared = Mutex<Option<Slot>>;

/// delivers `call:incoming` signals from the transport to exactly one consumer
#[derive(Clone, Default)]
pub struct IncomingCallFeed {
    slot: Arc<Shared>,
}

/// keeps a feed subscription alive. dropping it unsubscribes
pub struct Subscription {
    slot: Weak<Shared>,
    id: Uuid,
}

fn lock(slot: &Shared) -> MutexGuard<'_, Option<Slot>> {
    match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl IncomingCallFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// hands the signal to the subscriber. returns false if nobody is listening
    pub fn publish(&self, call: IncomingCall) -> bool {
        let mut slot = lock(&self.slot);
        let delivered = match slot.as_ref() {
            Some(s) => s.tx.send(call).is_ok(),
            None => false,
        };
        if !delivered {
            if slot.take().is_some() {
                log::info!("incoming call feed subscriber went away");
            } else {
                log::debug!("dropping incoming call: no subscriber");
            }
        }
        delivered
    }

    pub fn subscribe(&self) -> CallResult<(mpsc::UnboundedReceiver<IncomingCall>, Subscription)> {
        let mut slot = lock(&self.slot);
        if let Some(existing) = slot.as_ref() {
            if !existing.tx.is_closed() {
                return Err(CallError::FeedBusy);
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        *slot = Some(Slot { id, tx });
        Ok((
            rx,
            Subscription {
                slot: Arc::downgrade(&self.slot),
                id,
            },
        ))
    }

    pub fn has_subscriber(&self) -> bool {
        lock(&self.slot)
            .as_ref()
            .map(|s| !s.tx.is_closed())
            .unwrap_or(false)
    }
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.slot.upgrade() {
            let mut slot = lock(&shared);
            if slot.as_ref().map(|s| s.id == self.id).unwrap_or(false) {
                *slot = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::data_types::{CallId, CallType};

    fn call(id: &str) -> IncomingCall {
        IncomingCall {
            call_id: CallId::from(id),
            conversation_id: "conv".into(),
            initiator_id: "bob".into(),
            call_type: CallType::Audio,
            room_id: None,
        }
    }

    #[test]
    fn single_subscriber() {
        let feed = IncomingCallFeed::new();
        let (_rx, _sub) = feed.subscribe().unwrap();
        assert_eq!(feed.subscribe().err(), Some(CallError::FeedBusy));
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let feed = IncomingCallFeed::new();
        let (mut rx, sub) = feed.subscribe().unwrap();
        assert!(feed.publish(call("c1")));
        assert_eq!(rx.try_recv().unwrap().call_id, CallId::from("c1"));

        sub.unsubscribe();
        assert!(!feed.has_subscriber());
        assert!(!feed.publish(call("c2")));

        // the slot is free again
        assert!(feed.subscribe().is_ok());
    }

    #[test]
    fn stale_subscription_does_not_clear_newer_one() {
        let feed = IncomingCallFeed::new();
        let (rx, old) = feed.subscribe().unwrap();
        drop(rx);
        let (mut rx2, _new) = feed.subscribe().unwrap();
        drop(old);
        assert!(feed.publish(call("c3")));
        assert!(rx2.try_recv().is_ok());
    }
}
