//! Change notifications for the curve engraving store.
//!
//! Subscribers get their own unbounded channel. Dropping the `Subscription`
//! unsubscribes; a subscriber whose receiver is gone is pruned on the next
//! emit as well.
use crossbeam_channel as xch;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurveEvent {
    AreaSet,
    PointsRemeasured,
    AreaCleared,
}

type Subscribers = Mutex<Vec<(u64, xch::Sender<CurveEvent>)>>;

#[derive(Default)]
pub struct EventBus {
    subscribers: Arc<Subscribers>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = xch::unbounded();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push((id, tx));
        }
        Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn emit(&self, event: CurveEvent) {
        let Ok(mut subs) = self.subscribers.lock() else {
            tracing::warn!(?event, "event bus poisoned, dropping event");
            return;
        };
        subs.retain(|(_, tx)| tx.send(event).is_ok());
        tracing::trace!(?event, subscribers = subs.len(), "emitted");
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

pub struct Subscription {
    id: u64,
    rx: xch::Receiver<CurveEvent>,
    bus: Weak<Subscribers>,
}

impl Subscription {
    pub fn try_recv(&self) -> Option<CurveEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain everything received so far.
    pub fn drain(&self) -> Vec<CurveEvent> {
        self.rx.try_iter().collect()
    }

    pub fn receiver(&self) -> &xch::Receiver<CurveEvent> {
        &self.rx
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            if let Ok(mut subs) = bus.lock() {
                subs.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_unsubscribes() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
        drop(b);
        assert_eq!(bus.subscriber_count(), 1);
        bus.emit(CurveEvent::AreaSet);
        assert_eq!(a.drain(), [CurveEvent::AreaSet]);
    }

    #[test]
    fn subscription_outliving_bus_is_harmless() {
        let bus = EventBus::new();
        let s = bus.subscribe();
        drop(bus);
        assert!(s.try_recv().is_none());
    }
}
