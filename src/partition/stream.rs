// model = "claude-opus-4-5"
// created = "2026-10-14"
// modified = "2026-10-14"
// driver = "Isaac Clayton"

//! Push-based change streams.
//!
//! A `Subject` is a list of observers behind a lock. Publishing calls every
//! observer in subscription order. Observers must not subscribe to the
//! subject that is calling them.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::bot::Bot;
use crate::bot::UpdatedBot;
use super::PartitionErrorEvent;
use super::PartitionEvent;
use super::StatusUpdate;

/// A callback registered on a subject.
pub type Observer<E> = Box<dyn FnMut(&E) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Observers<E> {
    next: u64,
    list: Vec<(SubscriptionId, Observer<E>)>,
}

/// Multi-subscriber event channel. Clones share the same observers.
pub struct Subject<E> {
    inner: Arc<Mutex<Observers<E>>>,
}

impl<E> Clone for Subject<E> {
    fn clone(&self) -> Self {
        return Subject { inner: Arc::clone(&self.inner) };
    }
}

impl<E> Default for Subject<E> {
    fn default() -> Self {
        return Subject {
            inner: Arc::new(Mutex::new(Observers { next: 0, list: Vec::new() })),
        };
    }
}

impl<E> std::fmt::Debug for Subject<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return f.debug_struct("Subject").field("observers", &self.len()).finish();
    }
}

impl<E> Subject<E> {
    pub fn new() -> Subject<E> {
        return Subject::default();
    }

    pub fn subscribe(&self, observer: Observer<E>) -> SubscriptionId {
        let mut inner = self.inner.lock();
        let id = SubscriptionId(inner.next);
        inner.next += 1;
        inner.list.push((id, observer));
        return id;
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.list.len();
        inner.list.retain(|(other, _)| *other != id);
        return inner.list.len() != before;
    }

    pub fn publish(&self, event: &E) {
        let mut inner = self.inner.lock();
        for (_, observer) in inner.list.iter_mut() {
            observer(event);
        }
    }

    pub fn len(&self) -> usize {
        return self.inner.lock().list.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.len() == 0;
    }
}

/// Observe only bots-added events.
pub fn on_bots_added(mut f: impl FnMut(&[Bot]) + Send + 'static) -> Observer<PartitionEvent> {
    return Box::new(move |event: &PartitionEvent| {
        if let PartitionEvent::BotsAdded(bots) = event {
            f(bots);
        }
    });
}

/// Observe only bots-removed events.
pub fn on_bots_removed(mut f: impl FnMut(&[String]) + Send + 'static) -> Observer<PartitionEvent> {
    return Box::new(move |event: &PartitionEvent| {
        if let PartitionEvent::BotsRemoved(ids) = event {
            f(ids);
        }
    });
}

/// Observe only bots-updated events.
pub fn on_bots_updated(mut f: impl FnMut(&[UpdatedBot]) + Send + 'static) -> Observer<PartitionEvent> {
    return Box::new(move |event: &PartitionEvent| {
        if let PartitionEvent::BotsUpdated(updates) = event {
            f(updates);
        }
    });
}

pub fn on_status(mut f: impl FnMut(&StatusUpdate) + Send + 'static) -> Observer<PartitionEvent> {
    return Box::new(move |event: &PartitionEvent| {
        if let PartitionEvent::Status(status) = event {
            f(status);
        }
    });
}

pub fn on_error(mut f: impl FnMut(&PartitionErrorEvent) + Send + 'static) -> Observer<PartitionEvent> {
    return Box::new(move |event: &PartitionEvent| {
        if let PartitionEvent::Error(error) = event {
            f(error);
        }
    });
}

/// Collects every event it sees. Handy for tests and tooling.
#[derive(Clone, Debug, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<PartitionEvent>>>,
}

impl EventRecorder {
    pub fn new() -> EventRecorder {
        return EventRecorder::default();
    }

    pub fn observer(&self) -> Observer<PartitionEvent> {
        let events = Arc::clone(&self.events);
        return Box::new(move |event: &PartitionEvent| events.lock().push(event.clone()));
    }

    pub fn events(&self) -> Vec<PartitionEvent> {
        return self.events.lock().clone();
    }

    pub fn take(&self) -> Vec<PartitionEvent> {
        return std::mem::take(&mut *self.events.lock());
    }

    /// Ids from every bots-added event, in order.
    pub fn added(&self) -> Vec<String> {
        return self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                PartitionEvent::BotsAdded(bots) => Some(bots.iter().map(|bot| bot.id.clone()).collect::<Vec<_>>()),
                _ => None,
            })
            .flatten()
            .collect();
    }

    /// Every bots-removed event, one entry per event.
    pub fn removed(&self) -> Vec<Vec<String>> {
        return self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                PartitionEvent::BotsRemoved(ids) => Some(ids.clone()),
                _ => None,
            })
            .collect();
    }

    pub fn updated(&self) -> Vec<UpdatedBot> {
        return self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                PartitionEvent::BotsUpdated(updates) => Some(updates.clone()),
                _ => None,
            })
            .flatten()
            .collect();
    }

    pub fn statuses(&self) -> Vec<StatusUpdate> {
        return self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                PartitionEvent::Status(status) => Some(status.clone()),
                _ => None,
            })
            .collect();
    }

    pub fn errors(&self) -> Vec<PartitionErrorEvent> {
        return self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                PartitionEvent::Error(error) => Some(error.clone()),
                _ => None,
            })
            .collect();
    }
}
