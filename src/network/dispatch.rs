//! Inbound envelope fan-out

use dashmap::DashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::protocol::{Channel, Envelope, MessageKind};

pub type HandlerId = u64;

pub type Handler = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// What a handler listens to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subscription {
    Kind(MessageKind),
    /// Delivered in addition to the plain `Kind` subscribers
    KindOnChannel(MessageKind, Channel),
    /// Every inbound envelope
    All,
}

#[derive(Default)]
pub struct Dispatcher {
    handlers: DashMap<Subscription, Vec<(HandlerId, Handler)>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, subscription: Subscription, handler: Handler) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.handlers.entry(subscription).or_default().push((id, handler));
        id
    }

    /// Remove one handler, or all of the subscription's handlers when `id` is None
    pub fn off(&self, subscription: &Subscription, id: Option<HandlerId>) {
        match id {
            None => {
                self.handlers.remove(subscription);
            }
            Some(id) => {
                let now_empty = match self.handlers.get_mut(subscription) {
                    Some(mut handlers) => {
                        handlers.retain(|(handler_id, _)| *handler_id != id);
                        handlers.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    self.handlers.remove_if(subscription, |_, handlers| handlers.is_empty());
                }
            }
        }
    }

    pub fn handler_count(&self, subscription: &Subscription) -> usize {
        self.handlers.get(subscription).map(|h| h.len()).unwrap_or(0)
    }

    /// Deliver to channel-specific, then plain-kind, then wildcard handlers
    ///
    /// Returns how many handlers ran to completion.
    pub fn dispatch(&self, envelope: &Envelope) -> usize {
        let mut order = Vec::with_capacity(3);
        if let Some(channel) = &envelope.channel {
            order.push(Subscription::KindOnChannel(envelope.kind.clone(), channel.clone()));
        }
        order.push(Subscription::Kind(envelope.kind.clone()));
        order.push(Subscription::All);

        let mut delivered = 0;
        for subscription in order {
            // Clone out so handlers may call on/off without deadlocking the map
            let handlers: Vec<Handler> = match self.handlers.get(&subscription) {
                Some(entry) => entry.iter().map(|(_, handler)| handler.clone()).collect(),
                None => continue,
            };
            for handler in handlers {
                match catch_unwind(AssertUnwindSafe(|| handler(envelope))) {
                    Ok(()) => delivered += 1,
                    Err(_) => tracing::error!("Handler for {:?} panicked", subscription),
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Handler {
        let log = log.clone();
        Arc::new(move |_| log.lock().push(name))
    }

    #[test]
    fn test_dispatch_order() {
        let dispatcher = Dispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        dispatcher.on(Subscription::All, recorder(&log, "all"));
        dispatcher.on(Subscription::Kind(MessageKind::OutputAudio), recorder(&log, "kind-1"));
        dispatcher.on(
            Subscription::KindOnChannel(MessageKind::OutputAudio, Channel::Index(0)),
            recorder(&log, "channel"),
        );
        dispatcher.on(Subscription::Kind(MessageKind::OutputAudio), recorder(&log, "kind-2"));

        let envelope = Envelope::new(MessageKind::OutputAudio).with_channel(Channel::Index(0));
        assert_eq!(dispatcher.dispatch(&envelope), 4);
        assert_eq!(*log.lock(), vec!["channel", "kind-1", "kind-2", "all"]);
    }

    #[test]
    fn test_channel_subscription_ignores_other_channels() {
        let dispatcher = Dispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.on(
            Subscription::KindOnChannel(MessageKind::OutputAudio, Channel::Index(1)),
            recorder(&log, "one"),
        );

        let envelope = Envelope::new(MessageKind::OutputAudio).with_channel(Channel::Index(2));
        assert_eq!(dispatcher.dispatch(&envelope), 0);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_panicking_handler_does_not_stop_others() {
        let dispatcher = Dispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.on(Subscription::Kind(MessageKind::Init), Arc::new(|_| panic!("boom")));
        dispatcher.on(Subscription::Kind(MessageKind::Init), recorder(&log, "after"));

        assert_eq!(dispatcher.dispatch(&Envelope::new(MessageKind::Init)), 1);
        assert_eq!(*log.lock(), vec!["after"]);
    }

    #[test]
    fn test_off_by_id_and_all() {
        let dispatcher = Dispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let kind = Subscription::Kind(MessageKind::Ping);
        let first = dispatcher.on(kind.clone(), recorder(&log, "first"));
        dispatcher.on(kind.clone(), recorder(&log, "second"));

        dispatcher.off(&kind, Some(first));
        assert_eq!(dispatcher.handler_count(&kind), 1);

        dispatcher.off(&kind, None);
        assert_eq!(dispatcher.handler_count(&kind), 0);
        assert_eq!(dispatcher.dispatch(&Envelope::new(MessageKind::Ping)), 0);
    }
}
