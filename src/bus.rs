//! In-process event bus with at-least-once delivery.
//!
//! One topic per [`EventCategory`]. All subscriptions to a category share
//! the topic's queue, so a consumer that restarts resumes from the oldest
//! unacked message. A delivery that is neither acked nor deferred within
//! the visibility window is redelivered.
//!
//! Ordering is preserved per `resource_id`: a message is never handed out
//! while an older unacked message for the same resource is pending in the
//! same topic. Messages for different resources are independent.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::domain::{Event, EventCategory, IngestError};

/// Bus tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Time a delivery stays invisible before it is redelivered
    #[serde(default = "default_visibility")]
    pub visibility_timeout_ms: u64,
}

fn default_visibility() -> u64 {
    30_000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_ms: default_visibility(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    event: Event,
    visible_at: Instant,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct TopicState {
    next_offset: u64,
    entries: BTreeMap<u64, Entry>,
}

impl TopicState {
    /// Take the first deliverable entry, or report when one may become visible
    fn take(&mut self, now: Instant, visibility: Duration) -> Result<(u64, Event, u32), Option<Instant>> {
        let mut blocked: HashSet<&str> = HashSet::new();
        let mut wake: Option<Instant> = None;
        let mut chosen = None;

        for (offset, entry) in self.entries.iter() {
            let resource = entry.event.resource_id.as_str();
            if blocked.contains(resource) {
                continue;
            }
            if entry.visible_at <= now {
                chosen = Some(*offset);
                break;
            }
            blocked.insert(resource);
            wake = Some(wake.map_or(entry.visible_at, |w| w.min(entry.visible_at)));
        }

        let offset = chosen.ok_or(wake)?;
        let entry = self.entries.get_mut(&offset).ok_or(wake)?;
        entry.deliveries += 1;
        entry.visible_at = now + visibility;
        Ok((offset, entry.event.clone(), entry.deliveries))
    }
}

#[derive(Debug)]
struct Topic {
    category: EventCategory,
    state: Mutex<TopicState>,
    notify: Notify,
    visibility: Duration,
}

impl Topic {
    fn new(category: EventCategory, visibility: Duration) -> Self {
        Self {
            category,
            state: Mutex::new(TopicState::default()),
            notify: Notify::new(),
            visibility,
        }
    }

    fn try_take(self: &Arc<Self>) -> Result<Delivery, Option<Instant>> {
        let (offset, event, attempt) = self.state.lock().take(Instant::now(), self.visibility)?;
        trace!(category = %self.category, offset, attempt, "Delivering event");
        Ok(Delivery {
            topic: Arc::clone(self),
            offset,
            attempt,
            event,
        })
    }

    async fn next(self: &Arc<Self>) -> Delivery {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_take() {
                Ok(delivery) => return delivery,
                Err(Some(wake)) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(wake) => {}
                    }
                }
                Err(None) => notified.await,
            }
        }
    }
}

/// Pending and in-flight counts for one category
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TopicStats {
    /// Unacked messages, including in-flight ones
    pub pending: usize,
    /// Messages handed out and not yet visible again
    pub in_flight: usize,
}

/// Per-category event bus
///
/// ```
/// # tokio_test::block_on(async {
/// use aegis::bus::EventBus;
/// use aegis::domain::{Event, EventCategory};
///
/// let bus = EventBus::default();
/// let mut orders = bus.subscribe(EventCategory::Notification);
/// let event = Event::new(EventCategory::Notification, "order-7", serde_json::json!({}), "doc");
/// bus.publish(event).unwrap();
///
/// let delivery = orders.next().await;
/// assert_eq!(delivery.event().resource_id, "order-7");
/// delivery.ack();
/// assert!(bus.is_idle());
/// # });
/// ```
#[derive(Debug)]
pub struct EventBus {
    topics: HashMap<EventCategory, Arc<Topic>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        let visibility = Duration::from_millis(config.visibility_timeout_ms);
        let topics = EventCategory::ALL
            .iter()
            .map(|c| (*c, Arc::new(Topic::new(*c, visibility))))
            .collect();
        Self { topics }
    }

    fn topic(&self, category: EventCategory) -> &Arc<Topic> {
        // Every category gets a topic in `new`
        &self.topics[&category]
    }

    /// Validate and enqueue an event, returning its offset in the topic
    pub fn publish(&self, event: Event) -> Result<u64, IngestError> {
        event.validate()?;
        let topic = self.topic(event.category);

        let offset = {
            let mut state = topic.state.lock();
            let offset = state.next_offset;
            state.next_offset += 1;
            debug!(
                category = %event.category,
                resource_id = %event.resource_id,
                event_id = %event.id,
                offset,
                "Event published"
            );
            state.entries.insert(
                offset,
                Entry {
                    event,
                    visible_at: Instant::now(),
                    deliveries: 0,
                },
            );
            offset
        };

        topic.notify.notify_waiters();
        Ok(offset)
    }

    /// Subscribe to a category
    pub fn subscribe(&self, category: EventCategory) -> Subscription {
        Subscription {
            topic: Arc::clone(self.topic(category)),
        }
    }

    /// Counts per category
    pub fn stats(&self) -> HashMap<EventCategory, TopicStats> {
        let now = Instant::now();
        self.topics
            .iter()
            .map(|(category, topic)| {
                let state = topic.state.lock();
                let in_flight = state
                    .entries
                    .values()
                    .filter(|e| e.deliveries > 0 && e.visible_at > now)
                    .count();
                (
                    *category,
                    TopicStats {
                        pending: state.entries.len(),
                        in_flight,
                    },
                )
            })
            .collect()
    }

    /// True when no category has unacked messages
    pub fn is_idle(&self) -> bool {
        self.topics
            .values()
            .all(|topic| topic.state.lock().entries.is_empty())
    }
}

/// Consumer handle for one category
#[derive(Debug, Clone)]
pub struct Subscription {
    topic: Arc<Topic>,
}

impl Subscription {
    pub fn category(&self) -> EventCategory {
        self.topic.category
    }

    /// Wait for the next deliverable message
    pub async fn next(&mut self) -> Delivery {
        self.topic.next().await
    }

    /// Take a message if one is deliverable right now
    pub fn try_next(&mut self) -> Option<Delivery> {
        self.topic.try_take().ok()
    }

    /// Infinite stream of deliveries
    pub fn into_stream(self) -> impl Stream<Item = Delivery> {
        stream::unfold(self, |mut sub| async move {
            let delivery = sub.next().await;
            Some((delivery, sub))
        })
    }
}

/// A message handed to a consumer; must be acked or deferred
#[derive(Debug)]
pub struct Delivery {
    topic: Arc<Topic>,
    offset: u64,
    attempt: u32,
    event: Event,
}

impl Delivery {
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Offset within the category topic
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Delivery attempt, starting at 1
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Remove the message from the bus
    pub fn ack(self) {
        let removed = self.topic.state.lock().entries.remove(&self.offset).is_some();
        trace!(category = %self.topic.category, offset = self.offset, removed, "Event acked");
        self.topic.notify.notify_waiters();
    }

    /// Hide the message for `delay`, keeping its position
    pub fn defer(self, delay: Duration) {
        if let Some(entry) = self.topic.state.lock().entries.get_mut(&self.offset) {
            entry.visible_at = Instant::now() + delay;
        }
        debug!(
            category = %self.topic.category,
            offset = self.offset,
            delay_ms = delay.as_millis() as u64,
            "Event deferred"
        );
        self.topic.notify.notify_waiters();
    }
}
