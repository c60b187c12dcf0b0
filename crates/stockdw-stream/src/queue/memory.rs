//! In-process broker: one append-only log per topic shared by every clone.
//!
//! Messages every known group has committed past are dropped, so a long-running
//! single-process deployment holds only the unconsumed tail of each topic.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use super::{DeliveryCallback, QueueMessage, TopicConsumer, TopicProducer};
use crate::error::QueueError;

#[derive(Default)]
struct TopicLog {
    /// Offset of `messages[0]`.
    base: u64,
    messages: VecDeque<QueueMessage>,
    committed: HashMap<String, u64>,
    /// Lowest offset each subscribed group may still read.
    floors: HashMap<String, u64>,
}

impl TopicLog {
    fn end(&self) -> u64 {
        self.base + self.messages.len() as u64
    }

    fn get(&self, offset: u64) -> Option<&QueueMessage> {
        let index = offset.checked_sub(self.base)?;
        self.messages.get(usize::try_from(index).ok()?)
    }

    fn trim(&mut self) {
        let Some(floor) = self.floors.values().copied().min() else {
            return;
        };
        while self.base < floor && self.messages.pop_front().is_some() {
            self.base += 1;
        }
    }
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, TopicLog>,
    closed: bool,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    appended: Notify,
}

impl BrokerInner {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn producer(&self, topic: &str) -> MemoryProducer {
        MemoryProducer {
            inner: Arc::clone(&self.inner),
            topic: topic.to_owned(),
            pending: Vec::new(),
        }
    }

    /// Subscribes `group` to `topic`, resuming at its committed offset or at the log end.
    pub fn consumer(&self, topic: &str, group: &str) -> MemoryConsumer {
        let position = {
            let mut state = self.inner.lock();
            let log = state.topics.entry(topic.to_owned()).or_default();
            let start = log.committed.get(group).copied().unwrap_or_else(|| log.end());
            log.floors.entry(group.to_owned()).or_insert(start);
            start
        };
        MemoryConsumer {
            inner: Arc::clone(&self.inner),
            topic: topic.to_owned(),
            group: group.to_owned(),
            position,
        }
    }

    /// Offset `group` will resume from, if it has committed one.
    pub fn committed_offset(&self, topic: &str, group: &str) -> Option<u64> {
        self.inner
            .lock()
            .topics
            .get(topic)
            .and_then(|log| log.committed.get(group).copied())
    }

    /// Messages ever appended to `topic`, trimmed ones included.
    pub fn len(&self, topic: &str) -> usize {
        self.inner
            .lock()
            .topics
            .get(topic)
            .map_or(0, |log| log.end() as usize)
    }

    /// Messages still held for groups that have not committed past them.
    pub fn retained(&self, topic: &str) -> usize {
        self.inner
            .lock()
            .topics
            .get(topic)
            .map_or(0, |log| log.messages.len())
    }

    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }

    /// Stops delivery: later flushes fail and consumers drain then report closed.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.inner.appended.notify_waiters();
    }
}

pub struct MemoryProducer {
    inner: Arc<BrokerInner>,
    topic: String,
    pending: Vec<(String, Vec<u8>, DeliveryCallback)>,
}

impl TopicProducer for MemoryProducer {
    fn produce(&mut self, key: &str, payload: Vec<u8>, on_delivery: DeliveryCallback) {
        self.pending.push((key.to_owned(), payload, on_delivery));
    }

    fn flush(&mut self) -> Result<usize, QueueError> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        let pending = std::mem::take(&mut self.pending);

        let mut state = self.inner.lock();
        if state.closed {
            drop(state);
            let error = QueueError::Closed {
                topic: self.topic.clone(),
            };
            for (_, _, on_delivery) in pending {
                on_delivery(Err(&error));
            }
            return Err(error);
        }

        let log = state.topics.entry(self.topic.clone()).or_default();
        let mut delivered = Vec::with_capacity(pending.len());
        for (key, payload, on_delivery) in pending {
            let offset = log.end();
            log.messages.push_back(QueueMessage {
                offset,
                key,
                payload,
            });
            delivered.push((offset, on_delivery));
        }
        drop(state);
        self.inner.appended.notify_waiters();

        let count = delivered.len();
        for (offset, on_delivery) in delivered {
            on_delivery(Ok(offset));
        }
        Ok(count)
    }
}

pub struct MemoryConsumer {
    inner: Arc<BrokerInner>,
    topic: String,
    group: String,
    position: u64,
}

impl MemoryConsumer {
    pub fn position(&self) -> u64 {
        self.position
    }

    fn try_next(&mut self) -> Result<Option<QueueMessage>, QueueError> {
        let state = self.inner.lock();
        let message = state.topics.get(&self.topic).and_then(|log| {
            log.get(self.position.max(log.base)).cloned()
        });
        match message {
            Some(message) => {
                self.position = message.offset + 1;
                Ok(Some(message))
            }
            None if state.closed => Err(QueueError::Closed {
                topic: self.topic.clone(),
            }),
            None => Ok(None),
        }
    }
}

impl TopicConsumer for MemoryConsumer {
    fn poll<'a>(
        &'a mut self,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<QueueMessage>, QueueError>> + Send + 'a>> {
        Box::pin(async move {
            let deadline = Instant::now() + timeout;
            let inner = Arc::clone(&self.inner);
            loop {
                let appended = inner.appended.notified();
                tokio::pin!(appended);
                appended.as_mut().enable();

                if let Some(message) = self.try_next()? {
                    return Ok(Some(message));
                }
                if tokio::time::timeout_at(deadline, appended).await.is_err() {
                    return Ok(None);
                }
            }
        })
    }

    fn commit(&mut self, next_offset: u64) -> Result<(), QueueError> {
        let mut state = self.inner.lock();
        let log = state.topics.entry(self.topic.clone()).or_default();
        log.committed.insert(self.group.clone(), next_offset);
        log.floors.insert(self.group.clone(), next_offset);
        log.trim();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<Result<u64, String>>>>, impl Fn() -> DeliveryCallback) {
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&outcomes);
        let make = move || -> DeliveryCallback {
            let sink = Arc::clone(&sink);
            Box::new(move |outcome: Result<u64, &QueueError>| {
                sink.lock()
                    .expect("outcomes")
                    .push(outcome.map_err(ToString::to_string));
            })
        };
        (outcomes, make)
    }

    #[tokio::test]
    async fn new_group_starts_at_latest() {
        let broker = MemoryBroker::new();
        let mut producer = broker.producer("ticks");
        let (_, callback) = recorder();
        producer.produce("old", b"old".to_vec(), callback());
        producer.flush().expect("flush");

        let mut consumer = broker.consumer("ticks", "loader");
        assert_eq!(consumer.poll(Duration::from_millis(10)).await.expect("poll"), None);

        producer.produce("new", b"new".to_vec(), callback());
        producer.flush().expect("flush");
        let message = consumer
            .poll(Duration::from_millis(10))
            .await
            .expect("poll")
            .expect("message");
        assert_eq!((message.offset, message.key.as_str()), (1, "new"));
    }

    #[tokio::test]
    async fn uncommitted_messages_are_redelivered_to_the_group() {
        let broker = MemoryBroker::new();
        let mut consumer = broker.consumer("ticks", "loader");
        let mut producer = broker.producer("ticks");
        let (outcomes, callback) = recorder();
        for key in ["a", "b", "c"] {
            producer.produce(key, key.as_bytes().to_vec(), callback());
        }
        assert_eq!(producer.flush().expect("flush"), 3);
        assert_eq!(*outcomes.lock().expect("outcomes"), vec![Ok(0), Ok(1), Ok(2)]);

        consumer.poll(Duration::from_millis(10)).await.expect("poll");
        consumer.commit(1).expect("commit");
        consumer.poll(Duration::from_millis(10)).await.expect("poll");
        drop(consumer);

        let mut resumed = broker.consumer("ticks", "loader");
        let message = resumed
            .poll(Duration::from_millis(10))
            .await
            .expect("poll")
            .expect("message");
        assert_eq!(message.key, "b");
        assert_eq!(broker.committed_offset("ticks", "loader"), Some(1));
    }

    #[tokio::test]
    async fn messages_every_group_committed_past_are_dropped() {
        let broker = MemoryBroker::new();
        let mut loader = broker.consumer("ticks", "loader");
        let mut audit = broker.consumer("ticks", "audit");
        let mut producer = broker.producer("ticks");
        for key in ["a", "b", "c"] {
            producer.produce(key, key.as_bytes().to_vec(), Box::new(|_: Result<u64, &QueueError>| {}));
        }
        producer.flush().expect("flush");

        loader.commit(3).expect("commit");
        assert_eq!(broker.retained("ticks"), 3);

        audit.poll(Duration::from_millis(10)).await.expect("poll");
        audit.commit(1).expect("commit");
        assert_eq!(broker.retained("ticks"), 2);
        assert_eq!(broker.len("ticks"), 3);

        let message = audit
            .poll(Duration::from_millis(10))
            .await
            .expect("poll")
            .expect("message");
        assert_eq!((message.offset, message.key.as_str()), (1, "b"));

        producer.produce("d", b"d".to_vec(), Box::new(|_: Result<u64, &QueueError>| {}));
        producer.flush().expect("flush");
        let mut late = broker.consumer("ticks", "late");
        assert_eq!(late.poll(Duration::from_millis(10)).await.expect("poll"), None);
        drop(late);

        audit.commit(4).expect("commit");
        loader.commit(4).expect("commit");
        assert_eq!(broker.retained("ticks"), 0);
        assert_eq!(broker.len("ticks"), 4);
    }

    #[tokio::test]
    async fn poll_wakes_when_a_message_arrives() {
        let broker = MemoryBroker::new();
        let mut consumer = broker.consumer("ticks", "loader");
        let mut producer = broker.producer("ticks");

        let publish = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.produce("late", b"late".to_vec(), Box::new(|_: Result<u64, &QueueError>| {}));
            producer.flush().expect("flush");
        });

        let message = consumer.poll(Duration::from_secs(5)).await.expect("poll");
        assert_eq!(message.map(|message| message.key), Some(String::from("late")));
        publish.await.expect("publisher task");
    }

    #[tokio::test]
    async fn closed_broker_fails_delivery_and_drains_consumers() {
        let broker = MemoryBroker::new();
        let mut consumer = broker.consumer("ticks", "loader");
        let mut producer = broker.producer("ticks");
        producer.produce("kept", b"kept".to_vec(), Box::new(|_: Result<u64, &QueueError>| {}));
        producer.flush().expect("flush");
        broker.close();

        let (outcomes, callback) = recorder();
        producer.produce("lost", b"lost".to_vec(), callback());
        assert!(matches!(producer.flush(), Err(QueueError::Closed { .. })));
        assert!(outcomes.lock().expect("outcomes")[0].is_err());

        assert!(consumer.poll(Duration::from_millis(10)).await.expect("drain").is_some());
        assert!(matches!(
            consumer.poll(Duration::from_millis(10)).await,
            Err(QueueError::Closed { .. })
        ));
    }
}
