/// In-process work queue
///
/// One unbounded crossbeam channel per topic. Deliveries stay in the
/// in-flight table until acked or requeued.
use crate::broker::{Message, RequeueOutcome, WorkQueue};
use crate::config::types::{Result, UpletError};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

struct Topic {
    tx: Sender<Message>,
    rx: Receiver<Message>,
}

/// Delivery counters of a [`MemoryBroker`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub published: u64,
    pub acked: u64,
    pub requeued: u64,
    pub released: u64,
    pub exhausted: u64,
}

pub struct MemoryBroker {
    topics: Mutex<HashMap<String, Topic>>,
    in_flight: Mutex<HashMap<u64, Message>>,
    next_id: AtomicU64,
    max_attempts: u32,
    stopped: AtomicBool,
    stats: Mutex<BrokerStats>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(5)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryBroker {
    /// `max_attempts` deliveries per message before requeue reports `Exhausted`
    pub fn new(max_attempts: u32) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_attempts: max_attempts.max(1),
            stopped: AtomicBool::new(false),
            stats: Mutex::new(BrokerStats::default()),
        }
    }

    /// Publish `record` as a JSON body
    pub fn push<T: Serialize>(&self, topic: &str, record: &T) -> Result<u64> {
        let body = serde_json::to_vec(record)
            .map_err(|e| UpletError::Validation(format!("unencodable record for {}: {}", topic, e)))?;
        self.enqueue(topic, body)
    }

    /// Refuse new messages and make every pull return immediately
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Messages waiting on `topic`
    pub fn pending(&self, topic: &str) -> usize {
        lock(&self.topics).get(topic).map_or(0, |t| t.rx.len())
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    pub fn stats(&self) -> BrokerStats {
        *lock(&self.stats)
    }

    fn receiver(&self, topic: &str) -> Receiver<Message> {
        self.with_topic(topic, |t| t.rx.clone())
    }

    fn sender(&self, topic: &str) -> Sender<Message> {
        self.with_topic(topic, |t| t.tx.clone())
    }

    fn with_topic<T>(&self, topic: &str, f: impl FnOnce(&Topic) -> T) -> T {
        let mut topics = lock(&self.topics);
        let entry = topics.entry(topic.to_string()).or_insert_with(|| {
            let (tx, rx) = crossbeam_channel::unbounded();
            Topic { tx, rx }
        });
        f(entry)
    }

    fn enqueue(&self, topic: &str, body: Vec<u8>) -> Result<u64> {
        if self.is_stopped() {
            return Err(UpletError::Transient("broker stopped".to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let message = Message {
            id,
            topic: topic.to_string(),
            body,
            attempt: 0,
        };
        self.sender(topic)
            .send(message)
            .map_err(|_| UpletError::Transient(format!("topic {} is closed", topic)))?;
        lock(&self.stats).published += 1;
        Ok(id)
    }

    fn resend(&self, message: Message) -> Result<()> {
        let topic = message.topic.clone();
        self.sender(&topic)
            .send(message)
            .map_err(|_| UpletError::Transient(format!("topic {} is closed", topic)))
    }

    fn take_in_flight(&self, message: &Message) -> Result<Message> {
        lock(&self.in_flight).remove(&message.id).ok_or_else(|| {
            UpletError::Validation(format!("message {} is not in flight", message.id))
        })
    }
}

impl WorkQueue for MemoryBroker {
    fn publish(&self, topic: &str, body: Vec<u8>) -> Result<()> {
        self.enqueue(topic, body).map(|_| ())
    }

    fn pull(&self, topic: &str, wait: Duration) -> Result<Option<Message>> {
        if self.is_stopped() {
            return Ok(None);
        }
        let mut message = match self.receiver(topic).recv_timeout(wait) {
            Ok(message) => message,
            Err(RecvTimeoutError::Timeout) => return Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(UpletError::Transient(format!("topic {} is closed", topic)))
            }
        };
        message.attempt += 1;
        lock(&self.in_flight).insert(message.id, message.clone());
        Ok(Some(message))
    }

    fn ack(&self, message: &Message) -> Result<()> {
        self.take_in_flight(message)?;
        lock(&self.stats).acked += 1;
        Ok(())
    }

    fn requeue(&self, message: &Message) -> Result<RequeueOutcome> {
        let message = self.take_in_flight(message)?;
        if message.attempt >= self.max_attempts {
            lock(&self.stats).exhausted += 1;
            log::warn!(
                "Message {} on {} dropped after {} deliveries",
                message.id,
                message.topic,
                message.attempt
            );
            return Ok(RequeueOutcome::Exhausted);
        }

        self.resend(message)?;
        lock(&self.stats).requeued += 1;
        Ok(RequeueOutcome::Requeued)
    }

    fn release(&self, message: &Message) -> Result<()> {
        let mut message = self.take_in_flight(message)?;
        message.attempt = message.attempt.saturating_sub(1);
        self.resend(message)?;
        lock(&self.stats).released += 1;
        Ok(())
    }
}
