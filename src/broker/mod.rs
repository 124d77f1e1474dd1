//! Work queue consumption
//!
//! Task messages arrive on named topics. Delivery is at-least-once and the
//! queue owns the redelivery budget; the [`Consumer`] only decides, per
//! message, whether to ack, requeue or drop it.

pub mod consumer;
pub mod memory;

pub use consumer::{Consumer, Handler, HandlerContext, RetryPolicy, Settlement, SettlementCounts};
pub use memory::{BrokerStats, MemoryBroker};

use crate::config::types::Result;
use std::time::Duration;

/// One delivery of a task message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub id: u64,
    pub topic: String,
    pub body: Vec<u8>,
    /// 1 on first delivery
    pub attempt: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequeueOutcome {
    Requeued,
    /// The redelivery budget is spent; the message was dropped
    Exhausted,
}

/// Message transport
pub trait WorkQueue: Send + Sync {
    fn publish(&self, topic: &str, body: Vec<u8>) -> Result<()>;

    /// Next message on `topic`, waiting at most `wait`
    fn pull(&self, topic: &str, wait: Duration) -> Result<Option<Message>>;

    /// Settle a delivery; the message will not be seen again
    fn ack(&self, message: &Message) -> Result<()>;

    /// Return a delivery to its topic for another attempt
    fn requeue(&self, message: &Message) -> Result<RequeueOutcome>;

    /// Return a delivery that never ran; it does not count against the budget
    fn release(&self, message: &Message) -> Result<()>;
}
