//! Topic consumer with per-topic worker threads
//!
//! Each registered topic gets `concurrency` threads pulling from the queue.
//! A handler's error is settled by its disposition: requeue, report failed
//! and drop, or drop silently. The consumer keeps no per-message retry
//! state; the queue counts deliveries.

use crate::broker::{Message, RequeueOutcome, WorkQueue};
use crate::config::types::{Disposition, Result, UpletError};
use crate::observability::{Severity, TaskAuditLog, TaskEvent, TaskEventType};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// Deadline sweep period while waiting for the stop signal
const WATCH_INTERVAL: Duration = Duration::from_millis(50);

/// Per-message execution bounds handed to a handler
#[derive(Clone, Debug)]
pub struct HandlerContext {
    pub deadline: Instant,
    /// Set on deadline expiry or when shutdown gives up draining
    pub cancel: Arc<AtomicBool>,
}

impl HandlerContext {
    pub fn new(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// Processes the messages of one topic
pub trait Handler: Send + Sync {
    fn handle(&self, message: &Message, ctx: &HandlerContext) -> Result<()>;

    /// Mark the task carried by `message` failed in the ledger
    fn report_failure(&self, message: &Message) -> Result<()>;
}

/// Bounded retry of failure reports
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with jitter before retry number `retry` (0-based)
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.min(16)).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        let jitter = Duration::from_millis(fastrand::u64(0..=delay.as_millis() as u64 / 2));
        delay + jitter
    }
}

/// How a delivery was settled
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Requeued,
    /// Reported failed and dropped
    Failed,
    /// Dropped without touching the ledger
    Discarded,
}

#[derive(Default)]
struct Counters {
    acked: AtomicU64,
    requeued: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
    unsettled: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SettlementCounts {
    pub acked: u64,
    pub requeued: u64,
    pub failed: u64,
    pub discarded: u64,
    /// Settlements that surfaced an error
    pub unsettled: u64,
}

struct Route {
    topic: String,
    handler: Arc<dyn Handler>,
    concurrency: usize,
    timeout: Duration,
}

struct InFlight {
    topic: String,
    deadline: Instant,
    cancel: Arc<AtomicBool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Consumer {
    queue: Arc<dyn WorkQueue>,
    routes: Vec<Route>,
    drain_timeout: Duration,
    poll_interval: Duration,
    retry: RetryPolicy,
    audit: Arc<TaskAuditLog>,
    counters: Counters,
    in_flight: Mutex<HashMap<u64, InFlight>>,
    canceling: AtomicBool,
}

impl Consumer {
    pub fn new(queue: Arc<dyn WorkQueue>) -> Self {
        Self {
            queue,
            routes: Vec::new(),
            drain_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            retry: RetryPolicy::default(),
            audit: Arc::new(TaskAuditLog::default()),
            counters: Counters::default(),
            in_flight: Mutex::new(HashMap::new()),
            canceling: AtomicBool::new(false),
        }
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_audit(mut self, audit: Arc<TaskAuditLog>) -> Self {
        self.audit = audit;
        self
    }

    /// Serve `topic` with `concurrency` threads, each message bounded by `timeout`
    pub fn add_handler(
        &mut self,
        topic: impl Into<String>,
        handler: Arc<dyn Handler>,
        concurrency: usize,
        timeout: Duration,
    ) -> &mut Self {
        let topic = topic.into();
        if concurrency == 0 {
            warn!("Concurrency 0 requested for {}, using 1", topic);
        }
        self.routes.push(Route {
            topic,
            handler,
            concurrency: concurrency.max(1),
            timeout,
        });
        self
    }

    pub fn counts(&self) -> SettlementCounts {
        SettlementCounts {
            acked: self.counters.acked.load(Ordering::SeqCst),
            requeued: self.counters.requeued.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            discarded: self.counters.discarded.load(Ordering::SeqCst),
            unsettled: self.counters.unsettled.load(Ordering::SeqCst),
        }
    }

    /// Run one delivery through its topic's handler and settle it
    pub fn handle_message(&self, message: Message) -> Result<Settlement> {
        let route = self
            .routes
            .iter()
            .find(|r| r.topic == message.topic)
            .ok_or_else(|| UpletError::Config(format!("no handler for topic {}", message.topic)))?;
        self.process(route, message)
    }

    /// Consume every registered topic until `stop` fires (or its sender is dropped).
    ///
    /// On stop, pulling ends at once, in-flight handlers get `drain_timeout`
    /// to finish, the rest are canceled, and every thread is joined.
    pub fn consume_until_killed(&self, stop: &Receiver<()>) -> Result<()> {
        if self.routes.is_empty() {
            return Err(UpletError::Config("no handlers registered".to_string()));
        }
        self.canceling.store(false, Ordering::SeqCst);
        let shutdown = AtomicBool::new(false);
        let active = AtomicUsize::new(0);

        thread::scope(|scope| {
            for route in &self.routes {
                for n in 0..route.concurrency {
                    let (shutdown, active) = (&shutdown, &active);
                    let spawned = thread::Builder::new()
                        .name(format!("{}-{}", route.topic, n))
                        .spawn_scoped(scope, move || self.worker_loop(route, shutdown, active));
                    if let Err(e) = spawned {
                        shutdown.store(true, Ordering::SeqCst);
                        return Err(UpletError::Process(format!(
                            "Failed to spawn handler thread for {}: {}",
                            route.topic, e
                        )));
                    }
                }
                info!("Consuming {} with {} thread(s)", route.topic, route.concurrency);
            }

            loop {
                match stop.recv_timeout(WATCH_INTERVAL) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => self.cancel_overdue(),
                }
            }

            shutdown.store(true, Ordering::SeqCst);
            info!(
                "Stop received, draining {} in-flight message(s)",
                active.load(Ordering::SeqCst)
            );
            let drain_started = Instant::now();
            while active.load(Ordering::SeqCst) > 0 && drain_started.elapsed() < self.drain_timeout {
                self.cancel_overdue();
                thread::sleep(Duration::from_millis(10));
            }
            if active.load(Ordering::SeqCst) > 0 {
                self.cancel_all();
            }
            Ok(())
        })?;

        info!("Consumer stopped: {:?}", self.counts());
        Ok(())
    }

    fn worker_loop(&self, route: &Route, shutdown: &AtomicBool, active: &AtomicUsize) {
        while !shutdown.load(Ordering::SeqCst) {
            let message = match self.queue.pull(&route.topic, self.poll_interval) {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Pull from {} failed: {}", route.topic, e);
                    thread::sleep(self.poll_interval);
                    continue;
                }
            };
            if !self.run_unless_stopped(route, message, shutdown, active) {
                break;
            }
        }
        debug!("Handler thread for {} exiting", route.topic);
    }

    /// Process a pulled delivery, or hand it back unstarted when shutdown
    /// began during the pull. Returns false in the latter case.
    fn run_unless_stopped(
        &self,
        route: &Route,
        message: Message,
        shutdown: &AtomicBool,
        active: &AtomicUsize,
    ) -> bool {
        if shutdown.load(Ordering::SeqCst) {
            match self.queue.release(&message) {
                Ok(()) => debug!("Returned unstarted message {} on {}", message.id, route.topic),
                Err(e) => warn!("Failed to return message {} at shutdown: {}", message.id, e),
            }
            return false;
        }

        active.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.process(route, message) {
            error!("Settlement on {} failed: {}", route.topic, e);
        }
        active.fetch_sub(1, Ordering::SeqCst);
        true
    }

    fn process(&self, route: &Route, message: Message) -> Result<Settlement> {
        let ctx = HandlerContext::new(route.timeout);
        self.track(&message, &ctx);
        self.audit.record(self.event(
            TaskEventType::Received,
            &message,
            format!("{} byte(s)", message.body.len()),
        ));
        let outcome = route.handler.handle(&message, &ctx);
        lock(&self.in_flight).remove(&message.id);

        let settled = self.settle(route, &message, outcome);
        let counter = match &settled {
            Ok(Settlement::Acked) => &self.counters.acked,
            Ok(Settlement::Requeued) => &self.counters.requeued,
            Ok(Settlement::Failed) => &self.counters.failed,
            Ok(Settlement::Discarded) => &self.counters.discarded,
            Err(e) => {
                self.audit.record(
                    self.event(TaskEventType::ReportFailed, &message, e.to_string()),
                );
                &self.counters.unsettled
            }
        };
        counter.fetch_add(1, Ordering::SeqCst);
        settled
    }

    fn settle(&self, route: &Route, message: &Message, outcome: Result<()>) -> Result<Settlement> {
        let err = match outcome {
            Ok(()) => {
                self.queue.ack(message)?;
                return Ok(Settlement::Acked);
            }
            Err(e) => e,
        };

        match err.disposition() {
            Disposition::Requeue => match self.queue.requeue(message)? {
                RequeueOutcome::Requeued => {
                    self.audit
                        .record(self.event(TaskEventType::Requeued, message, err.to_string()));
                    Ok(Settlement::Requeued)
                }
                RequeueOutcome::Exhausted => {
                    if let Err(report_err) = self.report_failure(route, message) {
                        // the queue already dropped the delivery
                        self.report_outstanding(message, &report_err);
                        return Err(report_err);
                    }
                    self.audit.record(self.event(
                        TaskEventType::Dropped,
                        message,
                        format!("redelivery budget spent, reported failed: {}", err),
                    ));
                    Ok(Settlement::Failed)
                }
            },
            Disposition::Fail => {
                if let Err(report_err) = self.report_failure(route, message) {
                    // redeliver so the report is attempted again
                    match self.queue.requeue(message) {
                        Ok(RequeueOutcome::Requeued) => warn!(
                            "Message {} requeued, its failure report is still owed",
                            message.id
                        ),
                        Ok(RequeueOutcome::Exhausted) => {
                            self.report_outstanding(message, &report_err)
                        }
                        Err(e) => {
                            error!("Failed to return message {}: {}", message.id, e);
                            self.report_outstanding(message, &report_err);
                        }
                    }
                    return Err(report_err);
                }
                self.queue.ack(message)?;
                self.audit.record(self.event(
                    TaskEventType::Dropped,
                    message,
                    format!("reported failed: {}", err),
                ));
                Ok(Settlement::Failed)
            }
            Disposition::Discard => {
                self.queue.ack(message)?;
                self.audit.record(self.event(
                    TaskEventType::Dropped,
                    message,
                    format!("discarded: {}", err),
                ));
                Ok(Settlement::Discarded)
            }
        }
    }

    /// The message is gone from the queue but the ledger never learned the task failed
    fn report_outstanding(&self, message: &Message, report_err: &UpletError) {
        error!(
            "Message {} on {} dropped with its failure report outstanding: {}",
            message.id, message.topic, report_err
        );
        self.audit.record(
            self.event(
                TaskEventType::Dropped,
                message,
                format!("failure report outstanding: {}", report_err),
            )
            .with_severity(Severity::Critical),
        );
    }

    fn report_failure(&self, route: &Route, message: &Message) -> Result<()> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match route.handler.report_failure(message) {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= attempts => {
                    return Err(UpletError::Transient(format!(
                        "failure report for message {} gave up after {} attempts: {}",
                        message.id, attempts, e
                    )))
                }
                Err(e) => {
                    let delay = self.retry.delay(attempt - 1);
                    warn!(
                        "Failure report for message {} failed ({}), retrying in {:?}",
                        message.id, e, delay
                    );
                    thread::sleep(delay);
                }
            }
        }
    }

    fn track(&self, message: &Message, ctx: &HandlerContext) {
        if self.canceling.load(Ordering::SeqCst) {
            ctx.cancel.store(true, Ordering::SeqCst);
        }
        lock(&self.in_flight).insert(
            message.id,
            InFlight {
                topic: message.topic.clone(),
                deadline: ctx.deadline,
                cancel: Arc::clone(&ctx.cancel),
            },
        );
    }

    fn cancel_overdue(&self) {
        let now = Instant::now();
        for (id, entry) in lock(&self.in_flight).iter() {
            if entry.deadline <= now && !entry.cancel.swap(true, Ordering::SeqCst) {
                warn!("Message {} on {} exceeded its deadline, canceling", id, entry.topic);
            }
        }
    }

    fn cancel_all(&self) {
        self.canceling.store(true, Ordering::SeqCst);
        let in_flight = lock(&self.in_flight);
        warn!(
            "Drain window of {:?} elapsed, canceling {} in-flight message(s)",
            self.drain_timeout,
            in_flight.len()
        );
        for entry in in_flight.values() {
            entry.cancel.store(true, Ordering::SeqCst);
        }
    }

    fn event(&self, event_type: TaskEventType, message: &Message, details: String) -> TaskEvent {
        TaskEvent::new(
            event_type,
            format!("message {} attempt {}: {}", message.id, message.attempt, details),
        )
        .with_topic(message.topic.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::config::types::SandboxFailureKind;

    type Outcome = Box<dyn Fn(&HandlerContext) -> Result<()> + Send + Sync>;

    struct ScriptedHandler {
        outcome: Outcome,
        reachable: bool,
        handled: AtomicUsize,
        reports: AtomicUsize,
    }

    impl ScriptedHandler {
        fn new(outcome: impl Fn(&HandlerContext) -> Result<()> + Send + Sync + 'static) -> Arc<Self> {
            Self::with_ledger(true, outcome)
        }

        fn with_ledger(
            reachable: bool,
            outcome: impl Fn(&HandlerContext) -> Result<()> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                outcome: Box::new(outcome),
                reachable,
                handled: AtomicUsize::new(0),
                reports: AtomicUsize::new(0),
            })
        }
    }

    impl Handler for ScriptedHandler {
        fn handle(&self, _message: &Message, ctx: &HandlerContext) -> Result<()> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            (self.outcome)(ctx)
        }

        fn report_failure(&self, _message: &Message) -> Result<()> {
            self.reports.fetch_add(1, Ordering::SeqCst);
            if self.reachable {
                Ok(())
            } else {
                Err(UpletError::Transient("ledger unreachable".to_string()))
            }
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    fn consumer(broker: &Arc<MemoryBroker>, handler: &Arc<ScriptedHandler>) -> Consumer {
        let mut consumer = Consumer::new(broker.clone())
            .with_retry_policy(fast_retry())
            .with_poll_interval(Duration::from_millis(10));
        consumer.add_handler("learn", handler.clone(), 1, Duration::from_secs(5));
        consumer
    }

    fn next(broker: &MemoryBroker) -> Message {
        broker.pull("learn", Duration::from_millis(50)).unwrap().unwrap()
    }

    #[test]
    fn success_is_acked() {
        let broker = Arc::new(MemoryBroker::new(3));
        let handler = ScriptedHandler::new(|_| Ok(()));
        let consumer = consumer(&broker, &handler);
        broker.publish("learn", b"{}".to_vec()).unwrap();

        let audit = Arc::new(TaskAuditLog::in_memory());
        let consumer = consumer.with_audit(audit.clone());

        assert_eq!(consumer.handle_message(next(&broker)).unwrap(), Settlement::Acked);
        assert_eq!(broker.stats().acked, 1);
        assert_eq!(audit.count(TaskEventType::Received), 1);
        assert_eq!(handler.reports.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn retryable_errors_requeue_until_the_budget_is_spent() {
        let broker = Arc::new(MemoryBroker::new(2));
        let handler = ScriptedHandler::new(|_| Err(UpletError::sandbox(SandboxFailureKind::Timeout, "deadline")));
        let consumer = consumer(&broker, &handler);
        broker.publish("learn", b"{}".to_vec()).unwrap();

        assert_eq!(consumer.handle_message(next(&broker)).unwrap(), Settlement::Requeued);
        assert_eq!(consumer.handle_message(next(&broker)).unwrap(), Settlement::Failed);
        assert_eq!(handler.reports.load(Ordering::SeqCst), 1);
        assert_eq!(broker.pending("learn"), 0);
    }

    #[test]
    fn fatal_errors_report_failed_without_requeue() {
        let broker = Arc::new(MemoryBroker::new(5));
        let handler =
            ScriptedHandler::new(|_| Err(UpletError::sandbox(SandboxFailureKind::ExecutionFailure, "exit 1")));
        let consumer = consumer(&broker, &handler);
        broker.publish("learn", b"{}".to_vec()).unwrap();

        assert_eq!(consumer.handle_message(next(&broker)).unwrap(), Settlement::Failed);
        assert_eq!(handler.reports.load(Ordering::SeqCst), 1);
        assert_eq!(broker.stats().requeued, 0);
        assert_eq!(broker.in_flight(), 0);
    }

    #[test]
    fn validation_errors_are_dropped_silently() {
        let broker = Arc::new(MemoryBroker::new(5));
        let handler = ScriptedHandler::new(|_| Err(UpletError::Validation("id field is required".into())));
        let consumer = consumer(&broker, &handler);
        broker.publish("learn", b"{}".to_vec()).unwrap();

        assert_eq!(consumer.handle_message(next(&broker)).unwrap(), Settlement::Discarded);
        assert_eq!(handler.reports.load(Ordering::SeqCst), 0);
        assert_eq!(consumer.counts().discarded, 1);
    }

    #[test]
    fn unreachable_ledger_surfaces_a_transient_error_after_bounded_retries() {
        let broker = Arc::new(MemoryBroker::new(5));
        let handler =
            ScriptedHandler::with_ledger(false, |_| Err(UpletError::FatalTask("bad input".into())));
        let consumer = consumer(&broker, &handler);
        broker.publish("learn", b"{}".to_vec()).unwrap();

        let err = consumer.handle_message(next(&broker)).unwrap_err();
        assert!(matches!(err, UpletError::Transient(_)));
        assert_eq!(handler.reports.load(Ordering::SeqCst), 3);
        assert_eq!(consumer.counts().unsettled, 1);
        // kept for another report attempt
        assert_eq!(broker.pending("learn"), 1);
    }

    #[test]
    fn lost_failure_report_on_the_last_delivery_is_surfaced() {
        let broker = Arc::new(MemoryBroker::new(1));
        let handler =
            ScriptedHandler::with_ledger(false, |_| Err(UpletError::FatalTask("bad input".into())));
        let audit = Arc::new(TaskAuditLog::in_memory());
        let consumer = consumer(&broker, &handler).with_audit(audit.clone());
        broker.publish("learn", b"{}".to_vec()).unwrap();

        let err = consumer.handle_message(next(&broker)).unwrap_err();
        assert!(matches!(err, UpletError::Transient(_)));
        assert_eq!(broker.stats().exhausted, 1);
        assert_eq!(broker.pending("learn"), 0);

        let dropped: Vec<TaskEvent> = audit
            .events()
            .into_iter()
            .filter(|e| e.event_type == TaskEventType::Dropped)
            .collect();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].severity, Severity::Critical);
        assert!(dropped[0].details.contains("failure report outstanding"));
    }

    #[test]
    fn spent_budget_with_unreachable_ledger_is_surfaced() {
        let broker = Arc::new(MemoryBroker::new(1));
        let handler = ScriptedHandler::with_ledger(false, |_| {
            Err(UpletError::sandbox(SandboxFailureKind::Timeout, "deadline"))
        });
        let audit = Arc::new(TaskAuditLog::in_memory());
        let consumer = consumer(&broker, &handler).with_audit(audit.clone());
        broker.publish("learn", b"{}".to_vec()).unwrap();

        assert!(consumer.handle_message(next(&broker)).is_err());
        assert_eq!(handler.reports.load(Ordering::SeqCst), 3);
        assert_eq!(consumer.counts().unsettled, 1);
        assert_eq!(broker.pending("learn"), 0);
        assert!(audit.events().iter().any(|e| e.event_type == TaskEventType::Dropped
            && e.details.contains("failure report outstanding")));
    }

    #[test]
    fn message_pulled_after_stop_is_returned_unstarted() {
        let broker = Arc::new(MemoryBroker::new(1));
        let handler = ScriptedHandler::new(|_| Ok(()));
        let consumer = consumer(&broker, &handler);
        broker.publish("learn", b"{}".to_vec()).unwrap();

        let shutdown = AtomicBool::new(true);
        let active = AtomicUsize::new(0);
        let ran =
            consumer.run_unless_stopped(&consumer.routes[0], next(&broker), &shutdown, &active);

        assert!(!ran);
        assert_eq!(handler.handled.load(Ordering::SeqCst), 0);
        assert_eq!(active.load(Ordering::SeqCst), 0);
        assert_eq!(broker.stats().released, 1);

        // the single allowed delivery is still available
        let again = next(&broker);
        assert_eq!(again.attempt, 1);
        assert_eq!(consumer.handle_message(again).unwrap(), Settlement::Acked);
    }

    #[test]
    fn backoff_grows_and_stays_bounded() {
        let policy = RetryPolicy {
            attempts: 10,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
        };
        assert!(policy.delay(0) >= Duration::from_millis(10));
        assert!(policy.delay(0) <= Duration::from_millis(15));
        assert!(policy.delay(2) >= Duration::from_millis(40));
        assert!(policy.delay(30) <= Duration::from_millis(60));
    }

    #[test]
    fn shutdown_drains_then_cancels_stuck_handlers() {
        let broker = Arc::new(MemoryBroker::new(5));
        let (started_tx, started_rx) = crossbeam_channel::bounded(4);
        let handler = ScriptedHandler::new(move |ctx| {
            let _ = started_tx.send(());
            while !ctx.is_canceled() {
                thread::sleep(Duration::from_millis(5));
            }
            Err(UpletError::sandbox(SandboxFailureKind::Timeout, "run canceled"))
        });
        let consumer = consumer(&broker, &handler).with_drain_timeout(Duration::from_millis(100));
        broker.publish("learn", b"{}".to_vec()).unwrap();

        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        thread::scope(|scope| {
            let running = scope.spawn(|| consumer.consume_until_killed(&stop_rx));
            started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
            stop_tx.send(()).unwrap();
            running.join().unwrap().unwrap();
        });

        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
        assert_eq!(consumer.counts().requeued, 1);
        assert_eq!(broker.pending("learn"), 1);
    }

    #[test]
    fn consuming_without_handlers_is_a_config_error() {
        let broker = Arc::new(MemoryBroker::default());
        let (_stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        assert!(matches!(
            Consumer::new(broker).consume_until_killed(&stop_rx),
            Err(UpletError::Config(_))
        ));
    }
}
