//! In-memory transactional broker for tests/dev.
//!
//! - No IO
//! - Named FIFO queues shared by every connection of the same broker
//! - Sessions stage sends until commit; rollback redelivers consumed messages
//!   at the head of their queue
//! - A message rolled back more than `max_redeliveries` times is moved to
//!   [`DEAD_LETTER_QUEUE`]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::warn;
use uuid::Uuid;

use crate::broker::{
    BrokerConnection, BrokerConnector, BrokerError, BrokerMessage, Destination, TransactedSession,
};
use crate::selector::MediaTypeFilter;

/// Queue receiving messages that exceeded the redelivery limit.
pub const DEAD_LETTER_QUEUE: &str = "DLQ";

/// Redeliveries allowed before dead-lettering.
pub const DEFAULT_MAX_REDELIVERIES: u32 = 6;

#[derive(Debug, Default)]
struct Queues {
    by_name: HashMap<String, VecDeque<BrokerMessage>>,
}

impl Queues {
    fn queue(&mut self, name: &str) -> &mut VecDeque<BrokerMessage> {
        self.by_name.entry(name.to_string()).or_default()
    }

    fn take_matching(&mut self, name: &str, filter: &MediaTypeFilter) -> Option<BrokerMessage> {
        let queue = self.by_name.get_mut(name)?;
        let idx = queue.iter().position(|m| filter.matches(m))?;
        queue.remove(idx)
    }
}

#[derive(Debug)]
struct BrokerState {
    queues: Mutex<Queues>,
    changed: Condvar,
    max_redeliveries: u32,
    failing_sends: AtomicUsize,
}

impl BrokerState {
    fn lock(&self) -> Result<MutexGuard<'_, Queues>, BrokerError> {
        self.queues
            .lock()
            .map_err(|_| BrokerError::Transport("broker state poisoned".to_string()))
    }
}

/// Process-local broker.
///
/// Cloning shares the same queues.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_max_redeliveries(DEFAULT_MAX_REDELIVERIES)
    }

    pub fn with_max_redeliveries(max_redeliveries: u32) -> Self {
        Self {
            state: Arc::new(BrokerState {
                queues: Mutex::new(Queues::default()),
                changed: Condvar::new(),
                max_redeliveries,
                failing_sends: AtomicUsize::new(0),
            }),
        }
    }

    /// Enqueue a message directly, outside any transaction.
    pub fn publish(&self, queue: &str, message: BrokerMessage) -> Result<(), BrokerError> {
        self.state.lock()?.queue(queue).push_back(message);
        self.state.changed.notify_all();
        Ok(())
    }

    /// Remove and return every message currently in `queue`.
    pub fn drain(&self, queue: &str) -> Vec<BrokerMessage> {
        match self.state.lock() {
            Ok(mut queues) => queues.queue(queue).drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.state
            .lock()
            .map(|q| q.by_name.get(queue).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }

    /// Take one message from `queue`, waiting up to `timeout`.
    pub fn take(&self, queue: &str, timeout: Duration) -> Option<BrokerMessage> {
        let deadline = Instant::now() + timeout;
        let mut queues = self.state.lock().ok()?;
        loop {
            if let Some(msg) = queues.queue(queue).pop_front() {
                return Some(msg);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            queues = self
                .state
                .changed
                .wait_timeout(queues, deadline - now)
                .ok()?
                .0;
        }
    }

    /// Make the next `count` session sends fail with a transport error.
    pub fn fail_next_sends(&self, count: usize) {
        self.state.failing_sends.store(count, Ordering::SeqCst);
    }
}

impl BrokerConnector for InMemoryBroker {
    type Connection = InMemoryConnection;

    fn connect(&self) -> Result<InMemoryConnection, BrokerError> {
        Ok(InMemoryConnection {
            state: self.state.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

#[derive(Debug)]
pub struct InMemoryConnection {
    state: Arc<BrokerState>,
    closed: Arc<AtomicBool>,
}

impl BrokerConnection for InMemoryConnection {
    type Session = InMemorySession;

    fn open_session(
        &self,
        request_queue: &str,
        filter: &MediaTypeFilter,
    ) -> Result<InMemorySession, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        Ok(InMemorySession {
            state: self.state.clone(),
            closed: self.closed.clone(),
            request_queue: request_queue.to_string(),
            filter: filter.clone(),
            consumed: Vec::new(),
            staged: Vec::new(),
        })
    }

    fn request_reply(
        &self,
        queue: &str,
        message: BrokerMessage,
        timeout: Option<Duration>,
    ) -> Result<BrokerMessage, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        let reply_queue = Destination::queue(format!("temp-queue://{}", Uuid::now_v7()));
        let message = message.with_reply_to(reply_queue.clone());

        let mut queues = self.state.lock()?;
        queues.queue(queue).push_back(message);
        self.state.changed.notify_all();

        let deadline = timeout.map(|t| Instant::now() + t);
        let result = loop {
            if self.is_closed() {
                break Err(BrokerError::Closed);
            }
            if let Some(reply) = queues.queue(reply_queue.name()).pop_front() {
                break Ok(reply);
            }
            queues = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break Err(BrokerError::Timeout(reply_queue.clone()));
                    }
                    self.state
                        .changed
                        .wait_timeout(queues, deadline - now)
                        .map_err(|_| BrokerError::Transport("broker state poisoned".to_string()))?
                        .0
                }
                None => self
                    .state
                    .changed
                    .wait(queues)
                    .map_err(|_| BrokerError::Transport("broker state poisoned".to_string()))?,
            };
        };
        queues.by_name.remove(reply_queue.name());
        result
    }

    fn close(&self) {
        // Flip the flag while holding the lock so a receiver cannot miss the
        // wakeup between its check and its wait.
        let guard = self.state.queues.lock();
        self.closed.store(true, Ordering::SeqCst);
        drop(guard);
        self.state.changed.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct InMemorySession {
    state: Arc<BrokerState>,
    closed: Arc<AtomicBool>,
    request_queue: String,
    filter: MediaTypeFilter,
    consumed: Vec<BrokerMessage>,
    staged: Vec<(Destination, BrokerMessage)>,
}

impl TransactedSession for InMemorySession {
    fn receive(&mut self) -> Result<Option<BrokerMessage>, BrokerError> {
        let mut queues = self.state.lock()?;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            if let Some(msg) = queues.take_matching(&self.request_queue, &self.filter) {
                self.consumed.push(msg.clone());
                return Ok(Some(msg));
            }
            queues = self
                .state
                .changed
                .wait(queues)
                .map_err(|_| BrokerError::Transport("broker state poisoned".to_string()))?;
        }
    }

    fn send(
        &mut self,
        destination: &Destination,
        message: BrokerMessage,
    ) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let injected = self
            .state
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BrokerError::Transport(format!(
                "send to {destination} rejected"
            )));
        }
        self.staged.push((destination.clone(), message));
        Ok(())
    }

    fn commit(&mut self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let mut queues = self.state.lock()?;
        for (destination, message) in self.staged.drain(..) {
            queues.queue(destination.name()).push_back(message);
        }
        self.consumed.clear();
        drop(queues);
        self.state.changed.notify_all();
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), BrokerError> {
        self.staged.clear();
        let mut queues = self.state.lock()?;
        // Reverse so the oldest consumed message ends up first in line.
        for mut message in self.consumed.drain(..).rev() {
            message.redelivery_count += 1;
            if message.redelivery_count > self.state.max_redeliveries {
                warn!(
                    message_id = %message.id,
                    redelivery_count = message.redelivery_count,
                    "message sent to dead-letter queue"
                );
                queues.queue(DEAD_LETTER_QUEUE).push_back(message);
            } else {
                queues.queue(&self.request_queue).push_front(message);
            }
        }
        drop(queues);
        self.state.changed.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchexec_core::DataType;
    use std::thread;

    fn session(broker: &InMemoryBroker, filter: MediaTypeFilter) -> InMemorySession {
        broker
            .connect()
            .unwrap()
            .open_session("requests", &filter)
            .unwrap()
    }

    #[test]
    fn commit_publishes_staged_sends() {
        let broker = InMemoryBroker::new();
        broker.publish("requests", BrokerMessage::bytes(vec![1])).unwrap();
        let mut s = session(&broker, MediaTypeFilter::any());

        s.receive().unwrap().unwrap();
        s.send(&Destination::queue("replies"), BrokerMessage::bytes(vec![2]))
            .unwrap();
        assert_eq!(broker.queue_len("replies"), 0);

        s.commit().unwrap();
        assert_eq!(broker.queue_len("replies"), 1);
        assert_eq!(broker.queue_len("requests"), 0);
    }

    #[test]
    fn rollback_redelivers_and_discards_sends() {
        let broker = InMemoryBroker::new();
        broker.publish("requests", BrokerMessage::bytes(vec![1])).unwrap();
        let mut s = session(&broker, MediaTypeFilter::any());

        let first = s.receive().unwrap().unwrap();
        s.send(&Destination::queue("replies"), BrokerMessage::bytes(vec![2]))
            .unwrap();
        s.rollback().unwrap();

        assert_eq!(broker.queue_len("replies"), 0);
        let again = s.receive().unwrap().unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.redelivery_count, 1);
    }

    #[test]
    fn repeated_rollback_dead_letters() {
        let broker = InMemoryBroker::with_max_redeliveries(2);
        broker.publish("requests", BrokerMessage::bytes(vec![1])).unwrap();
        let mut s = session(&broker, MediaTypeFilter::any());

        for _ in 0..3 {
            s.receive().unwrap().unwrap();
            s.rollback().unwrap();
        }
        assert_eq!(broker.queue_len("requests"), 0);
        assert_eq!(broker.queue_len(DEAD_LETTER_QUEUE), 1);
    }

    #[test]
    fn filter_skips_other_media_types() {
        let broker = InMemoryBroker::new();
        broker
            .publish(
                "requests",
                BrokerMessage::bytes(vec![1]).with_string_property("MediaType", "IMAGE"),
            )
            .unwrap();
        broker
            .publish(
                "requests",
                BrokerMessage::bytes(vec![2]).with_string_property("MediaType", "AUDIO"),
            )
            .unwrap();
        let mut s = session(&broker, MediaTypeFilter::only([DataType::Audio]));

        let msg = s.receive().unwrap().unwrap();
        assert_eq!(msg.string_property("MediaType").as_deref(), Some("AUDIO"));
        assert_eq!(broker.queue_len("requests"), 1);
    }

    #[test]
    fn close_wakes_blocked_receive() {
        let broker = InMemoryBroker::new();
        let conn = Arc::new(broker.connect().unwrap());
        let mut s = conn.open_session("requests", &MediaTypeFilter::any()).unwrap();

        let closer = conn.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            closer.close();
        });

        assert!(s.receive().unwrap().is_none());
        handle.join().unwrap();
        assert!(matches!(
            s.send(&Destination::queue("x"), BrokerMessage::text("x")),
            Err(BrokerError::Closed)
        ));
    }

    #[test]
    fn injected_send_failure_is_one_shot() {
        let broker = InMemoryBroker::new();
        let mut s = session(&broker, MediaTypeFilter::any());
        broker.fail_next_sends(1);

        let dest = Destination::queue("replies");
        assert!(s.send(&dest, BrokerMessage::text("a")).is_err());
        assert!(s.send(&dest, BrokerMessage::text("b")).is_ok());
    }

    #[test]
    fn request_reply_waits_for_responder() {
        let broker = InMemoryBroker::new();
        let conn = broker.connect().unwrap();

        let responder = broker.clone();
        let handle = thread::spawn(move || {
            let request = responder
                .take("registration", Duration::from_secs(5))
                .unwrap();
            let reply_to = request.reply_to.unwrap();
            responder
                .publish(reply_to.name(), BrokerMessage::text("ok"))
                .unwrap();
        });

        let reply = conn
            .request_reply(
                "registration",
                BrokerMessage::text("hello"),
                Some(Duration::from_secs(5)),
            )
            .unwrap();
        handle.join().unwrap();
        assert_eq!(reply.body_text(), Some("ok"));
    }

    #[test]
    fn request_reply_times_out() {
        let broker = InMemoryBroker::new();
        let conn = broker.connect().unwrap();
        let err = conn
            .request_reply(
                "registration",
                BrokerMessage::text("hello"),
                Some(Duration::from_millis(20)),
            )
            .unwrap_err();
        assert!(matches!(err, BrokerError::Timeout(_)));
    }
}
