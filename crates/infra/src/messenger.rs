//! Transactional broker session used by the executor.
//!
//! One consumer on the request queue, one producer for responses, both on a
//! single transacted session. Receipt and response form one unit of work:
//! `send_response` commits, `rollback` returns the request for redelivery.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use batchexec_messaging::{
    BrokerConnection, BrokerConnector, BrokerError, BrokerMessage, Destination, MediaTypeFilter,
    TransactedSession,
};

use crate::shutdown::{QuitReceived, ShutdownCoordinator};
use crate::signal::ExitSignalBlocker;

#[derive(Debug, thiserror::Error)]
pub enum MessengerError {
    #[error("failed to initialize broker connection: {0}")]
    ConnectionInitialization(#[source] BrokerError),

    /// Shutdown was requested while (or before) waiting on the broker.
    #[error("quit requested")]
    Quit,

    #[error("broker connection closed unexpectedly")]
    ConnectionClosed,

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("failed to mask termination signals: {0}")]
    SignalMask(#[from] io::Error),
}

impl From<QuitReceived> for MessengerError {
    fn from(_: QuitReceived) -> Self {
        MessengerError::Quit
    }
}

pub struct Messenger<C: BrokerConnection> {
    connection: Arc<C>,
    session: C::Session,
    shutdown: ShutdownCoordinator,
}

impl<C: BrokerConnection + 'static> Messenger<C> {
    /// Open the connection and the transacted session as one step.
    ///
    /// Registers a shutdown action that closes the connection (waking a
    /// blocked receive) as long as this messenger is still alive.
    pub fn connect<K>(
        connector: &K,
        request_queue: &str,
        filter: &MediaTypeFilter,
        shutdown: &ShutdownCoordinator,
    ) -> Result<Self, MessengerError>
    where
        K: BrokerConnector<Connection = C>,
    {
        let (connection, session) = connector
            .connect()
            .and_then(|connection| {
                let session = connection.open_session(request_queue, filter)?;
                Ok((connection, session))
            })
            .map_err(MessengerError::ConnectionInitialization)?;

        let connection = Arc::new(connection);
        let weak = Arc::downgrade(&connection);
        shutdown.add_shutdown_action(move || {
            if let Some(connection) = weak.upgrade() {
                connection.close();
            }
        });

        info!(
            queue = %request_queue,
            selector = filter.selector().as_deref().unwrap_or("<none>"),
            "connected to broker"
        );

        Ok(Self {
            connection,
            session,
            shutdown: shutdown.clone(),
        })
    }
}

impl<C: BrokerConnection> Messenger<C> {
    /// Block until a bytes message arrives.
    ///
    /// Termination signals stay masked on this thread while waiting so they
    /// reach the shutdown waiter, which closes the connection. Fails with
    /// [`MessengerError::Quit`] as soon as shutdown has been requested.
    pub fn receive_message(&mut self) -> Result<BrokerMessage, MessengerError> {
        loop {
            self.shutdown.check_quit()?;
            let received = {
                let _blocker = ExitSignalBlocker::new()?;
                self.session.receive()
            };
            self.shutdown.check_quit()?;

            match received? {
                None => return Err(MessengerError::ConnectionClosed),
                Some(message) if message.body_bytes().is_some() => {
                    debug!(message_id = %message.id, "received request");
                    return Ok(message);
                }
                Some(message) => {
                    warn!(
                        message_id = %message.id,
                        kind = message.kind(),
                        "expected a bytes message; rolling back"
                    );
                    self.session.rollback()?;
                }
            }
        }
    }

    /// Send `message` and commit the session.
    #[instrument(skip(self, message), fields(destination = %destination, message_id = %message.id), err)]
    pub fn send_response(
        &mut self,
        destination: &Destination,
        mut message: BrokerMessage,
        priority: u8,
    ) -> Result<(), MessengerError> {
        message.priority = priority;
        let result = self
            .session
            .send(destination, message)
            .and_then(|()| self.session.commit());
        if let Err(e) = result {
            self.shutdown.check_quit()?;
            return Err(e.into());
        }
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<(), MessengerError> {
        if let Err(e) = self.session.rollback() {
            self.shutdown.check_quit()?;
            return Err(e.into());
        }
        Ok(())
    }

    /// Out-of-transaction request/reply (component registration).
    pub fn request_reply(
        &self,
        queue: &str,
        message: BrokerMessage,
        timeout: Option<Duration>,
    ) -> Result<BrokerMessage, MessengerError> {
        let reply = self.connection.request_reply(queue, message, timeout);
        self.shutdown.check_quit()?;
        Ok(reply?)
    }
}

impl<C: BrokerConnection> Drop for Messenger<C> {
    fn drop(&mut self) {
        self.connection.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::ShutdownSignal;
    use batchexec_messaging::{InMemoryBroker, InMemoryConnection};
    use std::thread;

    fn messenger(
        broker: &InMemoryBroker,
        shutdown: &ShutdownCoordinator,
    ) -> Messenger<InMemoryConnection> {
        Messenger::connect(broker, "requests", &MediaTypeFilter::any(), shutdown).unwrap()
    }

    #[test]
    fn text_messages_are_rolled_back_and_skipped() {
        let broker = InMemoryBroker::with_max_redeliveries(0);
        broker.publish("requests", BrokerMessage::text("nope")).unwrap();
        broker.publish("requests", BrokerMessage::bytes(vec![1, 2])).unwrap();
        let shutdown = ShutdownCoordinator::new();
        let mut m = messenger(&broker, &shutdown);

        let msg = m.receive_message().unwrap();
        assert_eq!(msg.body_bytes().map(|b| b.to_vec()), Some(vec![1, 2]));
        assert_eq!(broker.queue_len("DLQ"), 1);
    }

    #[test]
    fn receive_fails_immediately_after_shutdown() {
        let broker = InMemoryBroker::new();
        broker.publish("requests", BrokerMessage::bytes(vec![1])).unwrap();
        let shutdown = ShutdownCoordinator::new();
        let mut m = messenger(&broker, &shutdown);

        shutdown.request_shutdown(ShutdownSignal::Internal);
        assert!(matches!(m.receive_message(), Err(MessengerError::Quit)));
        assert_eq!(broker.queue_len("requests"), 1);
    }

    #[test]
    fn shutdown_wakes_blocked_receive() {
        let broker = InMemoryBroker::new();
        let shutdown = ShutdownCoordinator::new();
        let mut m = messenger(&broker, &shutdown);

        let trigger = shutdown.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            trigger.request_shutdown(ShutdownSignal::Terminate);
        });

        assert!(matches!(m.receive_message(), Err(MessengerError::Quit)));
        handle.join().unwrap();
    }

    #[test]
    fn connect_after_shutdown_closes_connection() {
        let broker = InMemoryBroker::new();
        let shutdown = ShutdownCoordinator::new();
        shutdown.request_shutdown(ShutdownSignal::Internal);

        let m = messenger(&broker, &shutdown);
        assert!(m.connection.is_closed());
    }

    #[test]
    fn dropped_messenger_is_not_kept_alive_by_shutdown_hook() {
        let broker = InMemoryBroker::new();
        let shutdown = ShutdownCoordinator::new();
        let m = messenger(&broker, &shutdown);
        let weak = Arc::downgrade(&m.connection);
        drop(m);

        assert!(weak.upgrade().is_none());
        shutdown.request_shutdown(ShutdownSignal::Internal);
    }

    #[test]
    fn send_response_commits() {
        let broker = InMemoryBroker::new();
        broker.publish("requests", BrokerMessage::bytes(vec![1])).unwrap();
        let shutdown = ShutdownCoordinator::new();
        let mut m = messenger(&broker, &shutdown);

        m.receive_message().unwrap();
        m.send_response(&Destination::queue("replies"), BrokerMessage::bytes(vec![9]), 7)
            .unwrap();

        let replies = broker.drain("replies");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].priority, 7);
        assert_eq!(broker.queue_len("requests"), 0);
    }
}
