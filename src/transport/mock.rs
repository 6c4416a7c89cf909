//! In-memory [`super::Transport`]/[`super::TransportConnector`] double used
//! by this crate's own test suite to drive the socket state machines
//! without a live exchange connection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{next_transport_epoch, Transport, TransportConnector, TransportError, TransportEvent};

/// A frame observed leaving a [`MockTransport`].
#[derive(Debug, Clone, PartialEq)]
pub enum SentFrame {
    /// A text frame sent by the socket under test.
    Text(String),
    /// A ping sent by the socket's keepalive timer.
    Ping,
    /// The socket closed the connection with this code/reason.
    Close(u16, String),
}

/// Handle for one connection opened through a [`MockConnector`], given to
/// the test that owns the connector so it can inject inbound events and
/// inspect outbound frames.
pub struct MockConnection {
    /// The URL the socket under test connected to.
    pub url: String,
    /// Push an inbound event to the socket under test.
    pub event_tx: mpsc::Sender<TransportEvent>,
    /// Frames the socket under test has sent, in order.
    pub sent_rx: mpsc::UnboundedReceiver<SentFrame>,
    /// The transport instance itself, for `is_open`/`epoch` inspection.
    pub transport: Arc<MockTransport>,
}

/// An in-memory transport. Sent frames are recorded; inbound events are
/// injected by test code via the paired [`MockConnection::event_tx`].
pub struct MockTransport {
    epoch: u64,
    open: AtomicBool,
    sent_tx: mpsc::UnboundedSender<SentFrame>,
    event_tx: mpsc::Sender<TransportEvent>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("transport closed".to_string()));
        }
        self.sent_tx
            .send(SentFrame::Text(text))
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn send_ping(&self) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("transport closed".to_string()));
        }
        self.sent_tx
            .send(SentFrame::Ping)
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&self, code: u16, reason: String) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.sent_tx.send(SentFrame::Close(code, reason.clone()));
        // Real transports fire the close handler for locally-initiated
        // closes too; mirror that so socket code has one close path.
        let _ = self
            .event_tx
            .send(TransportEvent::Closed {
                code: Some(code),
                reason,
            })
            .await;
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// A connector whose `connect` calls can be scripted to fail, and whose
/// successful connects are handed to the test as [`MockConnection`]s over
/// an unbounded channel.
pub struct MockConnector {
    fail_next: Mutex<VecDeque<String>>,
    connections_tx: mpsc::UnboundedSender<MockConnection>,
}

impl MockConnector {
    /// Create a connector paired with a stream of the connections it opens.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockConnection>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                fail_next: Mutex::new(VecDeque::new()),
                connections_tx: tx,
            }),
            rx,
        )
    }

    /// Make the next `connect` call fail with the given error message.
    pub fn fail_next_connect(&self, message: impl Into<String>) {
        self.fail_next.lock().unwrap().push_back(message.into());
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), TransportError> {
        if let Some(message) = self.fail_next.lock().unwrap().pop_front() {
            return Err(TransportError::ConnectFailed(message));
        }

        let (event_tx, event_rx) = mpsc::channel(256);
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport {
            epoch: next_transport_epoch(),
            open: AtomicBool::new(true),
            sent_tx,
            event_tx: event_tx.clone(),
        });

        let connection = MockConnection {
            url: url.to_string(),
            event_tx,
            sent_rx,
            transport: transport.clone(),
        };
        // Ignore send errors: a test that isn't watching connections has
        // chosen not to inspect them.
        let _ = self.connections_tx.send(connection);

        Ok((transport as Arc<dyn Transport>, event_rx))
    }
}
