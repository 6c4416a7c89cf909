//! Production [`super::Transport`] backed by `tokio-tungstenite`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::{next_transport_epoch, Transport, TransportConnector, TransportError, TransportEvent};

type WsSink = futures::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// A live connection opened via `tokio_tungstenite::connect_async`.
pub struct TungsteniteTransport {
    epoch: u64,
    open: Arc<AtomicBool>,
    sink: Mutex<Option<WsSink>>,
}

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        let mut guard = self.sink.lock().await;
        match guard.as_mut() {
            Some(sink) => sink
                .send(Message::Text(text))
                .await
                .map_err(|e| TransportError::SendFailed(e.to_string())),
            None => Err(TransportError::SendFailed("transport closed".to_string())),
        }
    }

    async fn send_ping(&self) -> Result<(), TransportError> {
        let mut guard = self.sink.lock().await;
        match guard.as_mut() {
            Some(sink) => sink
                .send(Message::Ping(Vec::new()))
                .await
                .map_err(|e| TransportError::SendFailed(e.to_string())),
            None => Err(TransportError::SendFailed("transport closed".to_string())),
        }
    }

    async fn close(&self, code: u16, reason: String) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut guard = self.sink.lock().await;
        if let Some(mut sink) = guard.take() {
            let frame = tokio_tungstenite::tungstenite::protocol::CloseFrame {
                code: tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::from(code),
                reason: reason.into(),
            };
            let _ = sink.send(Message::Close(Some(frame))).await;
            let _ = sink.close().await;
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// Opens connections against the real Polymarket WebSocket endpoints.
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

#[async_trait]
impl TransportConnector for TungsteniteConnector {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), TransportError> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let (sink, mut stream) = ws_stream.split();
        let epoch = next_transport_epoch();
        let open_flag = Arc::new(AtomicBool::new(true));
        let transport = Arc::new(TungsteniteTransport {
            epoch,
            open: open_flag.clone(),
            sink: Mutex::new(Some(sink)),
        });

        let (event_tx, event_rx) = mpsc::channel(256);

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let event = match message {
                    Ok(Message::Text(text)) => TransportEvent::Text(text),
                    Ok(Message::Pong(_)) => TransportEvent::Pong,
                    Ok(Message::Ping(_)) => {
                        // tungstenite auto-responds to pings; nothing to surface.
                        continue;
                    }
                    Ok(Message::Close(frame)) => {
                        open_flag.store(false, Ordering::SeqCst);
                        TransportEvent::Closed {
                            code: frame.as_ref().map(|f| f.code.into()),
                            reason: frame.map(|f| f.reason.to_string()).unwrap_or_default(),
                        }
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        open_flag.store(false, Ordering::SeqCst);
                        warn!(error = %e, "transport read error");
                        TransportEvent::Error(e.to_string())
                    }
                };
                let is_terminal = matches!(event, TransportEvent::Closed { .. } | TransportEvent::Error(_));
                if event_tx.send(event).await.is_err() {
                    debug!("transport event receiver dropped, ending read loop");
                    return;
                }
                if is_terminal {
                    return;
                }
            }
            // Stream ended without an explicit close/error frame.
            open_flag.store(false, Ordering::SeqCst);
            let _ = event_tx
                .send(TransportEvent::Closed {
                    code: None,
                    reason: "stream ended".to_string(),
                })
                .await;
        });

        Ok((transport as Arc<dyn Transport>, event_rx))
    }
}
