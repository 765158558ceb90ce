//! WebSocket message channel over tokio-tungstenite.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use wirecore::ParticipantId;

use crate::channel::{ChannelError, ChannelEvent, ChannelFactory, MessageChannel};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

const EVENT_BUFFER: usize = 100;

/// Room URL for the chat shared with `remote_id`.
pub fn chat_url(ws_base: &str, remote_id: ParticipantId, token: &str) -> String {
    format!(
        "{}/ws/chat/{}/?token={}",
        ws_base.trim_end_matches('/'),
        remote_id,
        urlencoding::encode(token)
    )
}

pub struct WsChannel {
    ws_sink: Mutex<Option<WsSink>>,
    is_open: Arc<AtomicBool>,
}

#[async_trait]
impl MessageChannel for WsChannel {
    async fn send(&self, frame: &[u8]) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        let text =
            std::str::from_utf8(frame).map_err(|e| ChannelError::Send(e.to_string()))?;

        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard.as_mut().ok_or(ChannelError::Closed)?;

        trace!(target: "Channel/Ws", "--> {}", text);
        sink.send(Message::text(text.to_owned()))
            .await
            .map_err(|e| ChannelError::Send(e.to_string()))
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.is_open.swap(false, Ordering::SeqCst) {
            if let Some(mut sink) = self.ws_sink.lock().await.take() {
                let _ = sink.close().await;
            }
            debug!(target: "Channel/Ws", "Channel closed");
        }
    }
}

/// Opens [`WsChannel`]s against one chat server.
#[derive(Debug, Clone)]
pub struct WsChannelFactory {
    ws_base: String,
    token: String,
}

impl WsChannelFactory {
    pub fn new(ws_base: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            ws_base: ws_base.into(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl ChannelFactory for WsChannelFactory {
    async fn open(
        &self,
        remote_id: ParticipantId,
    ) -> Result<(Arc<dyn MessageChannel>, mpsc::Receiver<ChannelEvent>), ChannelError> {
        let url = chat_url(&self.ws_base, remote_id, &self.token);
        info!(target: "Channel/Ws", "Dialing chat room with {remote_id}");

        let (ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        let (sink, stream) = ws.split();

        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let is_open = Arc::new(AtomicBool::new(true));
        let channel = Arc::new(WsChannel {
            ws_sink: Mutex::new(Some(sink)),
            is_open: is_open.clone(),
        });

        let _ = event_tx.send(ChannelEvent::Connected).await;
        tokio::spawn(read_pump(stream, event_tx, is_open));

        Ok((channel, event_rx))
    }
}

async fn read_pump(mut stream: WsStream, event_tx: mpsc::Sender<ChannelEvent>, is_open: Arc<AtomicBool>) {
    loop {
        let frame = match stream.next().await {
            Some(Ok(Message::Text(text))) => Bytes::copy_from_slice(text.as_str().as_bytes()),
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(frame))) => {
                debug!(target: "Channel/Ws", "Close frame received: {:?}", frame);
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!(target: "Channel/Ws", "Error reading from websocket: {e}");
                break;
            }
            None => {
                trace!(target: "Channel/Ws", "Websocket stream ended");
                break;
            }
        };

        trace!(target: "Channel/Ws", "<-- {} bytes", frame.len());
        if event_tx.send(ChannelEvent::Frame(frame)).await.is_err() {
            warn!(target: "Channel/Ws", "Event receiver dropped, closing read pump");
            break;
        }
    }

    is_open.store(false, Ordering::SeqCst);
    let _ = event_tx.send(ChannelEvent::Disconnected).await;
}
