//! Gemini Live websocket connector

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::protocol::{ClientMessage, RealtimeInput, ServerMessage};
use super::{ChannelEvent, LiveConfig, LiveConnector, LiveLink};
use crate::error::VoiceError;

/// Bidirectional streaming endpoint of the Gemini Live API
pub const LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to Gemini Live over a websocket
#[derive(Clone)]
pub struct GeminiLiveConnector {
    endpoint: String,
    api_key: String,
}

impl GeminiLiveConnector {
    pub fn new(endpoint: &str, api_key: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn url(&self) -> String {
        format!("{}?key={}", self.endpoint, self.api_key)
    }
}

impl std::fmt::Debug for GeminiLiveConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiLiveConnector")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LiveConnector for GeminiLiveConnector {
    async fn connect(
        &self,
        config: LiveConfig,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Result<Box<dyn LiveLink>, VoiceError> {
        tracing::info!("Connecting live channel (model: {})", config.model);

        let (ws, _response) = connect_async(self.url())
            .await
            .map_err(|e| VoiceError::ChannelOpenFailure(e.to_string()))?;

        let (mut sink, stream) = ws.split();

        let setup = ClientMessage::setup(&config)
            .to_json()
            .map_err(|e| VoiceError::ChannelOpenFailure(e.to_string()))?;
        sink.send(Message::text(setup))
            .await
            .map_err(|e| VoiceError::ChannelOpenFailure(e.to_string()))?;

        let reader = ReaderTask(tokio::spawn(read_loop(stream, events)));

        Ok(Box::new(GeminiLink { sink, reader }))
    }
}

struct GeminiLink {
    sink: SplitSink<WsStream, Message>,
    reader: ReaderTask,
}

/// Inbound half of the socket. Dropping it cancels the read loop, so a link
/// that is dropped without `close()` still releases the connection.
struct ReaderTask(JoinHandle<()>);

impl Drop for ReaderTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[async_trait]
impl LiveLink for GeminiLink {
    async fn send(&mut self, input: RealtimeInput) -> Result<(), VoiceError> {
        let json = ClientMessage::realtime(input)
            .to_json()
            .map_err(|e| VoiceError::TransmitFailure(e.to_string()))?;

        self.sink
            .send(Message::text(json))
            .await
            .map_err(|e| VoiceError::TransmitFailure(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.sink.close().await {
            tracing::debug!("Live channel close: {}", e);
        }
        self.reader.0.abort();
    }
}

/// Forward inbound frames as channel events until the socket ends
async fn read_loop(mut stream: SplitStream<WsStream>, events: mpsc::UnboundedSender<ChannelEvent>) {
    let mut opened = false;

    let reason = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                if let Some(event) = parse_frame(text.as_str().as_bytes()) {
                    opened |= event == ChannelEvent::Opened;
                    let _ = events.send(event);
                }
            }
            Some(Ok(Message::Binary(data))) => {
                if let Some(event) = parse_frame(&data) {
                    opened |= event == ChannelEvent::Opened;
                    let _ = events.send(event);
                }
            }
            Some(Ok(Message::Close(frame))) => {
                break frame.map(|f| format!("{} ({})", f.reason.as_str(), u16::from(f.code)));
            }
            // Ping/pong are answered by tungstenite
            Some(Ok(_)) => {}
            Some(Err(e)) => break Some(e.to_string()),
            None => break None,
        }
    };

    tracing::info!("Live channel ended: {}", reason.as_deref().unwrap_or("no reason"));

    let event = if opened {
        ChannelEvent::Closed { reason }
    } else {
        ChannelEvent::Failed(reason.unwrap_or_else(|| "closed before setup completed".to_string()))
    };
    let _ = events.send(event);
}

/// Map one JSON frame to a channel event. Unparsable frames are skipped.
fn parse_frame(payload: &[u8]) -> Option<ChannelEvent> {
    match serde_json::from_slice::<ServerMessage>(payload) {
        Ok(msg) if msg.is_setup_complete() => Some(ChannelEvent::Opened),
        Ok(msg) => Some(ChannelEvent::Message(msg)),
        Err(e) => {
            tracing::warn!("Skipping unparsable live frame: {}", e);
            None
        }
    }
}
