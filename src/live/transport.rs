//! Live session transport
//!
//! `LiveConnector` opens a streaming session and resolves once the remote
//! side is ready; `GeminiLiveConnector` does this over a WebSocket.

use crate::audio::codec::AudioChunk;
use crate::live::protocol::{ClientMessage, LiveSetup, RealtimeInput, ServerMessage};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

const SETUP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Session rejected (code {code}): {reason}")]
    Rejected { code: u16, reason: String },
    #[error("Timed out waiting for session setup")]
    Timeout,
    #[error("Send rejected: {0}")]
    SendRejected(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Asynchronous notifications from an open session, in arrival order
#[derive(Debug)]
pub enum TransportEvent {
    Message(ServerMessage),
    Error(String),
    Closed { code: Option<u16>, reason: String },
}

/// Outbound half of an open session
pub trait LiveSender: Send {
    /// Queue one audio chunk. Fails once the connection is gone.
    fn send_audio(&mut self, chunk: &AudioChunk) -> Result<(), TransportError>;

    /// Best-effort close
    fn close(&mut self) -> Result<(), TransportError>;
}

/// A session whose setup has completed
pub struct LiveConnection {
    pub sender: Box<dyn LiveSender>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait LiveConnector: Send + Sync {
    /// Resolves when the transport is ready to carry audio
    async fn connect(&self, setup: &LiveSetup) -> Result<LiveConnection, TransportError>;
}

enum Outgoing {
    Frame(String),
    Close,
}

/// Connects to the Gemini Live WebSocket endpoint
pub struct GeminiLiveConnector {
    url: String,
    api_key: String,
}

impl GeminiLiveConnector {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
        }
    }
}

fn parse_frame(message: &Message) -> Option<Result<ServerMessage, serde_json::Error>> {
    match message {
        Message::Text(text) => Some(serde_json::from_str(text)),
        Message::Binary(bytes) => Some(serde_json::from_slice(bytes)),
        _ => None,
    }
}

#[async_trait]
impl LiveConnector for GeminiLiveConnector {
    async fn connect(&self, setup: &LiveSetup) -> Result<LiveConnection, TransportError> {
        let url = format!("{}?key={}", self.url, self.api_key);
        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut write, mut read) = stream.split();

        let frame = serde_json::to_string(&setup.to_message())?;
        write
            .send(Message::Text(frame))
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!("Sent live setup for {}", setup.model);

        // The session is usable once setupComplete arrives.
        let ready = tokio::time::timeout(SETUP_TIMEOUT, async {
            while let Some(message) = read.next().await {
                let message = match message {
                    Ok(m) => m,
                    Err(e) => return Err(TransportError::Connect(e.to_string())),
                };
                if let Message::Close(frame) = &message {
                    let (code, reason) = frame
                        .as_ref()
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Err(TransportError::Rejected { code, reason });
                }
                match parse_frame(&message) {
                    Some(Ok(parsed)) if parsed.is_setup_complete() => return Ok(()),
                    Some(Ok(_)) => trace!("Ignoring frame before setupComplete"),
                    Some(Err(e)) => warn!("Unreadable frame during setup: {}", e),
                    None => {}
                }
            }
            Err(TransportError::Connect("connection ended during setup".to_string()))
        })
        .await
        .map_err(|_| TransportError::Timeout)?;
        ready?;
        info!("Live session ready");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outgoing>();

        let writer_events = events_tx.clone();
        tokio::spawn(async move {
            while let Some(outgoing) = out_rx.recv().await {
                let result = match outgoing {
                    Outgoing::Frame(frame) => write.send(Message::Text(frame)).await,
                    Outgoing::Close => {
                        let _ = write.send(Message::Close(None)).await;
                        let _ = write.close().await;
                        break;
                    }
                };
                if let Err(e) = result {
                    let _ = writer_events.send(TransportEvent::Error(e.to_string()));
                    break;
                }
            }
            debug!("Live writer finished");
        });

        tokio::spawn(async move {
            loop {
                let event = match read.next().await {
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (Some(u16::from(f.code)), f.reason.to_string()))
                            .unwrap_or((None, String::new()));
                        let _ = events_tx.send(TransportEvent::Closed { code, reason });
                        break;
                    }
                    Some(Ok(message)) => match parse_frame(&message) {
                        Some(Ok(parsed)) => TransportEvent::Message(parsed),
                        Some(Err(e)) => {
                            warn!("Skipping unreadable live frame: {}", e);
                            continue;
                        }
                        None => continue,
                    },
                    Some(Err(e)) => {
                        let _ = events_tx.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                    None => {
                        let _ = events_tx.send(TransportEvent::Closed {
                            code: None,
                            reason: "stream ended".to_string(),
                        });
                        break;
                    }
                };
                if events_tx.send(event).is_err() {
                    break;
                }
            }
            debug!("Live reader finished");
        });

        Ok(LiveConnection {
            sender: Box::new(GeminiLiveSender { out: out_tx }),
            events: events_rx,
        })
    }
}

struct GeminiLiveSender {
    out: mpsc::UnboundedSender<Outgoing>,
}

impl LiveSender for GeminiLiveSender {
    fn send_audio(&mut self, chunk: &AudioChunk) -> Result<(), TransportError> {
        let frame = serde_json::to_string(&ClientMessage::RealtimeInput(RealtimeInput {
            audio: chunk.clone(),
        }))?;
        self.out
            .send(Outgoing::Frame(frame))
            .map_err(|_| TransportError::SendRejected("connection closed".to_string()))
    }

    fn close(&mut self) -> Result<(), TransportError> {
        // Already closed is fine.
        let _ = self.out.send(Outgoing::Close);
        Ok(())
    }
}
