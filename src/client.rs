use crate::error::VoiceError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

mod config;
pub(crate) mod consts;
mod stats;
mod utils;

pub use config::{Config, ConfigBuilder};
pub use stats::Stats;

/// What a link delivers inbound.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    /// Sent once when the peer closes or the read side fails.
    Closed(Option<String>),
}

/// The two halves of an open message channel.
pub struct RawLink {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<Frame>,
}

/// Opens message channels. The event loop never touches sockets directly.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &Config) -> anyhow::Result<RawLink>;
}

/// Connector over tokio-tungstenite.
pub struct WsConnector {
    stats: Arc<Mutex<Stats>>,
}

impl WsConnector {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(Mutex::new(Stats::new())),
        }
    }

    pub fn stats(&self) -> anyhow::Result<Stats> {
        self.stats
            .lock()
            .map(|guard| guard.clone())
            .map_err(|_| anyhow::anyhow!("failed to get stats"))
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, config: &Config) -> anyhow::Result<RawLink> {
        let request = utils::build_request(config)?;
        let (ws_stream, _) = tokio_tungstenite::connect_async(request).await?;
        let (mut write, mut read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(config.capacity());
        let (in_tx, in_rx) = mpsc::channel::<Frame>(config.capacity());

        let stats = self.stats.clone();
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Ok(mut guard) = stats.lock() {
                    guard.record_out(text.len());
                }
                if let Err(e) = write.send(Message::Text(text)).await {
                    tracing::error!("failed to send message: {}", e);
                    break;
                }
            }
            if let Err(e) = write.close().await {
                tracing::debug!("failed to close socket: {}", e);
            }
        });

        let stats = self.stats.clone();
        tokio::spawn(async move {
            let reason = loop {
                let message = match read.next().await {
                    None => break None,
                    Some(Err(e)) => {
                        tracing::error!("failed to read message: {}", e);
                        break Some(e.to_string());
                    }
                    Some(Ok(message)) => message,
                };
                match message {
                    Message::Text(text) => {
                        if let Ok(mut guard) = stats.lock() {
                            guard.record_in(text.len());
                        }
                        if in_tx.send(Frame::Text(text)).await.is_err() {
                            return;
                        }
                    }
                    Message::Binary(bin) => {
                        tracing::warn!("unexpected binary message: {} bytes", bin.len());
                    }
                    Message::Close(frame) => {
                        tracing::info!("connection closed: {:?}", frame);
                        break frame.map(|f| f.reason.to_string());
                    }
                    _ => {}
                }
            };
            let _ = in_tx.send(Frame::Closed(reason)).await;
        });

        Ok(RawLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Connects with an upper bound on how long opening may take.
pub(crate) async fn dial(connector: &dyn Connector, config: &Config) -> Result<RawLink, VoiceError> {
    let wait = config.open_timeout();
    match tokio::time::timeout(wait, connector.connect(config)).await {
        Ok(Ok(link)) => {
            tracing::info!("connected to {}", config.url());
            Ok(link)
        }
        Ok(Err(e)) => {
            tracing::error!("failed to connect to {}: {:#}", config.url(), e);
            Err(VoiceError::ConnectionClosed(format!("{}: {:#}", config.url(), e)))
        }
        Err(_) => {
            tracing::error!("timed out connecting to {}", config.url());
            Err(VoiceError::ConnectionTimeout {
                endpoint: config.url().to_string(),
                waited_ms: wait.as_millis() as u64,
            })
        }
    }
}

/// One decoded inbound event, or the end of the link.
#[derive(Debug)]
pub(crate) enum LinkEvent<In> {
    Message(In),
    Closed(Option<String>),
}

/// Decodes inbound frames until the link closes. Undecodable frames are
/// logged and skipped.
pub(crate) async fn pump<In, F>(mut inbound: mpsc::Receiver<Frame>, mut forward: F)
where
    In: DeserializeOwned + Debug,
    F: FnMut(LinkEvent<In>),
{
    while let Some(frame) = inbound.recv().await {
        match frame {
            Frame::Text(text) => {
                if let Ok(json) = serde_json::from_str::<serde_json::Value>(&text) {
                    let event_type = json.get("type").and_then(|v| v.as_str());
                    let request_id = json.get("requestId").map(|v| v.to_string());
                    tracing::debug!(
                        "received message: {}, request_id={}",
                        event_type.unwrap_or("unknown"),
                        request_id.as_deref().unwrap_or("none")
                    );
                }
                match serde_json::from_str::<In>(&text) {
                    Ok(event) => forward(LinkEvent::Message(event)),
                    Err(e) => {
                        tracing::error!("failed to deserialize event: {}, text=> {:?}", e, text);
                    }
                }
            }
            Frame::Closed(reason) => {
                forward(LinkEvent::Closed(reason));
                return;
            }
        }
    }
    forward(LinkEvent::Closed(None));
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Never finishes connecting.
    pub struct PendingConnector;

    #[async_trait]
    impl Connector for PendingConnector {
        async fn connect(&self, _config: &Config) -> anyhow::Result<RawLink> {
            std::future::pending().await
        }
    }

    pub struct RefusingConnector;

    #[async_trait]
    impl Connector for RefusingConnector {
        async fn connect(&self, _config: &Config) -> anyhow::Result<RawLink> {
            Err(anyhow::anyhow!("connection refused"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::types::RecognitionServerEvent;
    use std::time::Duration;

    #[tokio::test]
    async fn dial_times_out_on_a_silent_endpoint() {
        let config = Config::builder()
            .with_url("ws://10.255.255.1/ws")
            .with_open_poll(Duration::from_millis(5), 4)
            .build();
        let result = dial(&PendingConnector, &config).await;
        assert_eq!(
            result.err(),
            Some(VoiceError::ConnectionTimeout {
                endpoint: "ws://10.255.255.1/ws".to_string(),
                waited_ms: 20,
            })
        );
    }

    #[tokio::test]
    async fn dial_reports_refusals_as_closed() {
        let config = Config::default();
        match dial(&RefusingConnector, &config).await {
            Err(VoiceError::ConnectionClosed(reason)) => assert!(reason.contains("refused")),
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("connect should fail"),
        }
    }

    #[tokio::test]
    async fn pump_skips_garbage_and_ends_with_close() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(Frame::Text(r#"{"type":"interim","text":"he"}"#.into()))
            .await
            .unwrap();
        tx.send(Frame::Text("{not json".into())).await.unwrap();
        tx.send(Frame::Text(r#"{"type":"mystery"}"#.into()))
            .await
            .unwrap();
        tx.send(Frame::Closed(Some("bye".into()))).await.unwrap();

        let mut seen = Vec::new();
        pump::<RecognitionServerEvent, _>(rx, |event| seen.push(event)).await;

        assert_eq!(seen.len(), 2);
        assert!(matches!(seen[0], LinkEvent::Message(RecognitionServerEvent::Interim(_))));
        assert!(matches!(&seen[1], LinkEvent::Closed(Some(reason)) if reason == "bye"));
    }
}
