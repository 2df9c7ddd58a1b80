//! Long-lived connection to the signal hub.
//!
//! Maintains the socket with reconnect backoff, decodes inbound events onto
//! a channel and writes `traded_*` acknowledgements back. Two HTTP lookups
//! expose the hub's own view of open trades.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::types::{Envelope, HubAck, HubEvent, HubTrade};
use crate::config::HubConfig;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// The hub operations the engine depends on. Split out so engine tests can
/// script hub behavior.
#[async_trait]
pub trait HubApi: Send + Sync {
    /// Queue an acknowledgement for delivery. Empty channels are dropped.
    fn ack(&self, ack: HubAck);

    /// All of this user's open trades, as the hub sees them.
    async fn list_user_trades(&self) -> Result<Vec<HubTrade>>;

    /// One strategy's open trades, as the hub sees them.
    async fn list_strategy_trades(&self, strategy_id: &str) -> Result<Vec<HubTrade>>;
}

/// Socket + HTTP client for the hub.
pub struct HubClient {
    config: HubConfig,
    http: reqwest::Client,
    outbound: mpsc::UnboundedSender<HubAck>,
    outbound_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<HubAck>>>,
}

impl HubClient {
    pub fn new(config: HubConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create hub HTTP client")?;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            http,
            outbound,
            outbound_rx: std::sync::Mutex::new(Some(outbound_rx)),
        })
    }

    /// Run the connection until the process exits. Emits `Connected` /
    /// `Disconnected` markers around each session.
    pub async fn run(self: Arc<Self>, events: mpsc::UnboundedSender<HubEvent>) {
        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .expect("hub poisoned")
            .take()
            .expect("hub client already running");

        loop {
            let url = format!("{}?api_key={}", self.config.url, self.config.api_key);
            match connect_async(url.as_str()).await {
                Ok((stream, _)) => {
                    info!("Connected to signal hub");
                    let _ = events.send(HubEvent::Connected);

                    let (mut write, mut read) = stream.split();
                    loop {
                        tokio::select! {
                            message = read.next() => {
                                match message {
                                    Some(Ok(Message::Text(text))) => {
                                        self.handle_text(&text, &events);
                                    }
                                    Some(Ok(Message::Ping(payload))) => {
                                        let _ = write.send(Message::Pong(payload)).await;
                                    }
                                    Some(Ok(_)) => {}
                                    Some(Err(e)) => {
                                        warn!(error = %e, "Hub socket error");
                                        break;
                                    }
                                    None => break,
                                }
                            }
                            ack = outbound_rx.recv() => {
                                let Some(ack) = ack else { return };
                                if ack.channel.is_empty() {
                                    debug!(symbol = %ack.payload.symbol, "Suppressing silent acknowledgement");
                                    continue;
                                }
                                let envelope = Envelope {
                                    event: ack.channel.clone(),
                                    data: serde_json::to_value(&ack.payload)
                                        .unwrap_or(serde_json::Value::Null),
                                };
                                let text = serde_json::to_string(&envelope)
                                    .unwrap_or_default();
                                if let Err(e) = write.send(Message::Text(text)).await {
                                    warn!(error = %e, "Failed to send acknowledgement");
                                    break;
                                }
                            }
                        }
                    }

                    warn!("Hub connection closed");
                    let _ = events.send(HubEvent::Disconnected);
                }
                Err(e) => {
                    error!(error = %e, "Failed to connect to signal hub");
                }
            }

            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    fn handle_text(&self, text: &str, events: &mpsc::UnboundedSender<HubEvent>) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Undecodable hub message");
                return;
            }
        };
        match envelope.into_event() {
            Ok(event) => {
                let _ = events.send(event);
            }
            Err(e) => warn!(error = %e, "Unhandled hub event"),
        }
    }

    async fn get_trades(&self, path: &str) -> Result<Vec<HubTrade>> {
        let url = format!("{}{}", self.config.http_url, path);
        let response = self
            .http
            .get(&url)
            .header("x-api-key", &self.config.api_key)
            .send()
            .await
            .with_context(|| format!("GET {path} failed"))?;
        let status = response.status();
        anyhow::ensure!(status.is_success(), "{path} returned {status}");
        response
            .json()
            .await
            .with_context(|| format!("Failed to parse {path} response"))
    }
}

#[async_trait]
impl HubApi for HubClient {
    fn ack(&self, ack: HubAck) {
        if self.outbound.send(ack).is_err() {
            warn!("Hub writer is gone, acknowledgement dropped");
        }
    }

    async fn list_user_trades(&self) -> Result<Vec<HubTrade>> {
        self.get_trades("/trades/open").await
    }

    async fn list_strategy_trades(&self, strategy_id: &str) -> Result<Vec<HubTrade>> {
        self.get_trades(&format!("/strategies/{strategy_id}/trades"))
            .await
    }
}
