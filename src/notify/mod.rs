//! Notification hub.
//!
//! Fans messages out to registered sinks in parallel; one slow or failing
//! sink never blocks the batch. A level filter drops messages below the
//! configured minimum.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::model::WalletType;

/// Message severity, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyLevel {
    Info,
    Success,
    Warn,
    Error,
}

impl fmt::Display for NotifyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyLevel::Info => write!(f, "info"),
            NotifyLevel::Success => write!(f, "success"),
            NotifyLevel::Warn => write!(f, "warn"),
            NotifyLevel::Error => write!(f, "error"),
        }
    }
}

/// Structured trade detail embedded in rich notification bodies.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TradeDetail {
    pub action: Option<String>,
    pub symbol: Option<String>,
    pub price: Option<Decimal>,
    pub cost: Option<Decimal>,
    pub wallet: Option<WalletType>,
    /// Milliseconds between signal receipt and completion.
    pub elapsed_ms: Option<i64>,
}

/// A notification as delivered to sinks.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub time: DateTime<Utc>,
    pub level: NotifyLevel,
    pub subject: String,
    pub body: String,
    pub detail: Option<TradeDetail>,
}

impl Notification {
    pub fn new(level: NotifyLevel, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            time: Utc::now(),
            level,
            subject: subject.into(),
            body: body.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: TradeDetail) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// A delivery target for notifications.
#[async_trait]
pub trait NotifySink: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Level-filtered fan-out to registered sinks.
pub struct Notifier {
    sinks: Vec<Arc<dyn NotifySink>>,
    min_level: NotifyLevel,
}

impl Notifier {
    pub fn new(min_level: NotifyLevel) -> Self {
        Self {
            sinks: Vec::new(),
            min_level,
        }
    }

    pub fn register(&mut self, sink: Arc<dyn NotifySink>) {
        self.sinks.push(sink);
    }

    /// Deliver to every sink in parallel. Sink failures are logged and
    /// swallowed.
    pub async fn notify(&self, notification: Notification) {
        if notification.level < self.min_level {
            return;
        }

        let deliveries = self.sinks.iter().map(|sink| {
            let notification = &notification;
            async move {
                if let Err(e) = sink.deliver(notification).await {
                    warn!(sink = sink.name(), error = %e, "Notification sink failed");
                }
            }
        });
        join_all(deliveries).await;
    }
}

/// Sink that writes notifications into the process log.
pub struct TracingSink;

#[async_trait]
impl NotifySink for TracingSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, n: &Notification) -> anyhow::Result<()> {
        match n.level {
            NotifyLevel::Error => error!(subject = %n.subject, "{}", n.body),
            NotifyLevel::Warn => warn!(subject = %n.subject, "{}", n.body),
            _ => info!(subject = %n.subject, "{}", n.body),
        }
        Ok(())
    }
}

/// Sink that keeps a capped in-memory ring of recent messages for the
/// diagnostics surface.
pub struct RingBufferSink {
    entries: Mutex<VecDeque<String>>,
    cap: usize,
}

impl RingBufferSink {
    pub fn new(cap: usize) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(VecDeque::new()),
            cap,
        })
    }

    pub fn recent(&self) -> Vec<String> {
        self.entries.lock().expect("ring poisoned").iter().cloned().collect()
    }
}

#[async_trait]
impl NotifySink for RingBufferSink {
    fn name(&self) -> &str {
        "ring"
    }

    async fn deliver(&self, n: &Notification) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().expect("ring poisoned");
        entries.push_back(format!(
            "{} [{}] {}: {}",
            n.time.format("%Y-%m-%d %H:%M:%S"),
            n.level,
            n.subject,
            n.body
        ));
        while entries.len() > self.cap {
            entries.pop_front();
        }
        Ok(())
    }
}

/// Sink that POSTs notifications to a webhook as JSON.
pub struct WebhookSink {
    url: String,
    http: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: String) -> Self {
        Self {
            url,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotifySink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, n: &Notification) -> anyhow::Result<()> {
        self.http
            .post(&self.url)
            .json(n)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingSink(AtomicU32);

    #[async_trait]
    impl NotifySink for CountingSink {
        fn name(&self) -> &str {
            "counting"
        }

        async fn deliver(&self, _n: &Notification) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl NotifySink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        async fn deliver(&self, _n: &Notification) -> anyhow::Result<()> {
            anyhow::bail!("sink down")
        }
    }

    #[tokio::test]
    async fn test_level_filter_drops_low_messages() {
        let sink = Arc::new(CountingSink(AtomicU32::new(0)));
        let mut notifier = Notifier::new(NotifyLevel::Warn);
        notifier.register(sink.clone());

        notifier
            .notify(Notification::new(NotifyLevel::Info, "s", "b"))
            .await;
        notifier
            .notify(Notification::new(NotifyLevel::Error, "s", "b"))
            .await;
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_block_others() {
        let sink = Arc::new(CountingSink(AtomicU32::new(0)));
        let mut notifier = Notifier::new(NotifyLevel::Info);
        notifier.register(Arc::new(FailingSink));
        notifier.register(sink.clone());

        notifier
            .notify(Notification::new(NotifyLevel::Info, "s", "b"))
            .await;
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ring_buffer_caps_entries() {
        let ring = RingBufferSink::new(2);
        for i in 0..4 {
            ring.deliver(&Notification::new(NotifyLevel::Info, format!("m{i}"), ""))
                .await
                .unwrap();
        }
        let recent = ring.recent();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].contains("m2"));
    }
}
