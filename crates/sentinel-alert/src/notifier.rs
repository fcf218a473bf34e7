//! Outbound notification boundary. `Notifier` is the pluggable seam;
//! `SmtpNotifier` is the default implementation, everything else
//! (pagerduty, slack, ...) can be bolted on behind the same trait
//! without the alert manager knowing the difference.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed(String),
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered)
    }
}

/// Per-channel configuration threaded through from a `NotificationRule`.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub channel: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_alert(&self, subject: &str, text: &str, html: &str, recipients: &[String], channel_config: &ChannelConfig)
        -> DeliveryOutcome;
}

/// Default notifier: one SMTP transport, reused across sends.
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpNotifier {
    pub fn new(relay: &str, username: String, password: String, from: Mailbox) -> Result<Self, String> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(relay)
            .map_err(|e| e.to_string())?
            .credentials(Credentials::new(username, password))
            .build();
        Ok(Self { transport, from })
    }

    /// An SMTP notifier pointed at localhost with no auth, for
    /// environments that run their own relay (e.g. a sidecar MTA).
    pub fn unauthenticated_relay(relay: &str, from: Mailbox) -> Result<Self, String> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(relay).build();
        Ok(Self { transport, from })
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send_alert(
        &self,
        subject: &str,
        text: &str,
        html: &str,
        recipients: &[String],
        _channel_config: &ChannelConfig,
    ) -> DeliveryOutcome {
        if recipients.is_empty() {
            return DeliveryOutcome::Failed("no recipients configured".to_string());
        }

        for recipient in recipients {
            let to: Mailbox = match recipient.parse() {
                Ok(m) => m,
                Err(e) => return DeliveryOutcome::Failed(format!("invalid recipient {recipient}: {e}")),
            };

            let message = Message::builder().from(self.from.clone()).to(to).subject(subject).multipart(
                MultiPart::alternative()
                    .singlepart(SinglePart::builder().header(ContentType::TEXT_PLAIN).body(text.to_string()))
                    .singlepart(SinglePart::builder().header(ContentType::TEXT_HTML).body(html.to_string())),
            );

            let message = match message {
                Ok(m) => m,
                Err(e) => return DeliveryOutcome::Failed(e.to_string()),
            };

            if let Err(e) = self.transport.send(message).await {
                tracing::warn!(error = %e, recipient, "alert notification delivery failed");
                return DeliveryOutcome::Failed(e.to_string());
            }
        }

        DeliveryOutcome::Delivered
    }
}

/// Test/offline notifier that records what it would have sent instead
/// of touching a transport.
#[derive(Default)]
pub struct LoggingNotifier {
    pub sent: tokio::sync::Mutex<Vec<(String, Vec<String>)>>,
}

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn send_alert(
        &self,
        subject: &str,
        _text: &str,
        _html: &str,
        recipients: &[String],
        _channel_config: &ChannelConfig,
    ) -> DeliveryOutcome {
        tracing::info!(subject, ?recipients, "alert notification (logging notifier)");
        self.sent.lock().await.push((subject.to_string(), recipients.to_vec()));
        DeliveryOutcome::Delivered
    }
}
