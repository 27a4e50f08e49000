//! Mail delivery abstraction.
//!
//! This module defines the `Mailer` trait to abstract the mail transport,
//! enabling the daemon to be tested without an SMTP server.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::SmtpConfig;
use crate::domain::record::RecordId;
use crate::error::{DeliveryError, Result, TexpostError};

/// A message ready for the transport: one PDF attachment per message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMail {
    pub record_id: RecordId,
    pub to: Vec<String>,
    pub subject: String,
    pub body_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_html: Option<String>,
    pub attachment: PathBuf,
}

impl OutgoingMail {
    /// File name the attachment is presented under.
    pub fn attachment_name(&self) -> String {
        self.attachment
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.pdf", self.record_id))
    }
}

/// Transport-level acknowledgment of an accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    /// SMTP reply code, e.g. "250".
    pub code: String,
    pub message: String,
    pub accepted_at: DateTime<Utc>,
}

/// Trait for sending a compiled document.
///
/// Implementations classify every failure into a [`DeliveryError`] so the
/// daemon can decide between retrying, failing the record, or stopping.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(
        &self,
        mail: &OutgoingMail,
    ) -> std::result::Result<DeliveryReceipt, DeliveryError>;
}

// ============================================================================
// Production Implementation using lettre
// ============================================================================

/// SMTP mailer using STARTTLS and sender credentials.
#[derive(Clone)]
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: Mailbox,
}

impl SmtpMailer {
    pub fn from_config(config: &SmtpConfig) -> Result<Self> {
        let sender: Mailbox = config.sender.parse().map_err(|e| {
            TexpostError::Config(format!("invalid sender address '{}': {}", config.sender, e))
        })?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.server)
            .map_err(|e| {
                TexpostError::Config(format!("invalid SMTP server '{}': {}", config.server, e))
            })?
            .port(config.port)
            .credentials(Credentials::new(
                config.sender.clone(),
                config.password.clone(),
            ))
            .timeout(Some(Duration::from_millis(config.timeout_ms)))
            .build();

        Ok(Self { transport, sender })
    }

    async fn build_message(
        &self,
        mail: &OutgoingMail,
    ) -> std::result::Result<Message, DeliveryError> {
        let mut builder = Message::builder()
            .from(self.sender.clone())
            .subject(mail.subject.clone());
        for to in &mail.to {
            let mailbox: Mailbox = to.parse().map_err(|e| {
                DeliveryError::Rejected(format!("invalid recipient '{}': {}", to, e))
            })?;
            builder = builder.to(mailbox);
        }

        let pdf = tokio::fs::read(&mail.attachment).await.map_err(|e| {
            DeliveryError::Rejected(format!(
                "cannot read attachment {}: {}",
                mail.attachment.display(),
                e
            ))
        })?;
        let content_type = ContentType::parse("application/pdf")
            .map_err(|e| DeliveryError::Rejected(e.to_string()))?;
        let attachment = Attachment::new(mail.attachment_name()).body(pdf, content_type);

        let body = match &mail.body_html {
            Some(html) => MultiPart::mixed()
                .multipart(MultiPart::alternative_plain_html(
                    mail.body_text.clone(),
                    html.clone(),
                ))
                .singlepart(attachment),
            None => MultiPart::mixed()
                .singlepart(SinglePart::plain(mail.body_text.clone()))
                .singlepart(attachment),
        };

        builder
            .multipart(body)
            .map_err(|e| DeliveryError::Rejected(e.to_string()))
    }
}

/// Map a transport error onto the delivery taxonomy.
fn classify(err: lettre::transport::smtp::Error) -> DeliveryError {
    let code = err
        .status()
        .and_then(|code| code.to_string().parse::<u16>().ok());
    let text = err.to_string();
    match code {
        Some(530 | 534 | 535) => DeliveryError::Authentication(text),
        _ if err.is_permanent() => DeliveryError::Rejected(text),
        _ if err.is_timeout() => DeliveryError::Timeout(text),
        _ if err.is_transient() => DeliveryError::Transient(text),
        _ => DeliveryError::Connection(text),
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    #[tracing::instrument(
        skip_all,
        fields(record_id = %mail.record_id, recipients = mail.to.len())
    )]
    async fn send(
        &self,
        mail: &OutgoingMail,
    ) -> std::result::Result<DeliveryReceipt, DeliveryError> {
        let message = self.build_message(mail).await?;
        let response = self.transport.send(message).await.map_err(classify)?;
        Ok(DeliveryReceipt {
            code: response.code().to_string(),
            message: response.first_line().unwrap_or_default().to_string(),
            accepted_at: Utc::now(),
        })
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

/// Record of a call made to the mock mailer.
#[derive(Debug, Clone)]
pub struct MockSendCall {
    pub mail: OutgoingMail,
    /// Size of the attachment at send time, `None` if it was missing.
    pub attachment_bytes: Option<u64>,
}

/// Mock mailer for testing.
///
/// Responses are queued per record id and returned in FIFO order. Unqueued
/// sends are accepted with a `250` receipt.
#[derive(Clone)]
pub struct MockMailer {
    responses: Arc<Mutex<HashMap<RecordId, VecDeque<std::result::Result<(), DeliveryError>>>>>,
    calls: Arc<Mutex<Vec<MockSendCall>>>,
    in_flight: Arc<AtomicUsize>,
}

impl MockMailer {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue an outcome for a specific record.
    pub fn add_response(&self, record_id: &str, response: std::result::Result<(), DeliveryError>) {
        self.responses
            .lock()
            .entry(RecordId::from(record_id))
            .or_default()
            .push_back(response);
    }

    pub fn get_calls(&self) -> Vec<MockSendCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

impl Default for MockMailer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Mailer for MockMailer {
    async fn send(
        &self,
        mail: &OutgoingMail,
    ) -> std::result::Result<DeliveryReceipt, DeliveryError> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.in_flight.clone();
        let _guard = scopeguard::guard((), move |_| {
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        let attachment_bytes = tokio::fs::metadata(&mail.attachment)
            .await
            .ok()
            .map(|m| m.len());
        self.calls.lock().push(MockSendCall {
            mail: mail.clone(),
            attachment_bytes,
        });

        let response = self
            .responses
            .lock()
            .get_mut(&mail.record_id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Ok(()));

        response.map(|()| DeliveryReceipt {
            code: "250".to_string(),
            message: "2.0.0 OK: queued".to_string(),
            accepted_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mail(attachment: PathBuf) -> OutgoingMail {
        OutgoingMail {
            record_id: RecordId::from("r1"),
            to: vec!["a@example.com".into()],
            subject: "Hello".into(),
            body_text: "See attached".into(),
            body_html: None,
            attachment,
        }
    }

    #[test]
    fn test_attachment_name_from_path() {
        let mail = mail(PathBuf::from("/pdfs/r1/r1.pdf"));
        assert_eq!(mail.attachment_name(), "r1.pdf");
    }

    #[tokio::test]
    async fn test_mock_mailer_accepts_by_default() {
        let mock = MockMailer::new();
        let receipt = mock.send(&mail(PathBuf::from("/nonexistent.pdf"))).await.unwrap();
        assert_eq!(receipt.code, "250");
        assert_eq!(mock.call_count(), 1);
        assert_eq!(mock.get_calls()[0].attachment_bytes, None);
    }

    #[tokio::test]
    async fn test_mock_mailer_returns_queued_failures_in_order() {
        let mock = MockMailer::new();
        mock.add_response("r1", Err(DeliveryError::Timeout("30s".into())));
        mock.add_response("r1", Err(DeliveryError::Rejected("550".into())));

        let mail = mail(PathBuf::from("/nonexistent.pdf"));
        assert_eq!(
            mock.send(&mail).await.unwrap_err(),
            DeliveryError::Timeout("30s".into())
        );
        assert_eq!(
            mock.send(&mail).await.unwrap_err(),
            DeliveryError::Rejected("550".into())
        );
        assert!(mock.send(&mail).await.is_ok());
        assert_eq!(mock.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_recipient_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("r1.pdf");
        tokio::fs::write(&pdf, b"%PDF").await.unwrap();

        let mailer = SmtpMailer::from_config(&SmtpConfig {
            server: "localhost".into(),
            sender: "sender@example.com".into(),
            password: "secret".into(),
            ..Default::default()
        })
        .unwrap();

        let mut mail = mail(pdf);
        mail.to = vec!["not an address".into()];
        let err = mailer.send(&mail).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_message_carries_pdf_attachment() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("r1.pdf");
        tokio::fs::write(&pdf, b"%PDF-1.4").await.unwrap();

        let mailer = SmtpMailer::from_config(&SmtpConfig {
            server: "localhost".into(),
            sender: "sender@example.com".into(),
            password: "secret".into(),
            ..Default::default()
        })
        .unwrap();

        let message = mailer.build_message(&mail(pdf)).await.unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("application/pdf"));
        assert!(raw.contains("r1.pdf"));
        assert!(raw.contains("Subject: Hello"));
    }
}
