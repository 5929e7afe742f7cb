//! Email channel: one plain-text message per job over SMTP with STARTTLS.

use crate::channels::error::DeliveryError;
use crate::channels::queue::OutboundJob;
use crate::channels::worker::Delivery;
use crate::config::{resolve_email_password, EmailProviderConfig};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Duration;
use tokio::sync::Mutex;

const DEFAULT_SUBJECT: &str = "SMS Gateway Notification";
const SMTP_TIMEOUT: Duration = Duration::from_secs(30);

type Transport = AsyncSmtpTransport<Tokio1Executor>;

pub struct EmailDelivery {
    name: String,
    server: String,
    port: u16,
    credentials: Credentials,
    from: Mailbox,
    subject: String,
    keep_alive: bool,
    /// Open transport; taken for each send and dropped on failure so the next
    /// attempt reconnects.
    transport: Mutex<Option<Transport>>,
}

impl EmailDelivery {
    pub fn new(config: &EmailProviderConfig) -> Result<Self, DeliveryError> {
        let from: Mailbox = config
            .sender
            .parse()
            .map_err(|e| DeliveryError::Address(format!("{}: {}", config.sender, e)))?;
        let password = resolve_email_password(config).unwrap_or_default();
        Ok(Self {
            name: config.name.clone(),
            server: config.server.clone(),
            port: config.port,
            credentials: Credentials::new(config.user.clone(), password),
            from,
            subject: config
                .subject
                .clone()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SUBJECT.to_string()),
            keep_alive: config.keep_alive,
            transport: Mutex::new(None),
        })
    }

    fn build_transport(&self) -> Result<Transport, DeliveryError> {
        Ok(Transport::starttls_relay(&self.server)?
            .port(self.port)
            .credentials(self.credentials.clone())
            .timeout(Some(SMTP_TIMEOUT))
            .build())
    }

    /// Open a connection and authenticate. Used at start so a misconfigured provider
    /// is reported before any job reaches it.
    pub async fn connect(&self) -> Result<(), DeliveryError> {
        let transport = self.build_transport()?;
        if !transport.test_connection().await? {
            return Err(DeliveryError::Unavailable(format!(
                "smtp server {}:{} refused the connection",
                self.server, self.port
            )));
        }
        log::info!(
            "email {}: connected to {}:{}",
            self.name,
            self.server,
            self.port
        );
        *self.transport.lock().await = Some(transport);
        Ok(())
    }

    fn message(&self, job: &OutboundJob) -> Result<Message, DeliveryError> {
        let to: Mailbox = job
            .destination
            .parse()
            .map_err(|e| DeliveryError::Address(format!("{}: {}", job.destination, e)))?;
        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(self.subject.clone())
            .header(ContentType::TEXT_PLAIN)
            .body(job.text.clone())
            .map_err(|e| DeliveryError::Address(e.to_string()))
    }
}

#[async_trait]
impl Delivery for EmailDelivery {
    async fn deliver(&self, job: &OutboundJob) -> Result<(), DeliveryError> {
        let message = self.message(job)?;
        let mut slot = self.transport.lock().await;
        let transport = match slot.take() {
            Some(t) => t,
            None => {
                log::debug!("email {}: reconnecting", self.name);
                self.build_transport()?
            }
        };
        transport.send(message).await?;
        *slot = Some(transport);
        Ok(())
    }

    async fn after_job(&self) {
        if !self.keep_alive && self.transport.lock().await.take().is_some() {
            log::debug!("email {}: disconnected", self.name);
        }
    }

    async fn close(&self) {
        self.transport.lock().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> EmailProviderConfig {
        serde_json::from_str(
            r#"{"name": "mail", "server": "smtp.example.com", "port": 587,
                "user": "gw", "password": "secret", "sender": "gw@example.com"}"#,
        )
        .unwrap()
    }

    #[test]
    fn subject_defaults_when_unset() {
        let delivery = EmailDelivery::new(&provider()).unwrap();
        assert_eq!(delivery.subject, DEFAULT_SUBJECT);

        let mut config = provider();
        config.subject = Some("Inbound SMS".to_string());
        assert_eq!(EmailDelivery::new(&config).unwrap().subject, "Inbound SMS");
    }

    #[test]
    fn invalid_sender_address_is_rejected() {
        let mut config = provider();
        config.sender = "not an address".to_string();
        assert!(matches!(
            EmailDelivery::new(&config),
            Err(DeliveryError::Address(_))
        ));
    }

    #[tokio::test]
    async fn invalid_recipient_fails_without_connecting() {
        let delivery = EmailDelivery::new(&provider()).unwrap();
        let err = delivery
            .deliver(&OutboundJob::new("nobody", "hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Address(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn transport_is_dropped_after_each_job_unless_kept_alive() {
        let mut config = provider();
        config.keep_alive = false;
        let delivery = EmailDelivery::new(&config).unwrap();
        *delivery.transport.lock().await = Some(delivery.build_transport().unwrap());
        delivery.after_job().await;
        assert!(delivery.transport.lock().await.is_none());

        config.keep_alive = true;
        let delivery = EmailDelivery::new(&config).unwrap();
        *delivery.transport.lock().await = Some(delivery.build_transport().unwrap());
        delivery.after_job().await;
        assert!(delivery.transport.lock().await.is_some());

        delivery.close().await;
        assert!(delivery.transport.lock().await.is_none());
    }

    #[test]
    fn message_carries_subject_and_plain_text_body() {
        let delivery = EmailDelivery::new(&provider()).unwrap();
        let message = delivery
            .message(&OutboundJob::new("ops@example.com", "Sender: +1@gsm\nMessage:\nhi"))
            .unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("Subject: SMS Gateway Notification"));
        assert!(raw.contains("To: ops@example.com"));
        assert!(raw.contains("Content-Type: text/plain"));
    }
}
