use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::{ContentType, HeaderName, HeaderValue};
use lettre::message::{Mailbox as Recipient, MultiPart};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use sha2::{Digest, Sha256};

use super::types::{MailEndpoint, MailError, OutgoingMail, SendReceipt};
use super::{MailSender, SenderFactory};
use crate::constants::{IMAP_TIMEOUT_SECS, SMTP_CACHE_MAX_CAPACITY, SMTP_CACHE_TTL_SECS};

pub struct SmtpSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Recipient,
}

impl SmtpSender {
    pub fn new(endpoint: &MailEndpoint, from_name: &str) -> Result<Self, MailError> {
        let creds = Credentials::new(endpoint.user.clone(), endpoint.password.clone());

        // Implicit TLS when flagged secure, STARTTLS otherwise
        let builder = if endpoint.secure {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&endpoint.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&endpoint.host)
        }
        .map_err(|e| MailError::Smtp(format!("Failed to create SMTP transport: {}", e)))?;

        let transport = builder
            .port(endpoint.port)
            .credentials(creds)
            .authentication(vec![Mechanism::Plain, Mechanism::Login])
            .timeout(Some(Duration::from_secs(IMAP_TIMEOUT_SECS)))
            .build();

        let address: Address = endpoint
            .user
            .parse()
            .map_err(|e| MailError::Config(format!("invalid sender address '{}': {}", endpoint.user, e)))?;

        Ok(Self {
            transport,
            from: Recipient::new(Some(from_name.to_string()), address),
        })
    }

    fn build_message(&self, mail: &OutgoingMail, message_id: &str) -> Result<Message, MailError> {
        let to: Recipient = mail
            .to
            .parse()
            .map_err(|e| MailError::Config(format!("Invalid recipient address {}: {}", mail.to, e)))?;

        let mut builder = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(mail.subject.clone())
            .message_id(Some(message_id.to_string()));

        if let Some(ref reply_to) = mail.in_reply_to {
            builder = builder.in_reply_to(reply_to.clone());
        }

        if let Some(ref references) = mail.references {
            builder = builder.references(references.clone());
        }

        for (name, value) in &mail.headers {
            match HeaderName::new_from_ascii(name.clone()) {
                Ok(header) => builder = builder.raw_header(HeaderValue::new(header, value.clone())),
                Err(e) => tracing::warn!("Skipping invalid header {}: {}", name, e),
            }
        }

        let message = match (&mail.text, &mail.html) {
            (Some(text), Some(html)) => {
                builder.multipart(MultiPart::alternative_plain_html(text.clone(), html.clone()))
            }
            (None, Some(html)) => builder.header(ContentType::TEXT_HTML).body(html.clone()),
            (text, None) => builder
                .header(ContentType::TEXT_PLAIN)
                .body(text.clone().unwrap_or_default()),
        };

        message.map_err(|e| MailError::Smtp(format!("Failed to build email message: {}", e)))
    }
}

#[async_trait]
impl MailSender for SmtpSender {
    async fn verify(&self) -> Result<bool, MailError> {
        self.transport
            .test_connection()
            .await
            .map_err(|e| MailError::Smtp(e.to_string()))
    }

    async fn send(&self, mail: &OutgoingMail) -> Result<SendReceipt, MailError> {
        let message_id = generate_message_id(self.from.email.domain());
        let message = self.build_message(mail, &message_id)?;

        self.transport
            .send(message)
            .await
            .map_err(|e| MailError::Smtp(format!("Failed to send email: {}", e)))?;

        tracing::info!("Email sent to {} ({})", mail.to, message_id);
        Ok(SendReceipt { message_id })
    }
}

fn generate_message_id(domain: &str) -> String {
    let mut bytes = [0u8; 16];
    if getrandom::fill(&mut bytes).is_err() {
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        bytes[..8].copy_from_slice(&nanos.to_le_bytes());
    }
    let id: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!("<{}@{}>", id, domain)
}

/// Cache key: department plus a fingerprint of its SMTP settings, so an
/// edited department gets a fresh transport.
type SenderKey = (i64, String);

/// Hands out one SMTP transport per department, cached with moka.
pub struct SmtpSenderPool {
    cache: moka::future::Cache<SenderKey, Arc<SmtpSender>>,
}

impl Default for SmtpSenderPool {
    fn default() -> Self {
        Self::new()
    }
}

impl SmtpSenderPool {
    pub fn new() -> Self {
        Self {
            cache: moka::future::Cache::builder()
                .max_capacity(SMTP_CACHE_MAX_CAPACITY)
                .time_to_live(Duration::from_secs(SMTP_CACHE_TTL_SECS))
                .build(),
        }
    }
}

fn fingerprint(endpoint: &MailEndpoint, from_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(endpoint.password.as_bytes());
    let digest = hasher.finalize();
    let secret: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    format!(
        "{}|{}|{}|{}|{}|{}",
        endpoint.host, endpoint.port, endpoint.secure, endpoint.user, from_name, secret
    )
}

#[async_trait]
impl SenderFactory for SmtpSenderPool {
    async fn sender(
        &self,
        department_id: i64,
        endpoint: &MailEndpoint,
        from_name: &str,
    ) -> Result<Arc<dyn MailSender>, MailError> {
        let key = (department_id, fingerprint(endpoint, from_name));
        if let Some(sender) = self.cache.get(&key).await {
            return Ok(sender);
        }

        let sender = Arc::new(SmtpSender::new(endpoint, from_name)?);
        self.cache.insert(key, Arc::clone(&sender)).await;
        tracing::debug!("Created SMTP transport for department {}", department_id);
        Ok(sender)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> MailEndpoint {
        MailEndpoint {
            host: "smtp.example.com".into(),
            port: 587,
            secure: false,
            user: "support@example.com".into(),
            password: "secret".into(),
        }
    }

    #[tokio::test]
    async fn test_build_message_with_headers() {
        let sender = SmtpSender::new(&endpoint(), "Support").unwrap();
        let mail = OutgoingMail {
            to: "customer@example.com".into(),
            subject: "[Ticket #1] Confirmation of receipt".into(),
            text: Some("hello".into()),
            html: Some("<p>hello</p>".into()),
            in_reply_to: Some("<orig@example.com>".into()),
            references: Some("<orig@example.com>".into()),
            headers: vec![("X-Ticket-Number".into(), "#1".into())],
        };

        let message = sender.build_message(&mail, "<id@example.com>").unwrap();
        let formatted = String::from_utf8(message.formatted()).unwrap();
        assert!(formatted.contains("X-Ticket-Number: #1"));
        assert!(formatted.contains("In-Reply-To: <orig@example.com>"));
        assert!(formatted.contains("Message-ID: <id@example.com>"));
    }

    #[tokio::test]
    async fn test_invalid_recipient_is_config_error() {
        let sender = SmtpSender::new(&endpoint(), "Support").unwrap();
        let mail = OutgoingMail {
            to: "not an address".into(),
            subject: "x".into(),
            text: Some("x".into()),
            ..Default::default()
        };
        assert!(matches!(
            sender.build_message(&mail, "<id@example.com>"),
            Err(MailError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_pool_reuses_transport() {
        let pool = SmtpSenderPool::new();
        let a = pool.sender(1, &endpoint(), "Support").await.unwrap();
        let b = pool.sender(1, &endpoint(), "Support").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let mut changed = endpoint();
        changed.password = "rotated".into();
        let c = pool.sender(1, &changed, "Support").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_generated_message_id_shape() {
        let id = generate_message_id("example.com");
        assert!(id.starts_with('<'));
        assert!(id.ends_with("@example.com>"));
    }
}
