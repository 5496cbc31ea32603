use std::borrow::Cow;
use std::fmt;
use std::io;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::retry::ErrorCode;

/// Host and credentials for one mail protocol endpoint.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailEndpoint {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub user: String,
    pub password: String,
}

impl MailEndpoint {
    pub fn has_credentials(&self) -> bool {
        !self.host.trim().is_empty() && !self.user.trim().is_empty() && !self.password.is_empty()
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for MailEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A raw message pulled from the mailbox.
#[derive(Debug, Clone)]
pub struct FetchedMail {
    pub uid: u32,
    pub raw: Vec<u8>,
}

/// The parts of an inbound mail a ticket is built from.
#[derive(Debug, Clone)]
pub struct InboundEmail {
    pub uid: u32,
    pub message_id: String,
    /// True when the mail carried no Message-ID and one was derived.
    pub synthetic_id: bool,
    pub subject: String,
    pub from_addr: String,
    pub from_name: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    /// Extra headers such as `X-Ticket-Number`.
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("IMAP command timed out after {0:?}")]
    Timeout(Duration),
    #[error("IMAP connection lost")]
    ConnectionLost,
    #[error("not connected to mail server")]
    NotConnected,
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("IMAP protocol error: {0}")]
    Protocol(String),
    #[error("SMTP error: {0}")]
    Smtp(String),
    #[error("invalid mail configuration: {0}")]
    Config(String),
}

impl MailError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        MailError::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether the session is unusable after this error.
    pub fn drops_connection(&self) -> bool {
        matches!(
            self,
            MailError::Io { .. }
                | MailError::Timeout(_)
                | MailError::ConnectionLost
                | MailError::NotConnected
        )
    }
}

impl ErrorCode for MailError {
    fn code(&self) -> Cow<'_, str> {
        Cow::Borrowed(match self {
            MailError::Io { source, .. } => io_error_code(source),
            MailError::Timeout(_) => "IMAP_TIMEOUT",
            MailError::ConnectionLost | MailError::NotConnected => "IMAP_CONNECTION_LOST",
            MailError::Auth(_) => "AUTH_FAILED",
            MailError::Protocol(_) => "IMAP_PROTOCOL",
            MailError::Smtp(_) => "SMTP_FAILED",
            MailError::Config(_) => "CONFIG_INVALID",
        })
    }
}

/// Map an I/O failure onto the errno-style codes used for retry decisions.
pub fn io_error_code(error: &io::Error) -> &'static str {
    use io::ErrorKind;

    match error.kind() {
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => "ECONNRESET",
        ErrorKind::ConnectionRefused => "ECONNREFUSED",
        ErrorKind::TimedOut => "ETIMEDOUT",
        ErrorKind::HostUnreachable => "EHOSTUNREACH",
        ErrorKind::NetworkUnreachable => "ENETUNREACH",
        ErrorKind::NotConnected => "IMAP_CONNECTION_LOST",
        _ => {
            // Resolver failures surface as uncategorized errors
            let message = error.to_string().to_lowercase();
            if message.contains("temporary failure in name resolution") {
                "EAI_AGAIN"
            } else if message.contains("lookup")
                || message.contains("name or service not known")
                || message.contains("no such host")
            {
                "ENOTFOUND"
            } else {
                "EIO"
            }
        }
    }
}

impl From<async_imap::error::Error> for MailError {
    fn from(error: async_imap::error::Error) -> Self {
        match error {
            async_imap::error::Error::Io(e) => MailError::io("IMAP I/O", e),
            async_imap::error::Error::ConnectionLost => MailError::ConnectionLost,
            other => MailError::Protocol(other.to_string()),
        }
    }
}
