//! Mailbox and sender adapters.
//!
//! The sync engine only sees the traits below; `imap` and `smtp` provide
//! the network implementations.

pub mod imap;
pub mod parser;
pub mod smtp;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use async_trait::async_trait;

pub use imap::ImapConnector;
pub use smtp::{SmtpSender, SmtpSenderPool};
pub use types::{FetchedMail, InboundEmail, MailEndpoint, MailError, OutgoingMail, SendReceipt};

/// Creates mailbox handles for a department's IMAP endpoint.
pub trait MailboxConnector: Send + Sync {
    /// Build a handle without touching the network.
    fn mailbox(&self, endpoint: &MailEndpoint) -> Box<dyn Mailbox>;
}

/// One IMAP mailbox, used for a single fetch/mark cycle and then released.
#[async_trait]
pub trait Mailbox: Send {
    async fn connect(&mut self) -> Result<(), MailError>;
    /// Select a mailbox and return its message count.
    async fn select_mailbox(&mut self, name: &str) -> Result<u32, MailError>;
    async fn fetch_unseen(&mut self) -> Result<Vec<FetchedMail>, MailError>;
    async fn mark_seen(&mut self, uid: u32) -> Result<(), MailError>;
    async fn disconnect(&mut self);
}

#[async_trait]
pub trait MailSender: Send + Sync {
    async fn verify(&self) -> Result<bool, MailError>;
    async fn send(&self, mail: &OutgoingMail) -> Result<SendReceipt, MailError>;
}

/// Hands out a sender for a department's SMTP endpoint.
#[async_trait]
pub trait SenderFactory: Send + Sync {
    async fn sender(
        &self,
        department_id: i64,
        endpoint: &MailEndpoint,
        from_name: &str,
    ) -> Result<Arc<dyn MailSender>, MailError>;
}
