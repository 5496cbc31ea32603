//! In-memory mailbox and sender doubles for tests.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::types::{FetchedMail, MailEndpoint, MailError, OutgoingMail, SendReceipt};
use super::{Mailbox, MailboxConnector, MailSender, SenderFactory};

pub fn raw_mail(message_id: Option<&str>, from: &str, subject: &str, body: &str) -> Vec<u8> {
    let mut raw = format!(
        "From: {}\r\nTo: support@example.com\r\nSubject: {}\r\nDate: Mon, 1 Jan 2024 12:00:00 +0000\r\n",
        from, subject
    );
    if let Some(id) = message_id {
        raw.push_str(&format!("Message-ID: <{}>\r\n", id));
    }
    raw.push_str("\r\n");
    raw.push_str(body);
    raw.into_bytes()
}

#[derive(Default)]
struct ServerState {
    inbox: HashMap<String, Vec<(u32, Vec<u8>)>>,
    seen: HashSet<(String, u32)>,
    connects: HashMap<String, u32>,
    transient_failures: HashMap<String, u32>,
    rejected_logins: HashSet<String>,
}

/// Mail server keyed by IMAP host.
#[derive(Clone, Default)]
pub struct FakeMailServer {
    state: Arc<Mutex<ServerState>>,
}

impl FakeMailServer {
    fn state(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }

    pub fn deliver(&self, host: &str, uid: u32, raw: Vec<u8>) {
        self.state()
            .inbox
            .entry(host.to_string())
            .or_default()
            .push((uid, raw));
    }

    pub fn connect_count(&self, host: &str) -> u32 {
        self.state().connects.get(host).copied().unwrap_or(0)
    }

    pub fn is_seen(&self, host: &str, uid: u32) -> bool {
        self.state().seen.contains(&(host.to_string(), uid))
    }

    /// Clear `\Seen` flags, as if the messages were marked unread again.
    pub fn mark_all_unseen(&self) {
        self.state().seen.clear();
    }

    pub fn fail_next_connects(&self, host: &str, count: u32) {
        self.state()
            .transient_failures
            .insert(host.to_string(), count);
    }

    pub fn reject_login(&self, host: &str) {
        self.state().rejected_logins.insert(host.to_string());
    }
}

impl MailboxConnector for FakeMailServer {
    fn mailbox(&self, endpoint: &MailEndpoint) -> Box<dyn Mailbox> {
        Box::new(FakeMailbox {
            server: self.clone(),
            host: endpoint.host.clone(),
            connected: false,
        })
    }
}

struct FakeMailbox {
    server: FakeMailServer,
    host: String,
    connected: bool,
}

#[async_trait]
impl Mailbox for FakeMailbox {
    async fn connect(&mut self) -> Result<(), MailError> {
        if self.connected {
            return Ok(());
        }
        let mut state = self.server.state();
        *state.connects.entry(self.host.clone()).or_default() += 1;

        if let Some(remaining) = state.transient_failures.get_mut(&self.host)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(MailError::io(
                "connect",
                io::Error::from(io::ErrorKind::ConnectionReset),
            ));
        }
        if state.rejected_logins.contains(&self.host) {
            return Err(MailError::Auth("invalid credentials".into()));
        }
        self.connected = true;
        Ok(())
    }

    async fn select_mailbox(&mut self, _name: &str) -> Result<u32, MailError> {
        self.connect().await?;
        let state = self.server.state();
        Ok(state.inbox.get(&self.host).map(|m| m.len() as u32).unwrap_or(0))
    }

    async fn fetch_unseen(&mut self) -> Result<Vec<FetchedMail>, MailError> {
        if !self.connected {
            return Err(MailError::NotConnected);
        }
        let state = self.server.state();
        let mails = state
            .inbox
            .get(&self.host)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|(uid, _)| !state.seen.contains(&(self.host.clone(), *uid)))
                    .map(|(uid, raw)| FetchedMail {
                        uid: *uid,
                        raw: raw.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(mails)
    }

    async fn mark_seen(&mut self, uid: u32) -> Result<(), MailError> {
        if !self.connected {
            return Err(MailError::NotConnected);
        }
        self.server.state().seen.insert((self.host.clone(), uid));
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }
}

#[derive(Default)]
struct SenderState {
    sent: Vec<OutgoingMail>,
    failing: bool,
}

/// Records every mail instead of sending it.
#[derive(Clone, Default)]
pub struct FakeSenders {
    state: Arc<Mutex<SenderState>>,
}

impl FakeSenders {
    pub fn sent(&self) -> Vec<OutgoingMail> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.lock().unwrap().failing = failing;
    }
}

#[async_trait]
impl SenderFactory for FakeSenders {
    async fn sender(
        &self,
        _department_id: i64,
        _endpoint: &MailEndpoint,
        _from_name: &str,
    ) -> Result<Arc<dyn MailSender>, MailError> {
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl MailSender for FakeSenders {
    async fn verify(&self) -> Result<bool, MailError> {
        Ok(!self.state.lock().unwrap().failing)
    }

    async fn send(&self, mail: &OutgoingMail) -> Result<SendReceipt, MailError> {
        let mut state = self.state.lock().unwrap();
        if state.failing {
            return Err(MailError::Smtp("relay refused".into()));
        }
        state.sent.push(mail.clone());
        Ok(SendReceipt {
            message_id: format!("<sent-{}@example.com>", state.sent.len()),
        })
    }
}
