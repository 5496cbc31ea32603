//! Email-to-ticket synchronization.
//!
//! Each department pass opens one mailbox session, fetches unseen mail
//! through the retry manager, turns every new message into a ticket, marks
//! it read, and finally stamps the department's `last_sync`. Departments
//! run one after another and a failing department never stops the others.

pub mod worker;

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::constants::INBOX;
use crate::helpdesk::audit::CreationSnapshot;
use crate::helpdesk::types::{ContentType, Department, NewMessage, NewTicket, Ticket, Visibility};
use crate::helpdesk::{AuditContext, AuditService, ClientAssociation, classify_priority, reply};
use crate::mail::parser::parse_inbound;
use crate::mail::{FetchedMail, InboundEmail, Mailbox, MailboxConnector, MailError, SenderFactory};
use crate::retry::{RetryError, RetryManager};
use crate::store::{Store, TicketInsert};

pub use worker::{WorkerCommand, WorkerEvent, WorkerHandle, WorkerSettings, spawn_worker};

type SharedMailbox = Arc<Mutex<Box<dyn Mailbox>>>;

#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Create a customer when a requester matches none.
    pub create_customers: bool,
    /// Send an acknowledgement for each new ticket when the department has
    /// SMTP credentials.
    pub auto_reply: bool,
    pub mailbox: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            create_customers: true,
            auto_reply: true,
            mailbox: INBOX.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("department {0} not found")]
    DepartmentNotFound(i64),

    #[error("department {0} has no {1} credentials")]
    MissingCredentials(i64, &'static str),

    #[error(transparent)]
    Retry(#[from] RetryError<MailError>),

    #[error("mailbox error: {0}")]
    Mailbox(MailError),

    #[error("smtp error: {0}")]
    Smtp(MailError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Inactive,
    SyncDisabled,
    MissingCredentials,
    /// The department's retry key is blocked.
    CircuitOpen,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::Inactive => "department inactive",
            SkipReason::SyncDisabled => "sync disabled",
            SkipReason::MissingCredentials => "IMAP credentials missing",
            SkipReason::CircuitOpen => "blocked after repeated failures",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum Outcome {
    Synced,
    Skipped(SkipReason),
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct DepartmentReport {
    pub department_id: i64,
    pub name: String,
    pub outcome: Outcome,
    pub fetched: usize,
    /// Display numbers of the tickets opened in this pass.
    pub created: Vec<String>,
    pub duplicates: usize,
    /// Per-message failures; the pass itself may still count as synced.
    pub errors: Vec<String>,
}

impl DepartmentReport {
    fn new(department: &Department) -> Self {
        Self {
            department_id: department.id,
            name: department.display_name(),
            outcome: Outcome::Synced,
            fetched: 0,
            created: Vec::new(),
            duplicates: 0,
            errors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Messages fetched across all departments.
    pub processed: usize,
    pub tickets_created: Vec<String>,
    pub departments: Vec<DepartmentReport>,
}

impl SyncReport {
    fn from_departments(started_at: DateTime<Utc>, departments: Vec<DepartmentReport>) -> Self {
        Self {
            started_at,
            finished_at: Utc::now(),
            processed: departments.iter().map(|d| d.fetched).sum(),
            tickets_created: departments
                .iter()
                .flat_map(|d| d.created.iter().cloned())
                .collect(),
            departments,
        }
    }

    /// Department failures and per-message errors, prefixed by department.
    pub fn errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for dept in &self.departments {
            if let Outcome::Failed(message) = &dept.outcome {
                errors.push(format!("{}: {}", dept.name, message));
            }
            errors.extend(dept.errors.iter().map(|e| format!("{}: {}", dept.name, e)));
        }
        errors
    }
}

enum MailOutcome {
    Created(Box<Ticket>, String),
    Duplicate,
    Unparseable,
}

fn bracketed(message_id: &str) -> String {
    format!("<{}>", message_id.trim().trim_start_matches('<').trim_end_matches('>'))
}

pub struct SyncEngine {
    store: Store,
    retry: Arc<RetryManager>,
    connector: Arc<dyn MailboxConnector>,
    senders: Arc<dyn SenderFactory>,
    audit: AuditService,
    clients: ClientAssociation,
    settings: SyncSettings,
}

impl SyncEngine {
    pub fn new(
        store: Store,
        retry: Arc<RetryManager>,
        connector: Arc<dyn MailboxConnector>,
        senders: Arc<dyn SenderFactory>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            audit: AuditService::new(store.clone()),
            clients: ClientAssociation::new(store.clone()),
            store,
            retry,
            connector,
            senders,
            settings,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn retry(&self) -> &Arc<RetryManager> {
        &self.retry
    }

    /// Sync every department, in id order.
    pub async fn run_once(&self) -> Result<SyncReport> {
        let started_at = Utc::now();
        let departments = self.store.list_departments().await?;

        let mut reports = Vec::with_capacity(departments.len());
        for department in &departments {
            reports.push(self.sync(department).await);
        }

        let report = SyncReport::from_departments(started_at, reports);
        tracing::info!(
            "Sync run finished: {} messages, {} tickets created",
            report.processed,
            report.tickets_created.len()
        );
        Ok(report)
    }

    /// Sync enabled departments whose interval has elapsed at `now`.
    pub async fn sync_due(&self, now: DateTime<Utc>) -> Result<SyncReport> {
        let started_at = Utc::now();
        let departments = self.store.list_departments().await?;

        let mut reports = Vec::new();
        for department in departments
            .iter()
            .filter(|d| d.active && d.sync_enabled && d.is_due(now))
        {
            reports.push(self.sync(department).await);
        }
        Ok(SyncReport::from_departments(started_at, reports))
    }

    pub async fn sync_department(&self, id: i64) -> Result<DepartmentReport, SyncError> {
        let department = self.department(id).await?;
        Ok(self.sync(&department).await)
    }

    async fn department(&self, id: i64) -> Result<Department, SyncError> {
        self.store
            .get_department(id)
            .await?
            .ok_or(SyncError::DepartmentNotFound(id))
    }

    fn skip_reason(&self, department: &Department) -> Option<SkipReason> {
        if !department.active {
            Some(SkipReason::Inactive)
        } else if !department.sync_enabled {
            Some(SkipReason::SyncDisabled)
        } else if !department.imap.has_credentials() {
            Some(SkipReason::MissingCredentials)
        } else if self.retry.is_blocked(&department.retry_key()) {
            Some(SkipReason::CircuitOpen)
        } else {
            None
        }
    }

    async fn sync(&self, department: &Department) -> DepartmentReport {
        let mut report = DepartmentReport::new(department);

        if let Some(reason) = self.skip_reason(department) {
            tracing::info!("Skipping {}: {}", department.display_name(), reason);
            report.outcome = Outcome::Skipped(reason);
            return report;
        }

        tracing::info!("Syncing {}", department.display_name());
        if let Err(e) = self.pass(department, &mut report).await {
            tracing::error!("Sync of {} failed: {}", department.display_name(), e);
            report.outcome = Outcome::Failed(e.to_string());
        } else {
            tracing::info!(
                "Synced {}: {} fetched, {} created, {} duplicates",
                department.display_name(),
                report.fetched,
                report.created.len(),
                report.duplicates
            );
        }
        report
    }

    async fn pass(&self, department: &Department, report: &mut DepartmentReport) -> Result<(), SyncError> {
        let key = department.retry_key();
        let mailbox: SharedMailbox = Arc::new(Mutex::new(self.connector.mailbox(&department.imap)));

        let fetched = self.fetch(&key, &mailbox).await;
        let fetched = match fetched {
            Ok(mails) => mails,
            Err(e) => {
                mailbox.lock().await.disconnect().await;
                return Err(e.into());
            }
        };
        report.fetched = fetched.len();

        let result = self.process_all(department, &key, &mailbox, fetched, report).await;
        mailbox.lock().await.disconnect().await;
        result?;

        self.store.set_last_sync(department.id, Utc::now()).await?;
        Ok(())
    }

    async fn fetch(&self, key: &str, mailbox: &SharedMailbox) -> Result<Vec<FetchedMail>, RetryError<MailError>> {
        let name = self.settings.mailbox.as_str();
        self.retry
            .execute_with_retry(key, || {
                let mailbox = Arc::clone(mailbox);
                async move {
                    let mut mailbox = mailbox.lock().await;
                    mailbox.connect().await?;
                    mailbox.select_mailbox(name).await?;
                    mailbox.fetch_unseen().await
                }
            })
            .await
    }

    async fn mark_seen(&self, key: &str, mailbox: &SharedMailbox, uid: u32) -> Result<(), RetryError<MailError>> {
        self.retry
            .execute_with_retry(key, || {
                let mailbox = Arc::clone(mailbox);
                async move { mailbox.lock().await.mark_seen(uid).await }
            })
            .await
    }

    async fn process_all(
        &self,
        department: &Department,
        key: &str,
        mailbox: &SharedMailbox,
        fetched: Vec<FetchedMail>,
        report: &mut DepartmentReport,
    ) -> Result<(), SyncError> {
        for mail in fetched {
            let uid = mail.uid;
            let outcome = match self.process_mail(department, mail).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    // Left unread so the next pass picks it up again
                    tracing::error!("Failed to process message {}: {}", uid, e);
                    report.errors.push(format!("message {}: {}", uid, e));
                    continue;
                }
            };

            let created = match outcome {
                MailOutcome::Unparseable => {
                    tracing::warn!("Message {} has no sender address, leaving it unread", uid);
                    report.errors.push(format!("message {}: no sender address", uid));
                    continue;
                }
                MailOutcome::Duplicate => {
                    report.duplicates += 1;
                    None
                }
                MailOutcome::Created(ticket, message_id) => {
                    report.created.push(ticket.display_number.clone());
                    Some((ticket, message_id))
                }
            };

            match self.mark_seen(key, mailbox, uid).await {
                Ok(()) => {}
                Err(RetryError::Permanent(e)) => {
                    tracing::warn!("Failed to mark message {} as read: {}", uid, e);
                    report.errors.push(format!("message {}: {}", uid, e));
                }
                Err(e) => return Err(e.into()),
            }

            if let Some((ticket, message_id)) = created {
                self.send_acknowledgement(department, &ticket, &message_id)
                    .await;
            }
        }
        Ok(())
    }

    async fn process_mail(&self, department: &Department, mail: FetchedMail) -> Result<MailOutcome, SyncError> {
        let Some(email) = parse_inbound(mail.uid, &mail.raw) else {
            return Ok(MailOutcome::Unparseable);
        };

        if self
            .store
            .find_ticket_by_message_id(department.id, &email.message_id)
            .await?
            .is_some()
        {
            tracing::debug!("Message {} already has a ticket", email.message_id);
            return Ok(MailOutcome::Duplicate);
        }

        let priority = classify_priority(&email.subject, &email.body);
        let customer_id = self.resolve_customer(&email).await;

        let new = NewTicket {
            department_id: department.id,
            sequence_prefix: department.sequence_prefix.clone(),
            subject: email.subject.clone(),
            description: email.body.clone(),
            priority,
            requester_name: email.from_name.clone(),
            requester_email: email.from_addr.clone(),
            requester_phone: None,
            customer_id,
            email_message_id: Some(email.message_id.clone()),
            email_uid: Some(email.uid),
        };
        let first = NewMessage {
            content: email.body.clone(),
            content_type: ContentType::Text,
            visibility: Visibility::Public,
            sender_name: email.from_name.clone(),
            sender_email: email.from_addr.clone(),
            author_id: None,
            email_message_id: Some(email.message_id.clone()),
        };

        let ticket = match self.store.create_ticket(&new, &first).await? {
            TicketInsert::Created(ticket) => ticket,
            TicketInsert::Duplicate => {
                tracing::debug!("Message {} was imported concurrently", email.message_id);
                return Ok(MailOutcome::Duplicate);
            }
        };

        self.audit
            .log_ticket_creation(
                ticket.id,
                &CreationSnapshot {
                    subject: ticket.subject.clone(),
                    priority: ticket.priority,
                    status: ticket.status,
                    requester: ticket.requester_email.clone(),
                },
                &AuditContext::system(),
            )
            .await;

        tracing::info!(
            "Created ticket {} ({}) from {}{}",
            ticket.display_number,
            ticket.priority,
            email.from_addr,
            if email.synthetic_id { " (no Message-ID)" } else { "" }
        );

        Ok(MailOutcome::Created(Box::new(ticket), email.message_id))
    }

    async fn resolve_customer(&self, email: &InboundEmail) -> Option<i64> {
        let association = self
            .clients
            .resolve(
                Some(&email.from_addr),
                None,
                Some(&email.from_name),
                self.settings.create_customers,
            )
            .await;
        match association {
            Ok(association) => association.customer_id(),
            Err(e) => {
                tracing::warn!("Customer lookup for {} failed: {}", email.from_addr, e);
                None
            }
        }
    }

    /// Best effort: failures are logged and never touch the IMAP retry key.
    async fn send_acknowledgement(&self, department: &Department, ticket: &Ticket, message_id: &str) {
        if !self.settings.auto_reply || !department.smtp.has_credentials() {
            return;
        }

        let mail = reply::acknowledgement(ticket, department, &bracketed(message_id));
        let sender = match self
            .senders
            .sender(department.id, &department.smtp, &department.display_name())
            .await
        {
            Ok(sender) => sender,
            Err(e) => {
                tracing::warn!("No SMTP sender for {}: {}", department.display_name(), e);
                return;
            }
        };

        match sender.send(&mail).await {
            Ok(receipt) => {
                let system = AuditContext::system();
                let note = NewMessage::internal_note(
                    format!(
                        "Automatic confirmation email sent to {} ({})",
                        ticket.requester_email, receipt.message_id
                    ),
                    &system.author_name,
                    &system.author_email,
                );
                if let Err(e) = self.store.insert_message(ticket.id, &note).await {
                    tracing::warn!("Failed to record acknowledgement for {}: {}", ticket.display_number, e);
                }
            }
            Err(e) => {
                tracing::warn!("Acknowledgement for {} failed: {}", ticket.display_number, e);
            }
        }
    }

    /// Connect, select and log out. On success the department's retry key
    /// is reset, lifting a blocked circuit. Returns the mailbox size.
    pub async fn check_department(&self, id: i64) -> Result<u32, SyncError> {
        let department = self.department(id).await?;
        if !department.imap.has_credentials() {
            return Err(SyncError::MissingCredentials(id, "IMAP"));
        }

        let mut mailbox = self.connector.mailbox(&department.imap);
        let result = async {
            mailbox.connect().await?;
            mailbox.select_mailbox(&self.settings.mailbox).await
        }
        .await;
        mailbox.disconnect().await;

        let count = result.map_err(SyncError::Mailbox)?;
        self.retry.reset_retry_state(&department.retry_key());
        tracing::info!("Probe of {} succeeded ({} messages)", department.display_name(), count);
        Ok(count)
    }

    pub async fn verify_smtp(&self, id: i64) -> Result<bool, SyncError> {
        let department = self.department(id).await?;
        if !department.smtp.has_credentials() {
            return Err(SyncError::MissingCredentials(id, "SMTP"));
        }

        let sender = self
            .senders
            .sender(department.id, &department.smtp, &department.display_name())
            .await
            .map_err(SyncError::Smtp)?;
        sender.verify().await.map_err(SyncError::Smtp)
    }
}
