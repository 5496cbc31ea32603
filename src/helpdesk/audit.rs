//! Ticket audit trail.
//!
//! Lifecycle writers are best-effort: a failed write is logged and dropped so
//! it never fails the ticket mutation that triggered it. Only
//! [`AuditService::append_manual`] reports errors, since there the log entry
//! is the mutation.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::types::{LogKind, Message, NewTicketLog, Priority, TicketLog, TicketSnapshot, TicketStatus};
use crate::constants::MESSAGE_PREVIEW_CHARS;
use crate::store::Store;

const UNASSIGNED: &str = "Unassigned";

/// Who performed an audited action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditContext {
    pub author_name: String,
    pub author_email: String,
    pub author_id: Option<i64>,
}

impl AuditContext {
    pub fn system() -> Self {
        Self {
            author_name: "System".to_string(),
            author_email: "system@helpdesk.local".to_string(),
            author_id: None,
        }
    }

    pub fn user(name: &str, email: &str, id: Option<i64>) -> Self {
        Self {
            author_name: name.to_string(),
            author_email: email.to_string(),
            author_id: id,
        }
    }
}

/// Fields recorded in the CREATION entry.
#[derive(Debug, Clone, Serialize)]
pub struct CreationSnapshot {
    pub subject: String,
    pub priority: Priority,
    pub status: TicketStatus,
    pub requester: String,
}

/// Human label for a raw field value, used when rendering logs.
pub fn display_value(field: &str, value: &str) -> String {
    match field {
        "status" => TicketStatus::parse(value)
            .map(|s| s.label().to_string())
            .unwrap_or_else(|| value.to_string()),
        "priority" => Priority::parse(value)
            .map(|p| p.label().to_string())
            .unwrap_or_else(|| value.to_string()),
        _ => value.to_string(),
    }
}

fn entry(
    kind: LogKind,
    description: String,
    previous_value: Option<String>,
    new_value: Option<String>,
    ctx: &AuditContext,
) -> NewTicketLog {
    NewTicketLog {
        kind,
        description,
        previous_value,
        new_value,
        author_name: ctx.author_name.clone(),
        author_email: ctx.author_email.clone(),
        author_id: ctx.author_id,
    }
}

fn change(kind: LogKind, label: &str, old: String, new: String, ctx: &AuditContext) -> NewTicketLog {
    entry(
        kind,
        format!("{} changed from \"{}\" to \"{}\"", label, old, new),
        Some(old),
        Some(new),
        ctx,
    )
}

/// One entry per changed field of the watch-list.
pub fn diff_snapshots(old: &TicketSnapshot, new: &TicketSnapshot, ctx: &AuditContext) -> Vec<NewTicketLog> {
    let mut entries = Vec::new();

    if old.status != new.status {
        entries.push(change(
            LogKind::StatusChanged,
            "Status",
            old.status.as_str().to_string(),
            new.status.as_str().to_string(),
            ctx,
        ));
    }
    if old.priority != new.priority {
        entries.push(change(
            LogKind::PriorityChanged,
            "Priority",
            old.priority.as_str().to_string(),
            new.priority.as_str().to_string(),
            ctx,
        ));
    }

    let old_owner = old.owner.as_deref().unwrap_or(UNASSIGNED);
    let new_owner = new.owner.as_deref().unwrap_or(UNASSIGNED);
    if old_owner != new_owner {
        entries.push(change(
            LogKind::OwnerChanged,
            "Owner",
            old_owner.to_string(),
            new_owner.to_string(),
            ctx,
        ));
    }

    if old.subject != new.subject {
        entries.push(change(
            LogKind::SubjectChanged,
            "Subject",
            old.subject.clone(),
            new.subject.clone(),
            ctx,
        ));
    }
    if old.description != new.description {
        entries.push(entry(
            LogKind::DescriptionChanged,
            "Description changed".to_string(),
            Some(old.description.clone()),
            Some(new.description.clone()),
            ctx,
        ));
    }

    entries
}

fn preview(content: &str) -> String {
    if content.chars().count() > MESSAGE_PREVIEW_CHARS {
        let cut: String = content.chars().take(MESSAGE_PREVIEW_CHARS).collect();
        format!("{}...", cut)
    } else {
        content.to_string()
    }
}

#[derive(Clone)]
pub struct AuditService {
    store: Store,
}

impl AuditService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    async fn write(&self, ticket_id: i64, entry: NewTicketLog) {
        if let Err(e) = self.store.append_log(ticket_id, &entry).await {
            tracing::error!(
                "Failed to write {} log for ticket {}: {:#}",
                entry.kind,
                ticket_id,
                e
            );
        }
    }

    pub async fn log_ticket_creation(&self, ticket_id: i64, snapshot: &CreationSnapshot, ctx: &AuditContext) {
        let value = match serde_json::to_string(snapshot) {
            Ok(json) => Some(json),
            Err(e) => {
                tracing::warn!("Failed to serialize creation snapshot: {}", e);
                None
            }
        };
        self.write(
            ticket_id,
            entry(LogKind::Creation, "Ticket created".to_string(), None, value, ctx),
        )
        .await;
    }

    pub async fn log_ticket_update(
        &self,
        ticket_id: i64,
        old: &TicketSnapshot,
        new: &TicketSnapshot,
        ctx: &AuditContext,
    ) {
        for entry in diff_snapshots(old, new, ctx) {
            self.write(ticket_id, entry).await;
        }
    }

    pub async fn log_message_added(&self, ticket_id: i64, message: &Message, ctx: &AuditContext) {
        self.write(
            ticket_id,
            entry(
                LogKind::MessageAdded,
                format!("New {} message added", message.visibility.label()),
                None,
                Some(preview(&message.content)),
                ctx,
            ),
        )
        .await;
    }

    pub async fn log_ticket_closure(&self, ticket_id: i64, at: DateTime<Utc>, ctx: &AuditContext) {
        self.write(
            ticket_id,
            entry(
                LogKind::Closure,
                "Ticket closed".to_string(),
                None,
                Some(at.to_rfc3339()),
                ctx,
            ),
        )
        .await;
    }

    pub async fn log_ticket_reopening(&self, ticket_id: i64, at: DateTime<Utc>, ctx: &AuditContext) {
        self.write(
            ticket_id,
            entry(
                LogKind::Reopening,
                "Ticket reopened".to_string(),
                None,
                Some(at.to_rfc3339()),
                ctx,
            ),
        )
        .await;
    }

    /// A ticket forwarded to another department.
    pub async fn log_forward(&self, ticket_id: i64, from: &str, to: &str, ctx: &AuditContext) {
        self.write(
            ticket_id,
            change(
                LogKind::OwnerChanged,
                "Department",
                from.to_string(),
                to.to_string(),
                ctx,
            ),
        )
        .await;
    }

    /// Write a caller-supplied entry. Errors are returned.
    pub async fn append_manual(&self, ticket_id: i64, entry: &NewTicketLog) -> anyhow::Result<TicketLog> {
        self.store.append_log(ticket_id, entry).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helpdesk::types::{ContentType, Visibility};
    use crate::store::fixtures;

    fn snapshot(status: TicketStatus, priority: Priority) -> TicketSnapshot {
        TicketSnapshot {
            status,
            priority,
            owner: None,
            subject: "Printer offline".into(),
            description: "It stopped".into(),
        }
    }

    #[test]
    fn test_diff_status_and_priority() {
        let ctx = AuditContext::system();
        let entries = diff_snapshots(
            &snapshot(TicketStatus::Open, Priority::Medium),
            &snapshot(TicketStatus::Resolved, Priority::High),
            &ctx,
        );

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, LogKind::StatusChanged);
        assert_eq!(entries[0].previous_value.as_deref(), Some("OPEN"));
        assert_eq!(entries[0].new_value.as_deref(), Some("RESOLVED"));
        assert_eq!(entries[0].description, "Status changed from \"OPEN\" to \"RESOLVED\"");
        assert_eq!(entries[1].kind, LogKind::PriorityChanged);
        assert_eq!(entries[1].previous_value.as_deref(), Some("MEDIUM"));
        assert_eq!(entries[1].new_value.as_deref(), Some("HIGH"));
        assert_eq!(entries[1].author_name, "System");
    }

    #[test]
    fn test_diff_owner_uses_display_name() {
        let ctx = AuditContext::system();
        let old = snapshot(TicketStatus::Open, Priority::Medium);
        let mut new = old.clone();
        new.owner = Some("Ana Costa".into());

        let entries = diff_snapshots(&old, &new, &ctx);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, LogKind::OwnerChanged);
        assert_eq!(entries[0].previous_value.as_deref(), Some("Unassigned"));
        assert_eq!(entries[0].new_value.as_deref(), Some("Ana Costa"));

        assert!(diff_snapshots(&new, &new, &ctx).is_empty());
    }

    #[test]
    fn test_display_value_and_preview() {
        assert_eq!(display_value("status", "IN_PROGRESS"), "In progress");
        assert_eq!(display_value("priority", "URGENT"), "Urgent");
        assert_eq!(display_value("subject", "Hello"), "Hello");

        let long = "a".repeat(150);
        let short = preview(&long);
        assert_eq!(short.chars().count(), 103);
        assert!(short.ends_with("..."));
    }

    #[tokio::test]
    async fn test_creation_and_message_entries() {
        let store = Store::open_in_memory().await.unwrap();
        let dept = fixtures::department(&store, "Support").await;
        let ticket = fixtures::ticket(&store, dept.id, "m1").await;
        let audit = AuditService::new(store.clone());
        let ctx = AuditContext::system();

        audit
            .log_ticket_creation(
                ticket.id,
                &CreationSnapshot {
                    subject: ticket.subject.clone(),
                    priority: ticket.priority,
                    status: ticket.status,
                    requester: ticket.requester_email.clone(),
                },
                &ctx,
            )
            .await;

        let message = Message {
            id: 1,
            ticket_id: ticket.id,
            content: "Restarted the spooler".into(),
            content_type: ContentType::Text,
            visibility: Visibility::Internal,
            sender_name: "Ana".into(),
            sender_email: "ana@helpdesk.local".into(),
            author_id: None,
            email_message_id: None,
            created_at: Utc::now(),
            edited_at: None,
        };
        audit.log_message_added(ticket.id, &message, &ctx).await;

        let logs = store.list_logs(ticket.id, None, 10, 0).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].kind, LogKind::MessageAdded);
        assert_eq!(logs[0].description, "New internal message added");

        let creation = &logs[1];
        assert_eq!(creation.kind, LogKind::Creation);
        let value: serde_json::Value =
            serde_json::from_str(creation.new_value.as_deref().unwrap()).unwrap();
        assert_eq!(value["priority"], "MEDIUM");
        assert_eq!(value["status"], "OPEN");
        assert_eq!(value["requester"], "maria@example.com");
    }

    #[tokio::test]
    async fn test_lifecycle_write_failure_is_swallowed() {
        let store = Store::open_in_memory().await.unwrap();
        let audit = AuditService::new(store.clone());

        // No such ticket: the foreign key rejects the row, the writer logs it
        audit
            .log_ticket_closure(4242, Utc::now(), &AuditContext::system())
            .await;
        assert_eq!(store.count_logs(4242, None).await.unwrap(), 0);

        let manual = entry(
            LogKind::AttachmentAdded,
            "invoice.pdf".into(),
            None,
            None,
            &AuditContext::system(),
        );
        assert!(audit.append_manual(4242, &manual).await.is_err());
    }
}
