use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mail::MailEndpoint;

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal, $label:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            /// Human-readable label used in audit descriptions.
            pub fn label(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }

            pub fn parse(value: &str) -> Option<Self> {
                match value.trim().to_ascii_uppercase().as_str() {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    Open,
    InProgress,
    AwaitingCustomer,
    Resolved,
    Closed,
}

string_enum!(TicketStatus {
    Open => "OPEN", "Open",
    InProgress => "IN_PROGRESS", "In progress",
    AwaitingCustomer => "AWAITING_CUSTOMER", "Awaiting customer",
    Resolved => "RESOLVED", "Resolved",
    Closed => "CLOSED", "Closed",
});

impl TicketStatus {
    /// Resolved and closed tickets count as finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TicketStatus::Resolved | TicketStatus::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

string_enum!(Priority {
    Low => "LOW", "Low",
    Medium => "MEDIUM", "Medium",
    High => "HIGH", "High",
    Urgent => "URGENT", "Urgent",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogKind {
    Creation,
    StatusChanged,
    PriorityChanged,
    OwnerChanged,
    SubjectChanged,
    DescriptionChanged,
    MessageAdded,
    AttachmentAdded,
    Closure,
    Reopening,
}

string_enum!(LogKind {
    Creation => "CREATION", "Creation",
    StatusChanged => "STATUS_CHANGED", "Status changed",
    PriorityChanged => "PRIORITY_CHANGED", "Priority changed",
    OwnerChanged => "OWNER_CHANGED", "Owner changed",
    SubjectChanged => "SUBJECT_CHANGED", "Subject changed",
    DescriptionChanged => "DESCRIPTION_CHANGED", "Description changed",
    MessageAdded => "MESSAGE_ADDED", "Message added",
    AttachmentAdded => "ATTACHMENT_ADDED", "Attachment added",
    Closure => "CLOSURE", "Closure",
    Reopening => "REOPENING", "Reopening",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContentType {
    Text,
    Html,
}

string_enum!(ContentType {
    Text => "TEXT", "Text",
    Html => "HTML", "HTML",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Visibility {
    Public,
    Internal,
}

string_enum!(Visibility {
    Public => "PUBLIC", "public",
    Internal => "INTERNAL", "internal",
});

/// A helpdesk mail source.
#[derive(Debug, Clone)]
pub struct Department {
    pub id: i64,
    pub name: String,
    pub active: bool,
    pub sync_enabled: bool,
    pub sync_interval_secs: u64,
    pub imap: MailEndpoint,
    pub smtp: MailEndpoint,
    pub sequence_prefix: Option<String>,
    pub group_name: Option<String>,
    pub last_sync: Option<DateTime<Utc>>,
}

impl Department {
    pub fn retry_key(&self) -> String {
        format!("imap:{}", self.id)
    }

    /// Whether the department is due for a poll at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_sync {
            None => true,
            Some(last) => {
                let elapsed = now.signed_duration_since(last).num_seconds();
                elapsed >= self.sync_interval_secs as i64
            }
        }
    }

    /// Display name including the parent group, when there is one.
    pub fn display_name(&self) -> String {
        match &self.group_name {
            Some(group) => format!("{} / {}", group, self.name),
            None => self.name.clone(),
        }
    }
}

/// Department fields as written by configuration.
#[derive(Debug, Clone)]
pub struct DepartmentSpec {
    pub name: String,
    pub active: bool,
    pub sync_enabled: bool,
    pub sync_interval_secs: u64,
    pub imap: MailEndpoint,
    pub smtp: MailEndpoint,
    pub sequence_prefix: Option<String>,
    pub group_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Ticket {
    pub id: i64,
    pub number: i64,
    pub display_number: String,
    pub subject: String,
    pub description: String,
    pub status: TicketStatus,
    pub priority: Priority,
    pub requester_name: String,
    pub requester_email: String,
    pub requester_phone: Option<String>,
    pub department_id: i64,
    /// Department whose mailbox the ticket was imported from.
    pub source_department_id: i64,
    pub assignee_id: Option<i64>,
    pub assignee_name: Option<String>,
    pub customer_id: Option<i64>,
    pub closed_at: Option<DateTime<Utc>>,
    pub email_message_id: Option<String>,
    pub email_uid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    pub fn snapshot(&self) -> TicketSnapshot {
        TicketSnapshot {
            status: self.status,
            priority: self.priority,
            owner: self.assignee_name.clone(),
            subject: self.subject.clone(),
            description: self.description.clone(),
        }
    }
}

/// The audited fields of a ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketSnapshot {
    pub status: TicketStatus,
    pub priority: Priority,
    /// Resolved display name of the assignee.
    pub owner: Option<String>,
    pub subject: String,
    pub description: String,
}

/// Everything needed to open a ticket from an inbound mail.
#[derive(Debug, Clone)]
pub struct NewTicket {
    pub department_id: i64,
    pub sequence_prefix: Option<String>,
    pub subject: String,
    pub description: String,
    pub priority: Priority,
    pub requester_name: String,
    pub requester_email: String,
    pub requester_phone: Option<String>,
    pub customer_id: Option<i64>,
    pub email_message_id: Option<String>,
    pub email_uid: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: i64,
    pub ticket_id: i64,
    pub content: String,
    pub content_type: ContentType,
    pub visibility: Visibility,
    pub sender_name: String,
    pub sender_email: String,
    pub author_id: Option<i64>,
    pub email_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub content: String,
    pub content_type: ContentType,
    pub visibility: Visibility,
    pub sender_name: String,
    pub sender_email: String,
    pub author_id: Option<i64>,
    pub email_message_id: Option<String>,
}

impl NewMessage {
    pub fn internal_note(content: impl Into<String>, sender_name: &str, sender_email: &str) -> Self {
        Self {
            content: content.into(),
            content_type: ContentType::Text,
            visibility: Visibility::Internal,
            sender_name: sender_name.to_string(),
            sender_email: sender_email.to_string(),
            author_id: None,
            email_message_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TicketLog {
    pub id: i64,
    pub ticket_id: i64,
    pub kind: LogKind,
    pub description: String,
    pub previous_value: Option<String>,
    pub new_value: Option<String>,
    pub author_name: String,
    pub author_email: String,
    pub author_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTicketLog {
    pub kind: LogKind,
    pub description: String,
    pub previous_value: Option<String>,
    pub new_value: Option<String>,
    pub author_name: String,
    pub author_email: String,
    pub author_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CustomerStatus {
    Lead,
    Prospect,
    Active,
    Inactive,
}

string_enum!(CustomerStatus {
    Lead => "LEAD", "Lead",
    Prospect => "PROSPECT", "Prospect",
    Active => "ACTIVE", "Active",
    Inactive => "INACTIVE", "Inactive",
});

#[derive(Debug, Clone, Serialize)]
pub struct Customer {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub status: CustomerStatus,
    pub notes: Option<String>,
    /// Priority-weighted value of the customer's ticket history.
    pub potential_value: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCustomer {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub status: CustomerStatus,
    pub notes: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_status_round_trip_and_terminal() {
        for status in TicketStatus::ALL {
            assert_eq!(TicketStatus::parse(status.as_str()), Some(*status));
        }
        assert_eq!(TicketStatus::parse("in_progress"), Some(TicketStatus::InProgress));
        assert!(TicketStatus::Resolved.is_terminal());
        assert!(TicketStatus::Closed.is_terminal());
        assert!(!TicketStatus::AwaitingCustomer.is_terminal());
        assert_eq!(TicketStatus::parse("bogus"), None);
    }

    #[test]
    fn test_serde_uses_wire_names() {
        let json = serde_json::to_string(&LogKind::StatusChanged).unwrap();
        assert_eq!(json, "\"STATUS_CHANGED\"");
        let kind: LogKind = serde_json::from_str("\"REOPENING\"").unwrap();
        assert_eq!(kind, LogKind::Reopening);
    }

    #[test]
    fn test_department_due() {
        let now = Utc::now();
        let mut dept = Department {
            id: 1,
            name: "Support".into(),
            active: true,
            sync_enabled: true,
            sync_interval_secs: 300,
            imap: MailEndpoint::default(),
            smtp: MailEndpoint::default(),
            sequence_prefix: None,
            group_name: Some("IT".into()),
            last_sync: None,
        };
        assert!(dept.is_due(now));

        dept.last_sync = Some(now - Duration::seconds(60));
        assert!(!dept.is_due(now));

        dept.last_sync = Some(now - Duration::seconds(301));
        assert!(dept.is_due(now));

        assert_eq!(dept.retry_key(), "imap:1");
        assert_eq!(dept.display_name(), "IT / Support");
    }
}
