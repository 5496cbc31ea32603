//! Ticket mutations that carry audit side effects.

use chrono::Utc;

use super::TicketError;
use super::audit::{AuditContext, AuditService};
use super::types::{Message, NewMessage, Priority, Ticket, TicketStatus};
use crate::store::{MessageInsert, Store};

/// Fields to change on a ticket. `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct TicketUpdate {
    pub status: Option<TicketStatus>,
    pub priority: Option<Priority>,
    /// `Some(None)` unassigns; `Some(Some((id, name)))` assigns.
    pub assignee: Option<Option<(i64, String)>>,
    pub subject: Option<String>,
    pub description: Option<String>,
}

#[derive(Clone)]
pub struct TicketService {
    store: Store,
    audit: AuditService,
}

impl TicketService {
    pub fn new(store: Store, audit: AuditService) -> Self {
        Self { store, audit }
    }

    async fn load(&self, id: i64) -> Result<Ticket, TicketError> {
        self.store
            .get_ticket(id)
            .await?
            .ok_or(TicketError::TicketNotFound(id))
    }

    pub async fn update_ticket(
        &self,
        id: i64,
        update: TicketUpdate,
        ctx: &AuditContext,
    ) -> Result<Ticket, TicketError> {
        let mut ticket = self.load(id).await?;
        let old = ticket.snapshot();
        let now = Utc::now();

        if let Some(status) = update.status {
            ticket.status = status;
        }
        if let Some(priority) = update.priority {
            ticket.priority = priority;
        }
        if let Some(assignee) = update.assignee {
            ticket.assignee_id = assignee.as_ref().map(|(id, _)| *id);
            ticket.assignee_name = assignee.map(|(_, name)| name);
        }
        if let Some(subject) = update.subject {
            let subject = subject.trim().to_string();
            if subject.is_empty() {
                return Err(TicketError::Invalid("subject must not be empty".into()));
            }
            ticket.subject = subject;
        }
        if let Some(description) = update.description {
            ticket.description = description;
        }

        let was_finished = old.status.is_terminal();
        let is_finished = ticket.status.is_terminal();
        if !is_finished {
            ticket.closed_at = None;
        } else if !was_finished {
            ticket.closed_at = Some(now);
        }
        ticket.updated_at = now;

        self.store.save_ticket(&ticket).await?;

        self.audit
            .log_ticket_update(id, &old, &ticket.snapshot(), ctx)
            .await;
        match (was_finished, is_finished) {
            (false, true) => self.audit.log_ticket_closure(id, now, ctx).await,
            (true, false) => self.audit.log_ticket_reopening(id, now, ctx).await,
            _ => {}
        }

        Ok(ticket)
    }

    pub async fn add_message(
        &self,
        ticket_id: i64,
        message: &NewMessage,
        ctx: &AuditContext,
    ) -> Result<Message, TicketError> {
        match self.store.insert_message(ticket_id, message).await? {
            MessageInsert::Inserted(message) => {
                self.audit.log_message_added(ticket_id, &message, ctx).await;
                Ok(message)
            }
            MessageInsert::TicketNotFound => Err(TicketError::TicketNotFound(ticket_id)),
            MessageInsert::TicketClosed => Err(TicketError::Closed(ticket_id)),
        }
    }

    /// Move a ticket to another department.
    pub async fn forward(
        &self,
        ticket_id: i64,
        department_id: i64,
        ctx: &AuditContext,
    ) -> Result<Ticket, TicketError> {
        let ticket = self.load(ticket_id).await?;
        if ticket.department_id == department_id {
            return Ok(ticket);
        }

        let target = self
            .store
            .get_department(department_id)
            .await?
            .ok_or(TicketError::DepartmentNotFound(department_id))?;
        if let Some(message_id) = ticket.email_message_id.as_deref()
            && let Some(sibling) = self
                .store
                .find_ticket_sibling(ticket_id, department_id, message_id)
                .await?
        {
            return Err(TicketError::Conflict(format!(
                "{} already holds ticket {} for the same email",
                target.display_name(),
                sibling.display_number
            )));
        }

        let source_name = match self.store.get_department(ticket.department_id).await? {
            Some(dept) => dept.display_name(),
            None => format!("#{}", ticket.department_id),
        };

        self.store
            .set_ticket_department(ticket_id, department_id)
            .await?;
        self.audit
            .log_forward(ticket_id, &source_name, &target.display_name(), ctx)
            .await;

        tracing::info!(
            "Ticket {} forwarded from {} to {}",
            ticket.display_number,
            source_name,
            target.display_name()
        );

        self.load(ticket_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helpdesk::types::{LogKind, Visibility};
    use crate::store::fixtures;

    async fn service() -> (Store, TicketService) {
        let store = Store::open_in_memory().await.unwrap();
        let service = TicketService::new(store.clone(), AuditService::new(store.clone()));
        (store, service)
    }

    fn status(status: TicketStatus) -> TicketUpdate {
        TicketUpdate {
            status: Some(status),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_closure_logged_once() {
        let (store, service) = service().await;
        let dept = fixtures::department(&store, "Support").await;
        let ticket = fixtures::ticket(&store, dept.id, "m1").await;
        let ctx = AuditContext::system();

        let resolved = service
            .update_ticket(ticket.id, status(TicketStatus::Resolved), &ctx)
            .await
            .unwrap();
        assert!(resolved.closed_at.is_some());

        service
            .update_ticket(ticket.id, status(TicketStatus::Resolved), &ctx)
            .await
            .unwrap();
        let closed = service
            .update_ticket(ticket.id, status(TicketStatus::Closed), &ctx)
            .await
            .unwrap();
        assert_eq!(
            closed.closed_at.map(|t| t.timestamp_millis()),
            resolved.closed_at.map(|t| t.timestamp_millis())
        );

        assert_eq!(
            store
                .count_logs(ticket.id, Some(LogKind::Closure))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .count_logs(ticket.id, Some(LogKind::StatusChanged))
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_reopening_clears_closed_at() {
        let (store, service) = service().await;
        let dept = fixtures::department(&store, "Support").await;
        let ticket = fixtures::ticket(&store, dept.id, "m1").await;
        let ctx = AuditContext::system();

        service
            .update_ticket(ticket.id, status(TicketStatus::Closed), &ctx)
            .await
            .unwrap();
        let reopened = service
            .update_ticket(ticket.id, status(TicketStatus::InProgress), &ctx)
            .await
            .unwrap();
        assert!(reopened.closed_at.is_none());

        service
            .update_ticket(ticket.id, status(TicketStatus::AwaitingCustomer), &ctx)
            .await
            .unwrap();
        assert_eq!(
            store
                .count_logs(ticket.id, Some(LogKind::Reopening))
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_assignment_and_unknown_ticket() {
        let (store, service) = service().await;
        let dept = fixtures::department(&store, "Support").await;
        let ticket = fixtures::ticket(&store, dept.id, "m1").await;
        let ctx = AuditContext::user("Ana Costa", "ana@helpdesk.local", Some(7));

        let update = TicketUpdate {
            assignee: Some(Some((7, "Ana Costa".into()))),
            priority: Some(Priority::Urgent),
            ..Default::default()
        };
        let updated = service.update_ticket(ticket.id, update, &ctx).await.unwrap();
        assert_eq!(updated.assignee_id, Some(7));

        let logs = store.list_logs(ticket.id, None, 10, 0).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|l| l.author_id == Some(7)));
        assert!(logs.iter().any(|l| l.kind == LogKind::OwnerChanged
            && l.new_value.as_deref() == Some("Ana Costa")));

        let missing = service.update_ticket(999, TicketUpdate::default(), &ctx).await;
        assert!(matches!(missing, Err(TicketError::TicketNotFound(999))));
    }

    #[tokio::test]
    async fn test_add_message_respects_closed_guard() {
        let (store, service) = service().await;
        let dept = fixtures::department(&store, "Support").await;
        let ticket = fixtures::ticket(&store, dept.id, "m1").await;
        let ctx = AuditContext::system();

        let mut reply = NewMessage::internal_note("We are on it", "Ana", "ana@helpdesk.local");
        reply.visibility = Visibility::Public;
        service.add_message(ticket.id, &reply, &ctx).await.unwrap();
        assert_eq!(
            store
                .count_logs(ticket.id, Some(LogKind::MessageAdded))
                .await
                .unwrap(),
            1
        );

        service
            .update_ticket(ticket.id, status(TicketStatus::Closed), &ctx)
            .await
            .unwrap();
        let rejected = service.add_message(ticket.id, &reply, &ctx).await;
        assert!(matches!(rejected, Err(TicketError::Closed(_))));
    }

    #[tokio::test]
    async fn test_forward_records_department_names() {
        let (store, service) = service().await;
        let support = fixtures::department(&store, "Support").await;
        let billing = fixtures::department(&store, "Billing").await;
        let ticket = fixtures::ticket(&store, support.id, "m1").await;
        let ctx = AuditContext::system();

        let moved = service.forward(ticket.id, billing.id, &ctx).await.unwrap();
        assert_eq!(moved.department_id, billing.id);

        let logs = store
            .list_logs(ticket.id, Some(LogKind::OwnerChanged), 10, 0)
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].previous_value.as_deref(), Some("Support"));
        assert_eq!(logs[0].new_value.as_deref(), Some("Billing"));

        let missing = service.forward(ticket.id, 999, &ctx).await;
        assert!(matches!(missing, Err(TicketError::DepartmentNotFound(999))));
    }

    #[tokio::test]
    async fn test_forward_rejects_department_holding_same_email() {
        let (store, service) = service().await;
        let support = fixtures::department(&store, "Support").await;
        let billing = fixtures::department(&store, "Billing").await;
        // The same mail was sent to both mailboxes
        let in_support = fixtures::ticket(&store, support.id, "cc-shared").await;
        let in_billing = fixtures::ticket(&store, billing.id, "cc-shared").await;
        let ctx = AuditContext::system();

        let result = service.forward(in_support.id, billing.id, &ctx).await;
        let Err(error) = result else {
            panic!("forward into a department with the same email must fail");
        };
        assert!(matches!(error, TicketError::Conflict(_)));
        assert!(error.to_string().contains(&in_billing.display_number));
        assert_eq!(crate::api::ApiError::from(error).status_code(), 409);

        let unchanged = store.get_ticket(in_support.id).await.unwrap().unwrap();
        assert_eq!(unchanged.department_id, support.id);
        assert_eq!(
            store
                .count_logs(in_support.id, Some(LogKind::OwnerChanged))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_forwarded_ticket_still_dedups_source_mailbox() {
        let (store, service) = service().await;
        let support = fixtures::department(&store, "Support").await;
        let billing = fixtures::department(&store, "Billing").await;
        let ticket = fixtures::ticket(&store, support.id, "m1").await;

        let moved = service
            .forward(ticket.id, billing.id, &AuditContext::system())
            .await
            .unwrap();
        assert_eq!(moved.department_id, billing.id);
        assert_eq!(moved.source_department_id, support.id);

        let found = store
            .find_ticket_by_message_id(support.id, "m1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, ticket.id);

        // A later unseen copy in the support mailbox is a duplicate
        let again = fixtures::new_ticket(support.id, "m1");
        let insert = store
            .create_ticket(&again, &fixtures::first_message(&again))
            .await
            .unwrap();
        assert!(matches!(insert, crate::store::TicketInsert::Duplicate));
        assert_eq!(store.count_tickets(None).await.unwrap(), 1);
    }
}
