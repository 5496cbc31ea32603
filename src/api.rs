//! Request and response types for the ticket-log and sync endpoints.
//!
//! Routing lives elsewhere; these functions take already-decoded input and
//! return serializable output or an [`ApiError`] that maps onto an HTTP
//! status.

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_LOG_PAGE_SIZE, MAX_LOG_PAGE_SIZE};
use crate::helpdesk::types::{LogKind, NewTicketLog, TicketLog};
use crate::helpdesk::{AuditService, TicketError};
use crate::retry::{RetryManager, RetryStats};
use crate::store::Store;
use crate::sync::WorkerHandle;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Invalid(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unavailable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::NotFound(_) => 404,
            ApiError::Invalid(_) => 400,
            ApiError::Conflict(_) => 409,
            ApiError::Unavailable(_) => 503,
            ApiError::Internal(_) => 500,
        }
    }
}

impl From<TicketError> for ApiError {
    fn from(error: TicketError) -> Self {
        match error {
            TicketError::TicketNotFound(_)
            | TicketError::CustomerNotFound(_)
            | TicketError::DepartmentNotFound(_) => ApiError::NotFound(error.to_string()),
            TicketError::Closed(_) | TicketError::Invalid(_) => ApiError::Invalid(error.to_string()),
            TicketError::Conflict(_) => ApiError::Conflict(error.to_string()),
            TicketError::Store(e) => ApiError::Internal(e),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    /// Log kind filter, e.g. `STATUS_CHANGED`.
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: i64,
    pub pages: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogPage {
    pub logs: Vec<TicketLog>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateLogRequest {
    pub kind: Option<String>,
    pub description: Option<String>,
    pub previous_value: Option<String>,
    pub new_value: Option<String>,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub author_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncTriggerResponse {
    pub processed: usize,
    pub tickets_created: Vec<String>,
    pub errors: Vec<String>,
}

fn parse_kind(kind: &str) -> Result<LogKind, ApiError> {
    LogKind::parse(kind).ok_or_else(|| ApiError::Invalid(format!("unknown log kind: {}", kind)))
}

async fn require_ticket(store: &Store, ticket_id: i64) -> Result<(), ApiError> {
    if store.ticket_exists(ticket_id).await? {
        Ok(())
    } else {
        Err(TicketError::TicketNotFound(ticket_id).into())
    }
}

/// Audit trail of a ticket, newest first.
pub async fn list_ticket_logs(store: &Store, ticket_id: i64, query: &LogQuery) -> Result<LogPage, ApiError> {
    require_ticket(store, ticket_id).await?;

    let page = query.page.unwrap_or(1).max(1);
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LOG_PAGE_SIZE)
        .clamp(1, MAX_LOG_PAGE_SIZE);
    let kind = match query.kind.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
        Some(kind) => Some(parse_kind(kind)?),
        None => None,
    };

    let offset = (page as i64 - 1) * limit as i64;
    let logs = store.list_logs(ticket_id, kind, limit as i64, offset).await?;
    let total = store.count_logs(ticket_id, kind).await?;
    let pages = (total + limit as i64 - 1) / limit as i64;

    Ok(LogPage {
        logs,
        pagination: Pagination {
            page,
            limit,
            total,
            pages,
        },
    })
}

fn required(value: Option<String>, field: &str) -> Result<String, ApiError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::Invalid(format!("{} is required", field)))
}

/// Append a manual entry to a ticket's audit trail.
pub async fn create_ticket_log(
    store: &Store,
    audit: &AuditService,
    ticket_id: i64,
    request: CreateLogRequest,
) -> Result<TicketLog, ApiError> {
    let kind = parse_kind(&required(request.kind, "kind")?)?;
    let description = required(request.description, "description")?;
    let author_name = required(request.author_name, "author_name")?;
    let author_email = required(request.author_email, "author_email")?;

    require_ticket(store, ticket_id).await?;

    let entry = NewTicketLog {
        kind,
        description,
        previous_value: request.previous_value,
        new_value: request.new_value,
        author_name,
        author_email,
        author_id: request.author_id,
    };
    Ok(audit.append_manual(ticket_id, &entry).await?)
}

/// Run a full sync through the worker. Department failures are reported in
/// `errors`; only a stopped worker fails the call.
pub async fn trigger_sync(worker: &WorkerHandle) -> Result<SyncTriggerResponse, ApiError> {
    let report = worker
        .sync_now()
        .await
        .map_err(|e| ApiError::Unavailable(format!("{:#}", e)))?;

    Ok(SyncTriggerResponse {
        processed: report.processed,
        errors: report.errors(),
        tickets_created: report.tickets_created,
    })
}

pub fn retry_stats(retry: &RetryManager) -> Vec<RetryStats> {
    retry.stats()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helpdesk::AuditContext;
    use crate::store::fixtures;
    use crate::sync::spawn_worker;
    use crate::sync::tests::{add_department, harness};
    use std::sync::Arc;

    fn manual(kind: &str, description: &str) -> CreateLogRequest {
        CreateLogRequest {
            kind: Some(kind.into()),
            description: Some(description.into()),
            author_name: Some("Ana".into()),
            author_email: Some("ana@helpdesk.local".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_log_pagination_and_filter() {
        let store = Store::open_in_memory().await.unwrap();
        let audit = AuditService::new(store.clone());
        let dept = fixtures::department(&store, "Support").await;
        let ticket = fixtures::ticket(&store, dept.id, "m1").await;

        for i in 0..5 {
            create_ticket_log(&store, &audit, ticket.id, manual("MESSAGE_ADDED", &format!("note {}", i)))
                .await
                .unwrap();
        }
        audit
            .log_ticket_closure(ticket.id, chrono::Utc::now(), &AuditContext::system())
            .await;

        let page = list_ticket_logs(
            &store,
            ticket.id,
            &LogQuery {
                page: Some(2),
                limit: Some(2),
                kind: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(
            page.pagination,
            Pagination {
                page: 2,
                limit: 2,
                total: 6,
                pages: 3
            }
        );
        assert_eq!(page.logs[0].description, "note 3");

        let closures = list_ticket_logs(
            &store,
            ticket.id,
            &LogQuery {
                kind: Some("closure".into()),
                limit: Some(500),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(closures.logs.len(), 1);
        assert_eq!(closures.pagination.limit, 100);

        let defaults = list_ticket_logs(&store, ticket.id, &LogQuery::default()).await.unwrap();
        assert_eq!(defaults.pagination.limit, 50);
        assert_eq!(defaults.pagination.page, 1);
        assert_eq!(defaults.logs.len(), 6);
    }

    #[tokio::test]
    async fn test_log_errors_map_to_status_codes() {
        let store = Store::open_in_memory().await.unwrap();
        let audit = AuditService::new(store.clone());
        let dept = fixtures::department(&store, "Support").await;
        let ticket = fixtures::ticket(&store, dept.id, "m1").await;

        let missing = list_ticket_logs(&store, 999, &LogQuery::default()).await;
        assert_eq!(missing.unwrap_err().status_code(), 404);

        let mut request = manual("STATUS_CHANGED", "x");
        request.author_email = None;
        let invalid = create_ticket_log(&store, &audit, ticket.id, request).await;
        assert_eq!(invalid.unwrap_err().status_code(), 400);

        let bad_kind = create_ticket_log(&store, &audit, ticket.id, manual("BOGUS", "x")).await;
        assert_eq!(bad_kind.unwrap_err().status_code(), 400);

        let unknown = create_ticket_log(&store, &audit, 999, manual("CLOSURE", "x")).await;
        assert_eq!(unknown.unwrap_err().status_code(), 404);

        let bad_filter = list_ticket_logs(
            &store,
            ticket.id,
            &LogQuery {
                kind: Some("nope".into()),
                ..Default::default()
            },
        )
        .await;
        assert_eq!(bad_filter.unwrap_err().status_code(), 400);
    }

    #[tokio::test]
    async fn test_trigger_sync_reports_partial_results() {
        let h = harness().await;
        let good = add_department(&h.store, fixtures::department_spec("Support")).await;
        let bad = add_department(&h.store, fixtures::department_spec("Billing")).await;
        h.server.reject_login(&bad.imap.host);
        let retry = Arc::clone(&h.retry);
        let server = h.server.clone();

        let worker = spawn_worker(
            Arc::new(h.engine),
            crate::sync::WorkerSettings {
                tick: std::time::Duration::from_secs(3600),
                ..Default::default()
            },
        );

        server.deliver(
            &good.imap.host,
            1,
            crate::mail::testing::raw_mail(Some("m1"), "maria@example.com", "Printer offline", "Help"),
        );
        let response = trigger_sync(&worker).await.unwrap();
        assert_eq!(response.errors.len(), 1);
        assert!(response.errors[0].starts_with("Billing"));
        assert!(response.tickets_created.len() <= 1);

        let json = serde_json::to_value(retry_stats(&retry)).unwrap();
        assert!(json.as_array().unwrap().is_empty());

        worker.shutdown().await;
        let closed =
            tokio::time::timeout(std::time::Duration::from_secs(5), worker.cmd_tx.closed()).await;
        assert!(closed.is_ok());
        assert_eq!(trigger_sync(&worker).await.unwrap_err().status_code(), 503);
    }
}
