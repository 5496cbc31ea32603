//! Ticket persistence.
//!
//! Numbers come from `ticket_sequences`, bumped with a single upsert inside
//! the same transaction that inserts the ticket and its first message. The
//! row seeds itself from the current maximum the first time a scope is used.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::{from_millis, to_millis};
use crate::constants::GLOBAL_SEQUENCE_SCOPE;
use crate::helpdesk::types::{NewMessage, NewTicket, Priority, Ticket, TicketStatus};

/// Outcome of inserting a ticket for an inbound mail.
#[derive(Debug)]
pub enum TicketInsert {
    Created(Ticket),
    /// A ticket imported by the same department for this Message-ID exists.
    Duplicate,
}

const SELECT_TICKET: &str = r#"
    SELECT id, number, display_number, subject, description, status, priority,
           requester_name, requester_email, requester_phone, department_id,
           source_department_id, assignee_id, assignee_name, customer_id, closed_at,
           email_message_id, email_uid, created_at, updated_at
    FROM tickets
"#;

fn row_to_ticket(row: SqliteRow) -> Ticket {
    let status: String = row.get("status");
    let priority: String = row.get("priority");
    Ticket {
        id: row.get("id"),
        number: row.get("number"),
        display_number: row.get("display_number"),
        subject: row.get("subject"),
        description: row.get("description"),
        status: TicketStatus::parse(&status).unwrap_or(TicketStatus::Open),
        priority: Priority::parse(&priority).unwrap_or(Priority::Medium),
        requester_name: row.get("requester_name"),
        requester_email: row.get("requester_email"),
        requester_phone: row.get("requester_phone"),
        department_id: row.get("department_id"),
        source_department_id: row.get("source_department_id"),
        assignee_id: row.get("assignee_id"),
        assignee_name: row.get("assignee_name"),
        customer_id: row.get("customer_id"),
        closed_at: row.get::<Option<i64>, _>("closed_at").map(from_millis),
        email_message_id: row.get("email_message_id"),
        email_uid: row.get::<Option<i64>, _>("email_uid").map(|v| v as u32),
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
    }
}

pub fn sequence_scope(prefix: Option<&str>) -> String {
    match prefix.map(str::trim).filter(|p| !p.is_empty()) {
        Some(prefix) => prefix.to_uppercase(),
        None => GLOBAL_SEQUENCE_SCOPE.to_string(),
    }
}

pub fn display_number(prefix: Option<&str>, number: i64) -> String {
    match prefix.map(str::trim).filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{}-{:06}", prefix.to_uppercase(), number),
        None => format!("#{}", number),
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
}

pub async fn create_ticket(
    pool: &SqlitePool,
    new: &NewTicket,
    first: &NewMessage,
) -> Result<TicketInsert> {
    let scope = sequence_scope(new.sequence_prefix.as_deref());
    let now = to_millis(Utc::now());

    let mut tx = pool.begin().await.context("Failed to begin transaction")?;

    let number: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO ticket_sequences (scope, last_number)
        VALUES (?, (SELECT COALESCE(MAX(number), 0) FROM tickets WHERE sequence_scope = ?) + 1)
        ON CONFLICT(scope) DO UPDATE SET last_number = last_number + 1
        RETURNING last_number
        "#,
    )
    .bind(&scope)
    .bind(&scope)
    .fetch_one(&mut *tx)
    .await
    .context("Failed to allocate ticket number")?;

    let display = display_number(new.sequence_prefix.as_deref(), number);

    let inserted = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO tickets
        (number, sequence_scope, display_number, subject, description, status, priority,
         requester_name, requester_email, requester_phone, department_id,
         source_department_id, customer_id, email_message_id, email_uid, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(number)
    .bind(&scope)
    .bind(&display)
    .bind(&new.subject)
    .bind(&new.description)
    .bind(TicketStatus::Open.as_str())
    .bind(new.priority.as_str())
    .bind(&new.requester_name)
    .bind(&new.requester_email)
    .bind(&new.requester_phone)
    .bind(new.department_id)
    .bind(new.department_id)
    .bind(new.customer_id)
    .bind(&new.email_message_id)
    .bind(new.email_uid.map(|v| v as i64))
    .bind(now)
    .bind(now)
    .fetch_one(&mut *tx)
    .await;

    let ticket_id = match inserted {
        Ok(id) => id,
        Err(e) if is_unique_violation(&e) => {
            tx.rollback().await.ok();
            return Ok(TicketInsert::Duplicate);
        }
        Err(e) => return Err(e).context("Failed to insert ticket"),
    };

    sqlx::query(
        r#"
        INSERT INTO messages
        (ticket_id, content, content_type, visibility, sender_name, sender_email,
         author_id, email_message_id, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(ticket_id)
    .bind(&first.content)
    .bind(first.content_type.as_str())
    .bind(first.visibility.as_str())
    .bind(&first.sender_name)
    .bind(&first.sender_email)
    .bind(first.author_id)
    .bind(&first.email_message_id)
    .bind(now)
    .execute(&mut *tx)
    .await
    .context("Failed to insert first message")?;

    let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_TICKET))
        .bind(ticket_id)
        .fetch_one(&mut *tx)
        .await?;
    let ticket = row_to_ticket(row);

    tx.commit().await.context("Failed to commit ticket")?;

    Ok(TicketInsert::Created(ticket))
}

/// Ticket imported from `department_id`'s mailbox for `message_id`, even
/// if it has since been forwarded elsewhere.
pub async fn find_by_message_id(
    pool: &SqlitePool,
    department_id: i64,
    message_id: &str,
) -> Result<Option<Ticket>> {
    let row = sqlx::query(&format!(
        "{} WHERE source_department_id = ? AND email_message_id = ?",
        SELECT_TICKET
    ))
    .bind(department_id)
    .bind(message_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(row_to_ticket))
}

/// Another ticket currently in `department_id` for the same Message-ID.
pub async fn find_sibling_in_department(
    pool: &SqlitePool,
    ticket_id: i64,
    department_id: i64,
    message_id: &str,
) -> Result<Option<Ticket>> {
    let row = sqlx::query(&format!(
        "{} WHERE department_id = ? AND email_message_id = ? AND id != ? ORDER BY id LIMIT 1",
        SELECT_TICKET
    ))
    .bind(department_id)
    .bind(message_id)
    .bind(ticket_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(row_to_ticket))
}

pub async fn get_ticket(pool: &SqlitePool, id: i64) -> Result<Option<Ticket>> {
    let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_TICKET))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(row_to_ticket))
}

pub async fn ticket_exists(pool: &SqlitePool, id: i64) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar("SELECT id FROM tickets WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(found.is_some())
}

pub async fn save_ticket(pool: &SqlitePool, ticket: &Ticket) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE tickets SET
            subject = ?, description = ?, status = ?, priority = ?,
            assignee_id = ?, assignee_name = ?, closed_at = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&ticket.subject)
    .bind(&ticket.description)
    .bind(ticket.status.as_str())
    .bind(ticket.priority.as_str())
    .bind(ticket.assignee_id)
    .bind(&ticket.assignee_name)
    .bind(ticket.closed_at.map(to_millis))
    .bind(to_millis(ticket.updated_at))
    .bind(ticket.id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_department(pool: &SqlitePool, id: i64, department_id: i64) -> Result<()> {
    sqlx::query("UPDATE tickets SET department_id = ?, updated_at = ? WHERE id = ?")
        .bind(department_id)
        .bind(to_millis(Utc::now()))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_customer(pool: &SqlitePool, id: i64, customer_id: i64) -> Result<()> {
    sqlx::query("UPDATE tickets SET customer_id = ?, updated_at = ? WHERE id = ?")
        .bind(customer_id)
        .bind(to_millis(Utc::now()))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn max_number(pool: &SqlitePool, scope: &str) -> Result<i64> {
    let max: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(number), 0) FROM tickets WHERE sequence_scope = ?")
            .bind(scope)
            .fetch_one(pool)
            .await?;
    Ok(max)
}

pub async fn count_tickets(pool: &SqlitePool, department_id: Option<i64>) -> Result<i64> {
    let count: i64 = match department_id {
        Some(id) => {
            sqlx::query_scalar("SELECT COUNT(*) FROM tickets WHERE department_id = ?")
                .bind(id)
                .fetch_one(pool)
                .await?
        }
        None => {
            sqlx::query_scalar("SELECT COUNT(*) FROM tickets")
                .fetch_one(pool)
                .await?
        }
    };
    Ok(count)
}

pub async fn tickets_for_customer(pool: &SqlitePool, customer_id: i64) -> Result<Vec<Ticket>> {
    let rows = sqlx::query(&format!(
        "{} WHERE customer_id = ? ORDER BY created_at DESC, id DESC",
        SELECT_TICKET
    ))
    .bind(customer_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(row_to_ticket).collect())
}

pub async fn status_counts(pool: &SqlitePool, customer_id: i64) -> Result<Vec<(TicketStatus, i64)>> {
    let rows = sqlx::query(
        "SELECT status, COUNT(*) AS total FROM tickets WHERE customer_id = ? GROUP BY status",
    )
    .bind(customer_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let status: String = row.get("status");
            TicketStatus::parse(&status).map(|s| (s, row.get::<i64, _>("total")))
        })
        .collect())
}

pub async fn unlinked_tickets(pool: &SqlitePool, after_id: i64, limit: i64) -> Result<Vec<Ticket>> {
    let rows = sqlx::query(&format!(
        "{} WHERE customer_id IS NULL AND id > ? ORDER BY id LIMIT ?",
        SELECT_TICKET
    ))
    .bind(after_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(row_to_ticket).collect())
}
