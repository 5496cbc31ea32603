//! Append-only audit trail. Rows are never updated; a trigger enforces it.

use anyhow::Result;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::{from_millis, to_millis};
use crate::helpdesk::types::{LogKind, NewTicketLog, TicketLog};

const SELECT_LOG: &str = r#"
    SELECT id, ticket_id, kind, description, previous_value, new_value,
           author_name, author_email, author_id, created_at
    FROM ticket_logs
"#;

fn row_to_log(row: SqliteRow) -> Option<TicketLog> {
    let kind: String = row.get("kind");
    Some(TicketLog {
        id: row.get("id"),
        ticket_id: row.get("ticket_id"),
        kind: LogKind::parse(&kind)?,
        description: row.get("description"),
        previous_value: row.get("previous_value"),
        new_value: row.get("new_value"),
        author_name: row.get("author_name"),
        author_email: row.get("author_email"),
        author_id: row.get("author_id"),
        created_at: from_millis(row.get("created_at")),
    })
}

pub async fn append_log(pool: &SqlitePool, ticket_id: i64, entry: &NewTicketLog) -> Result<TicketLog> {
    let row = sqlx::query(
        r#"
        INSERT INTO ticket_logs
        (ticket_id, kind, description, previous_value, new_value,
         author_name, author_email, author_id, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id, ticket_id, kind, description, previous_value, new_value,
                  author_name, author_email, author_id, created_at
        "#,
    )
    .bind(ticket_id)
    .bind(entry.kind.as_str())
    .bind(&entry.description)
    .bind(&entry.previous_value)
    .bind(&entry.new_value)
    .bind(&entry.author_name)
    .bind(&entry.author_email)
    .bind(entry.author_id)
    .bind(to_millis(Utc::now()))
    .fetch_one(pool)
    .await?;

    row_to_log(row).ok_or_else(|| anyhow::anyhow!("Stored log has an unknown kind"))
}

pub async fn list_logs(
    pool: &SqlitePool,
    ticket_id: i64,
    kind: Option<LogKind>,
    limit: i64,
    offset: i64,
) -> Result<Vec<TicketLog>> {
    let rows = match kind {
        Some(kind) => {
            sqlx::query(&format!(
                "{} WHERE ticket_id = ? AND kind = ? ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
                SELECT_LOG
            ))
            .bind(ticket_id)
            .bind(kind.as_str())
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(&format!(
                "{} WHERE ticket_id = ? ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
                SELECT_LOG
            ))
            .bind(ticket_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await?
        }
    };

    Ok(rows.into_iter().filter_map(row_to_log).collect())
}

pub async fn count_logs(pool: &SqlitePool, ticket_id: i64, kind: Option<LogKind>) -> Result<i64> {
    let count: i64 = match kind {
        Some(kind) => {
            sqlx::query_scalar("SELECT COUNT(*) FROM ticket_logs WHERE ticket_id = ? AND kind = ?")
                .bind(ticket_id)
                .bind(kind.as_str())
                .fetch_one(pool)
                .await?
        }
        None => {
            sqlx::query_scalar("SELECT COUNT(*) FROM ticket_logs WHERE ticket_id = ?")
                .bind(ticket_id)
                .fetch_one(pool)
                .await?
        }
    };
    Ok(count)
}
