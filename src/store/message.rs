//! Ticket messages.

use anyhow::Result;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::{from_millis, to_millis};
use crate::helpdesk::types::{ContentType, Message, NewMessage, Visibility};

#[derive(Debug)]
pub enum MessageInsert {
    Inserted(Message),
    TicketNotFound,
    /// Closed tickets accept internal notes only.
    TicketClosed,
}

const SELECT_MESSAGE: &str = r#"
    SELECT id, ticket_id, content, content_type, visibility, sender_name, sender_email,
           author_id, email_message_id, created_at, edited_at
    FROM messages
"#;

fn row_to_message(row: SqliteRow) -> Message {
    let content_type: String = row.get("content_type");
    let visibility: String = row.get("visibility");
    Message {
        id: row.get("id"),
        ticket_id: row.get("ticket_id"),
        content: row.get("content"),
        content_type: ContentType::parse(&content_type).unwrap_or(ContentType::Text),
        visibility: Visibility::parse(&visibility).unwrap_or(Visibility::Public),
        sender_name: row.get("sender_name"),
        sender_email: row.get("sender_email"),
        author_id: row.get("author_id"),
        email_message_id: row.get("email_message_id"),
        created_at: from_millis(row.get("created_at")),
        edited_at: row.get::<Option<i64>, _>("edited_at").map(from_millis),
    }
}

pub async fn insert_message(
    pool: &SqlitePool,
    ticket_id: i64,
    message: &NewMessage,
) -> Result<MessageInsert> {
    // The status check and the insert are one statement
    let id: Option<i64> = sqlx::query_scalar(
        r#"
        INSERT INTO messages
        (ticket_id, content, content_type, visibility, sender_name, sender_email,
         author_id, email_message_id, created_at)
        SELECT id, ?, ?, ?, ?, ?, ?, ?, ?
        FROM tickets
        WHERE id = ? AND (status != 'CLOSED' OR ? = 'INTERNAL')
        RETURNING id
        "#,
    )
    .bind(&message.content)
    .bind(message.content_type.as_str())
    .bind(message.visibility.as_str())
    .bind(&message.sender_name)
    .bind(&message.sender_email)
    .bind(message.author_id)
    .bind(&message.email_message_id)
    .bind(to_millis(Utc::now()))
    .bind(ticket_id)
    .bind(message.visibility.as_str())
    .fetch_optional(pool)
    .await?;

    let Some(id) = id else {
        return Ok(if super::ticket::ticket_exists(pool, ticket_id).await? {
            MessageInsert::TicketClosed
        } else {
            MessageInsert::TicketNotFound
        });
    };

    let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_MESSAGE))
        .bind(id)
        .fetch_one(pool)
        .await?;
    Ok(MessageInsert::Inserted(row_to_message(row)))
}

pub async fn list_messages(pool: &SqlitePool, ticket_id: i64) -> Result<Vec<Message>> {
    let rows = sqlx::query(&format!(
        "{} WHERE ticket_id = ? ORDER BY created_at, id",
        SELECT_MESSAGE
    ))
    .bind(ticket_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(row_to_message).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helpdesk::types::TicketStatus;
    use crate::store::{Store, fixtures};

    #[tokio::test]
    async fn test_closed_ticket_rejects_public_messages() {
        let store = Store::open_in_memory().await.unwrap();
        let dept = fixtures::department(&store, "Support").await;
        let mut ticket = fixtures::ticket(&store, dept.id, "m1").await;

        let note = NewMessage::internal_note("Checked the cable", "Ana", "ana@helpdesk.local");
        let result = store.insert_message(ticket.id, &note).await.unwrap();
        let MessageInsert::Inserted(message) = result else {
            panic!("expected insert");
        };
        assert_eq!(message.visibility, Visibility::Internal);

        ticket.status = TicketStatus::Closed;
        store.save_ticket(&ticket).await.unwrap();
        let mut reply = note.clone();
        reply.visibility = Visibility::Public;
        let result = store.insert_message(ticket.id, &reply).await.unwrap();
        assert!(matches!(result, MessageInsert::TicketClosed));

        // Internal notes are still accepted
        let result = store.insert_message(ticket.id, &note).await.unwrap();
        assert!(matches!(result, MessageInsert::Inserted(_)));

        let result = store.insert_message(9999, &note).await.unwrap();
        assert!(matches!(result, MessageInsert::TicketNotFound));

        assert_eq!(store.list_messages(ticket.id).await.unwrap().len(), 3);
    }
}
