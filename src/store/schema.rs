//! Database schema initialization.

use anyhow::Result;
use sqlx::SqlitePool;

/// Initialize database schema with all tables and indexes.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        -- Helpdesk mail sources
        CREATE TABLE IF NOT EXISTS departments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            active INTEGER NOT NULL DEFAULT 1,
            sync_enabled INTEGER NOT NULL DEFAULT 1,
            sync_interval_secs INTEGER NOT NULL DEFAULT 300,
            imap_host TEXT NOT NULL DEFAULT '',
            imap_port INTEGER NOT NULL DEFAULT 993,
            imap_secure INTEGER NOT NULL DEFAULT 1,
            imap_user TEXT NOT NULL DEFAULT '',
            imap_password TEXT NOT NULL DEFAULT '',
            smtp_host TEXT NOT NULL DEFAULT '',
            smtp_port INTEGER NOT NULL DEFAULT 587,
            smtp_secure INTEGER NOT NULL DEFAULT 0,
            smtp_user TEXT NOT NULL DEFAULT '',
            smtp_password TEXT NOT NULL DEFAULT '',
            sequence_prefix TEXT,
            group_name TEXT,
            last_sync INTEGER
        );

        -- Customers; email is not unique, duplicates resolve to the lowest id
        CREATE TABLE IF NOT EXISTS customers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            -- Lower-cased in Rust so non-ASCII names fold too
            name_folded TEXT NOT NULL,
            email TEXT,
            phone TEXT,
            company TEXT,
            status TEXT NOT NULL DEFAULT 'LEAD',
            notes TEXT,
            potential_value INTEGER,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_customers_email ON customers(email);
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        -- Tickets; one per (receiving department, source Message-ID).
        -- source_department_id never changes, department_id follows forwards.
        CREATE TABLE IF NOT EXISTS tickets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            number INTEGER NOT NULL,
            sequence_scope TEXT NOT NULL,
            display_number TEXT NOT NULL,
            subject TEXT NOT NULL,
            description TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'OPEN',
            priority TEXT NOT NULL DEFAULT 'MEDIUM',
            requester_name TEXT NOT NULL,
            requester_email TEXT NOT NULL,
            requester_phone TEXT,
            department_id INTEGER NOT NULL REFERENCES departments(id),
            source_department_id INTEGER NOT NULL REFERENCES departments(id),
            assignee_id INTEGER,
            assignee_name TEXT,
            customer_id INTEGER REFERENCES customers(id),
            closed_at INTEGER,
            email_message_id TEXT,
            email_uid INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE (sequence_scope, number),
            UNIQUE (source_department_id, email_message_id)
        );

        CREATE INDEX IF NOT EXISTS idx_tickets_customer ON tickets(customer_id, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_tickets_department ON tickets(department_id, email_message_id);

        -- Last number handed out per sequence scope
        CREATE TABLE IF NOT EXISTS ticket_sequences (
            scope TEXT PRIMARY KEY,
            last_number INTEGER NOT NULL
        );

        -- Ticket conversation
        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ticket_id INTEGER NOT NULL REFERENCES tickets(id) ON DELETE CASCADE,
            content TEXT NOT NULL,
            content_type TEXT NOT NULL DEFAULT 'TEXT',
            visibility TEXT NOT NULL DEFAULT 'PUBLIC',
            sender_name TEXT NOT NULL,
            sender_email TEXT NOT NULL,
            author_id INTEGER,
            email_message_id TEXT,
            created_at INTEGER NOT NULL,
            edited_at INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_messages_ticket ON messages(ticket_id, created_at);

        -- Audit trail
        CREATE TABLE IF NOT EXISTS ticket_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ticket_id INTEGER NOT NULL REFERENCES tickets(id) ON DELETE CASCADE,
            kind TEXT NOT NULL,
            description TEXT NOT NULL,
            previous_value TEXT,
            new_value TEXT,
            author_name TEXT NOT NULL,
            author_email TEXT NOT NULL,
            author_id INTEGER,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_ticket_logs_ticket ON ticket_logs(ticket_id, created_at DESC);
        "#,
    )
    .execute(pool)
    .await?;

    // Log rows are immutable once written
    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS ticket_logs_no_update
        BEFORE UPDATE ON ticket_logs
        BEGIN
            SELECT RAISE(ABORT, 'ticket_logs is append-only');
        END;
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
