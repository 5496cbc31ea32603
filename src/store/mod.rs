//! SQLite persistence for departments, tickets, messages, audit logs and
//! customers.
//!
//! This module is split into:
//! - `mod.rs` - Store struct, connection pool, delegating operations
//! - `schema.rs` - Database schema initialization
//! - `department.rs` - Department upserts and last-sync tracking
//! - `ticket.rs` - Ticket creation with atomic number allocation, queries
//! - `message.rs` - Ticket messages with the closed-ticket guard
//! - `log.rs` - Append-only audit trail
//! - `customer.rs` - Customer lookups, inserts and enrichment updates

mod customer;
mod department;
mod log;
mod message;
mod schema;
mod ticket;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::helpdesk::types::{
    Customer, Department, DepartmentSpec, LogKind, Message, NewCustomer, NewMessage, NewTicket,
    NewTicketLog, Ticket, TicketLog, TicketStatus,
};

pub use customer::CoverageCounts;
pub use message::MessageInsert;
pub use ticket::TicketInsert;

/// Connection pool size. The worker is serial, so a few connections cover
/// the sync pass plus API reads.
const POOL_SIZE: u32 = 8;

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Get a reference to the connection pool (for tests and advanced usage).
    #[cfg(test)]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn open(path: &Path) -> Result<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", path.display());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(POOL_SIZE)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        schema::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);

        // One connection keeps the in-memory database alive and shared
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await
            .context("Failed to create in-memory connection pool")?;

        schema::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    //
    // Department Operations
    //

    /// Insert or update a department by name. Never touches `last_sync`.
    pub async fn upsert_department(&self, spec: &DepartmentSpec) -> Result<i64> {
        department::upsert_department(&self.pool, spec).await
    }

    pub async fn list_departments(&self) -> Result<Vec<Department>> {
        department::list_departments(&self.pool).await
    }

    pub async fn get_department(&self, id: i64) -> Result<Option<Department>> {
        department::get_department(&self.pool, id).await
    }

    pub async fn set_last_sync(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        department::set_last_sync(&self.pool, id, at).await
    }

    //
    // Ticket Operations
    //

    pub async fn find_ticket_by_message_id(
        &self,
        department_id: i64,
        message_id: &str,
    ) -> Result<Option<Ticket>> {
        ticket::find_by_message_id(&self.pool, department_id, message_id).await
    }

    /// Allocate a number and insert the ticket plus its first message in
    /// one transaction.
    pub async fn create_ticket(&self, new: &NewTicket, first: &NewMessage) -> Result<TicketInsert> {
        ticket::create_ticket(&self.pool, new, first).await
    }

    pub async fn get_ticket(&self, id: i64) -> Result<Option<Ticket>> {
        ticket::get_ticket(&self.pool, id).await
    }

    pub async fn ticket_exists(&self, id: i64) -> Result<bool> {
        ticket::ticket_exists(&self.pool, id).await
    }

    /// Persist the mutable fields of `ticket`.
    pub async fn save_ticket(&self, ticket: &Ticket) -> Result<()> {
        ticket::save_ticket(&self.pool, ticket).await
    }

    pub async fn find_ticket_sibling(
        &self,
        ticket_id: i64,
        department_id: i64,
        message_id: &str,
    ) -> Result<Option<Ticket>> {
        ticket::find_sibling_in_department(&self.pool, ticket_id, department_id, message_id).await
    }

    pub async fn set_ticket_department(&self, id: i64, department_id: i64) -> Result<()> {
        ticket::set_department(&self.pool, id, department_id).await
    }

    pub async fn set_ticket_customer(&self, id: i64, customer_id: i64) -> Result<()> {
        ticket::set_customer(&self.pool, id, customer_id).await
    }

    /// Highest ticket number allocated in a sequence scope.
    pub async fn max_ticket_number(&self, scope: &str) -> Result<i64> {
        ticket::max_number(&self.pool, scope).await
    }

    pub async fn count_tickets(&self, department_id: Option<i64>) -> Result<i64> {
        ticket::count_tickets(&self.pool, department_id).await
    }

    pub async fn tickets_for_customer(&self, customer_id: i64) -> Result<Vec<Ticket>> {
        ticket::tickets_for_customer(&self.pool, customer_id).await
    }

    pub async fn ticket_status_counts(&self, customer_id: i64) -> Result<Vec<(TicketStatus, i64)>> {
        ticket::status_counts(&self.pool, customer_id).await
    }

    /// Tickets without a customer, ordered by id, starting after `after_id`.
    pub async fn unlinked_tickets(&self, after_id: i64, limit: i64) -> Result<Vec<Ticket>> {
        ticket::unlinked_tickets(&self.pool, after_id, limit).await
    }

    //
    // Message Operations
    //

    pub async fn insert_message(&self, ticket_id: i64, message: &NewMessage) -> Result<MessageInsert> {
        message::insert_message(&self.pool, ticket_id, message).await
    }

    pub async fn list_messages(&self, ticket_id: i64) -> Result<Vec<Message>> {
        message::list_messages(&self.pool, ticket_id).await
    }

    //
    // Audit Log Operations
    //

    pub async fn append_log(&self, ticket_id: i64, entry: &NewTicketLog) -> Result<TicketLog> {
        log::append_log(&self.pool, ticket_id, entry).await
    }

    /// Newest first.
    pub async fn list_logs(
        &self,
        ticket_id: i64,
        kind: Option<LogKind>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TicketLog>> {
        log::list_logs(&self.pool, ticket_id, kind, limit, offset).await
    }

    pub async fn count_logs(&self, ticket_id: i64, kind: Option<LogKind>) -> Result<i64> {
        log::count_logs(&self.pool, ticket_id, kind).await
    }

    //
    // Customer Operations
    //

    pub async fn find_customer_by_email(&self, email: &str) -> Result<Option<Customer>> {
        customer::find_by_email(&self.pool, email).await
    }

    pub async fn find_customers_by_phone(&self, digits: &str) -> Result<Vec<Customer>> {
        customer::find_by_phone(&self.pool, digits).await
    }

    pub async fn find_customers_by_name(&self, name: &str, limit: i64) -> Result<Vec<Customer>> {
        customer::find_by_name(&self.pool, name, limit).await
    }

    pub async fn insert_customer(&self, customer: &NewCustomer) -> Result<Customer> {
        customer::insert_customer(&self.pool, customer).await
    }

    pub async fn get_customer(&self, id: i64) -> Result<Option<Customer>> {
        customer::get_customer(&self.pool, id).await
    }

    pub async fn customers_with_tickets(&self) -> Result<Vec<Customer>> {
        customer::customers_with_tickets(&self.pool).await
    }

    /// Overwrite name and phone; the folded name follows.
    pub async fn update_customer_contact(
        &self,
        id: i64,
        name: &str,
        phone: Option<&str>,
    ) -> Result<()> {
        customer::update_contact(&self.pool, id, name, phone).await
    }

    pub async fn set_customer_potential_value(&self, id: i64, value: i64) -> Result<()> {
        customer::set_potential_value(&self.pool, id, value).await
    }

    pub async fn coverage_counts(&self) -> Result<CoverageCounts> {
        customer::coverage_counts(&self.pool).await
    }
}
