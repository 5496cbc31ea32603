//! Customer lookups, inserts and the enrichment updates.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::{from_millis, to_millis};
use crate::helpdesk::types::{Customer, CustomerStatus, NewCustomer};

const SELECT_CUSTOMER: &str = r#"
    SELECT id, name, email, phone, company, status, notes, potential_value, created_at
    FROM customers
"#;

/// Phone column with punctuation stripped, for digit-only matching.
const NORMALIZED_PHONE: &str = "REPLACE(REPLACE(REPLACE(REPLACE(REPLACE(REPLACE(phone, ' ', ''), '-', ''), '(', ''), ')', ''), '+', ''), '.', '')";

/// Ticket and customer totals for the association dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoverageCounts {
    pub total_tickets: i64,
    pub tickets_with_customer: i64,
    pub tickets_without_customer: i64,
    pub total_customers: i64,
    pub customers_with_tickets: i64,
}

fn row_to_customer(row: SqliteRow) -> Customer {
    let status: String = row.get("status");
    Customer {
        id: row.get("id"),
        name: row.get("name"),
        email: row.get("email"),
        phone: row.get("phone"),
        company: row.get("company"),
        status: CustomerStatus::parse(&status).unwrap_or(CustomerStatus::Lead),
        notes: row.get("notes"),
        potential_value: row.get("potential_value"),
        created_at: from_millis(row.get("created_at")),
    }
}

/// Case folding used for `name_folded` and for name queries.
fn fold_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Escape `%`, `_` and the escape character itself for `LIKE ... ESCAPE '\'`.
fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Case-insensitive exact match. Several customers may share an address;
/// the oldest one wins.
pub async fn find_by_email(pool: &SqlitePool, email: &str) -> Result<Option<Customer>> {
    let row = sqlx::query(&format!(
        "{} WHERE LOWER(TRIM(email)) = ? ORDER BY id LIMIT 1",
        SELECT_CUSTOMER
    ))
    .bind(email.trim().to_lowercase())
    .fetch_optional(pool)
    .await?;
    Ok(row.map(row_to_customer))
}

pub async fn find_by_phone(pool: &SqlitePool, digits: &str) -> Result<Vec<Customer>> {
    let rows = sqlx::query(&format!(
        "{} WHERE phone IS NOT NULL AND {} LIKE '%' || ? || '%' ORDER BY id",
        SELECT_CUSTOMER, NORMALIZED_PHONE
    ))
    .bind(digits)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(row_to_customer).collect())
}

/// Names containing `name`, case-insensitively. Wildcards in the input
/// match literally.
pub async fn find_by_name(pool: &SqlitePool, name: &str, limit: i64) -> Result<Vec<Customer>> {
    let rows = sqlx::query(&format!(
        r"{} WHERE name_folded LIKE '%' || ? || '%' ESCAPE '\' ORDER BY id LIMIT ?",
        SELECT_CUSTOMER
    ))
    .bind(escape_like(&fold_name(name)))
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(row_to_customer).collect())
}

pub async fn insert_customer(pool: &SqlitePool, customer: &NewCustomer) -> Result<Customer> {
    let row = sqlx::query(
        r#"
        INSERT INTO customers (name, name_folded, email, phone, company, status, notes, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id, name, email, phone, company, status, notes, potential_value, created_at
        "#,
    )
    .bind(&customer.name)
    .bind(fold_name(&customer.name))
    .bind(&customer.email)
    .bind(&customer.phone)
    .bind(&customer.company)
    .bind(customer.status.as_str())
    .bind(&customer.notes)
    .bind(to_millis(Utc::now()))
    .fetch_one(pool)
    .await?;
    Ok(row_to_customer(row))
}

pub async fn get_customer(pool: &SqlitePool, id: i64) -> Result<Option<Customer>> {
    let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_CUSTOMER))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(row_to_customer))
}

/// Customers linked to at least one ticket, by id.
pub async fn customers_with_tickets(pool: &SqlitePool) -> Result<Vec<Customer>> {
    let rows = sqlx::query(&format!(
        "{} WHERE EXISTS (SELECT 1 FROM tickets t WHERE t.customer_id = customers.id) ORDER BY id",
        SELECT_CUSTOMER
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(row_to_customer).collect())
}

pub async fn update_contact(pool: &SqlitePool, id: i64, name: &str, phone: Option<&str>) -> Result<()> {
    sqlx::query("UPDATE customers SET name = ?, name_folded = ?, phone = ? WHERE id = ?")
        .bind(name)
        .bind(fold_name(name))
        .bind(phone)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_potential_value(pool: &SqlitePool, id: i64, value: i64) -> Result<()> {
    sqlx::query("UPDATE customers SET potential_value = ? WHERE id = ?")
        .bind(value)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn coverage_counts(pool: &SqlitePool) -> Result<CoverageCounts> {
    let row = sqlx::query(
        r#"
        SELECT
            (SELECT COUNT(*) FROM tickets) AS total_tickets,
            (SELECT COUNT(*) FROM tickets WHERE customer_id IS NOT NULL) AS with_customer,
            (SELECT COUNT(*) FROM customers) AS total_customers,
            (SELECT COUNT(DISTINCT customer_id) FROM tickets WHERE customer_id IS NOT NULL)
                AS customers_with_tickets
        "#,
    )
    .fetch_one(pool)
    .await?;

    let total_tickets: i64 = row.get("total_tickets");
    let with_customer: i64 = row.get("with_customer");
    Ok(CoverageCounts {
        total_tickets,
        tickets_with_customer: with_customer,
        tickets_without_customer: total_tickets - with_customer,
        total_customers: row.get("total_customers"),
        customers_with_tickets: row.get("customers_with_tickets"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Store, fixtures};

    fn customer(name: &str, email: Option<&str>, phone: Option<&str>) -> NewCustomer {
        NewCustomer {
            name: name.to_string(),
            email: email.map(str::to_string),
            phone: phone.map(str::to_string),
            company: None,
            status: CustomerStatus::Lead,
            notes: None,
        }
    }

    #[tokio::test]
    async fn test_email_lookup_prefers_oldest() {
        let store = Store::open_in_memory().await.unwrap();
        let first = store
            .insert_customer(&customer("Maria Silva", Some("Maria@Example.com"), None))
            .await
            .unwrap();
        store
            .insert_customer(&customer("Maria S.", Some("maria@example.com"), None))
            .await
            .unwrap();

        let found = store
            .find_customer_by_email(" MARIA@example.com ")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, first.id);
        assert!(store.find_customer_by_email("nobody@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_phone_and_name_lookup() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .insert_customer(&customer("João Pereira", None, Some("+55 (11) 98765-4321")))
            .await
            .unwrap();

        let by_phone = store.find_customers_by_phone("11987654321").await.unwrap();
        assert_eq!(by_phone.len(), 1);
        assert!(store.find_customers_by_phone("0000000000").await.unwrap().is_empty());

        let by_name = store.find_customers_by_name("pereira", 10).await.unwrap();
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].status, CustomerStatus::Lead);
    }

    #[tokio::test]
    async fn test_name_lookup_folds_unicode_and_escapes_wildcards() {
        let store = Store::open_in_memory().await.unwrap();
        let joao = store
            .insert_customer(&customer("JOÃO PEREIRA", None, None))
            .await
            .unwrap();
        store
            .insert_customer(&customer("Ana_Maria 100%", None, None))
            .await
            .unwrap();

        let found = store.find_customers_by_name("joão", 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, joao.id);

        // Wildcards only match themselves
        assert!(store.find_customers_by_name("jo_o", 10).await.unwrap().is_empty());
        assert_eq!(store.find_customers_by_name("%", 10).await.unwrap().len(), 1);
        assert_eq!(store.find_customers_by_name("a_m", 10).await.unwrap().len(), 1);
        assert!(store.find_customers_by_name("axm", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_contact_update_and_coverage() {
        let store = Store::open_in_memory().await.unwrap();
        let dept = fixtures::department(&store, "Support").await;
        let maria = store
            .insert_customer(&customer("Maria", Some("maria@example.com"), None))
            .await
            .unwrap();
        store
            .insert_customer(&customer("Idle", None, None))
            .await
            .unwrap();
        let linked = fixtures::ticket(&store, dept.id, "m1").await;
        fixtures::ticket(&store, dept.id, "m2").await;
        store.set_ticket_customer(linked.id, maria.id).await.unwrap();

        store
            .update_customer_contact(maria.id, "Maria Silva", Some("11 98765-4321"))
            .await
            .unwrap();
        store.set_customer_potential_value(maria.id, 120).await.unwrap();
        let updated = store.get_customer(maria.id).await.unwrap().unwrap();
        assert_eq!(updated.name, "Maria Silva");
        assert_eq!(updated.phone.as_deref(), Some("11 98765-4321"));
        assert_eq!(updated.potential_value, Some(120));
        assert_eq!(store.find_customers_by_name("silva", 10).await.unwrap().len(), 1);

        let with_tickets = store.customers_with_tickets().await.unwrap();
        assert_eq!(with_tickets.len(), 1);
        assert_eq!(with_tickets[0].id, maria.id);

        assert_eq!(
            store.coverage_counts().await.unwrap(),
            CoverageCounts {
                total_tickets: 2,
                tickets_with_customer: 1,
                tickets_without_customer: 1,
                total_customers: 2,
                customers_with_tickets: 1,
            }
        );
    }
}
