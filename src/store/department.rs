//! Department upserts and last-sync tracking.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::{from_millis, to_millis};
use crate::helpdesk::types::{Department, DepartmentSpec};
use crate::mail::MailEndpoint;

const SELECT_DEPARTMENT: &str = r#"
    SELECT id, name, active, sync_enabled, sync_interval_secs,
           imap_host, imap_port, imap_secure, imap_user, imap_password,
           smtp_host, smtp_port, smtp_secure, smtp_user, smtp_password,
           sequence_prefix, group_name, last_sync
    FROM departments
"#;

fn row_to_department(row: SqliteRow) -> Department {
    Department {
        id: row.get("id"),
        name: row.get("name"),
        active: row.get("active"),
        sync_enabled: row.get("sync_enabled"),
        sync_interval_secs: row.get::<i64, _>("sync_interval_secs").max(0) as u64,
        imap: MailEndpoint {
            host: row.get("imap_host"),
            port: row.get::<i64, _>("imap_port") as u16,
            secure: row.get("imap_secure"),
            user: row.get("imap_user"),
            password: row.get("imap_password"),
        },
        smtp: MailEndpoint {
            host: row.get("smtp_host"),
            port: row.get::<i64, _>("smtp_port") as u16,
            secure: row.get("smtp_secure"),
            user: row.get("smtp_user"),
            password: row.get("smtp_password"),
        },
        sequence_prefix: row.get("sequence_prefix"),
        group_name: row.get("group_name"),
        last_sync: row.get::<Option<i64>, _>("last_sync").map(from_millis),
    }
}

pub async fn upsert_department(pool: &SqlitePool, spec: &DepartmentSpec) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO departments
        (name, active, sync_enabled, sync_interval_secs,
         imap_host, imap_port, imap_secure, imap_user, imap_password,
         smtp_host, smtp_port, smtp_secure, smtp_user, smtp_password,
         sequence_prefix, group_name)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(name) DO UPDATE SET
            active = excluded.active,
            sync_enabled = excluded.sync_enabled,
            sync_interval_secs = excluded.sync_interval_secs,
            imap_host = excluded.imap_host,
            imap_port = excluded.imap_port,
            imap_secure = excluded.imap_secure,
            imap_user = excluded.imap_user,
            imap_password = excluded.imap_password,
            smtp_host = excluded.smtp_host,
            smtp_port = excluded.smtp_port,
            smtp_secure = excluded.smtp_secure,
            smtp_user = excluded.smtp_user,
            smtp_password = excluded.smtp_password,
            sequence_prefix = excluded.sequence_prefix,
            group_name = excluded.group_name
        RETURNING id
        "#,
    )
    .bind(&spec.name)
    .bind(spec.active)
    .bind(spec.sync_enabled)
    .bind(spec.sync_interval_secs as i64)
    .bind(&spec.imap.host)
    .bind(spec.imap.port as i64)
    .bind(spec.imap.secure)
    .bind(&spec.imap.user)
    .bind(&spec.imap.password)
    .bind(&spec.smtp.host)
    .bind(spec.smtp.port as i64)
    .bind(spec.smtp.secure)
    .bind(&spec.smtp.user)
    .bind(&spec.smtp.password)
    .bind(&spec.sequence_prefix)
    .bind(&spec.group_name)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

pub async fn list_departments(pool: &SqlitePool) -> Result<Vec<Department>> {
    let rows = sqlx::query(&format!("{} ORDER BY id", SELECT_DEPARTMENT))
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(row_to_department).collect())
}

pub async fn get_department(pool: &SqlitePool, id: i64) -> Result<Option<Department>> {
    let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_DEPARTMENT))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(row_to_department))
}

pub async fn set_last_sync(pool: &SqlitePool, id: i64, at: DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE departments SET last_sync = ? WHERE id = ?")
        .bind(to_millis(at))
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::store::{Store, fixtures};
    use chrono::Utc;

    #[tokio::test]
    async fn test_upsert_keeps_id_and_last_sync() {
        let store = Store::open_in_memory().await.unwrap();
        let mut spec = fixtures::department_spec("Support");
        let id = store.upsert_department(&spec).await.unwrap();

        let now = Utc::now();
        store.set_last_sync(id, now).await.unwrap();

        spec.sync_enabled = false;
        spec.sequence_prefix = Some("SUP".into());
        let again = store.upsert_department(&spec).await.unwrap();
        assert_eq!(id, again);

        let dept = store.get_department(id).await.unwrap().unwrap();
        assert!(!dept.sync_enabled);
        assert_eq!(dept.sequence_prefix.as_deref(), Some("SUP"));
        assert_eq!(
            dept.last_sync.map(|t| t.timestamp_millis()),
            Some(now.timestamp_millis())
        );
        assert_eq!(dept.imap.port, 993);
    }
}
