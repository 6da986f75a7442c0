//! Local durable cache for agenda entries, message bodies and group membership.
//!
//! Every public operation is a single statement or a single transaction, so the
//! reconciliation and display loops can share one [`Cache`] without any other
//! locking. The pool runs in WAL mode with `synchronous=FULL`; a write is on
//! disk once its call returns.

use crate::model::{truncate_to_minute, AgendaEntry};
use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{instrument, warn};

/// Tolerance applied when matching `scheduled_at` in [`Cache::mark_shown`].
pub const MARK_SHOWN_TOLERANCE_SECS: i64 = 60;

#[derive(Debug, Clone)]
pub struct Cache {
    pool: SqlitePool,
}

impl Cache {
    /// Open (creating if needed) the cache at `database_url` and apply migrations.
    pub async fn open(database_url: &str) -> Result<Self> {
        let normalized = prepare_sqlite_url(database_url);
        let options = SqliteConnectOptions::from_str(&normalized)
            .with_context(|| format!("invalid database url {}", normalized))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    #[instrument(skip_all)]
    pub async fn agenda_exists(&self, message_id: i64, scheduled_at: NaiveDateTime) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM agenda WHERE message_id = ? AND scheduled_at = ?",
        )
        .bind(message_id)
        .bind(truncate_to_minute(scheduled_at))
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Insert an unshown entry unless `(message_id, scheduled_at)` is already
    /// present. Returns whether a row was written.
    #[instrument(skip_all)]
    pub async fn upsert_agenda(&self, message_id: i64, scheduled_at: NaiveDateTime) -> Result<bool> {
        let res = sqlx::query(
            "INSERT INTO agenda (message_id, scheduled_at, shown) VALUES (?, ?, 0) \
             ON CONFLICT(message_id, scheduled_at) DO NOTHING",
        )
        .bind(message_id)
        .bind(truncate_to_minute(scheduled_at))
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    /// Flip `shown` for the unshown entry of `message_id` within
    /// ±[`MARK_SHOWN_TOLERANCE_SECS`] of `scheduled_at`. Returns `false` when no
    /// unshown entry matched, i.e. someone else already claimed it.
    #[instrument(skip_all)]
    pub async fn mark_shown(&self, message_id: i64, scheduled_at: NaiveDateTime) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE agenda SET shown = 1 \
             WHERE message_id = ? AND shown = 0 \
               AND ABS(CAST(strftime('%s', scheduled_at) AS INTEGER) - CAST(strftime('%s', ?) AS INTEGER)) <= ?",
        )
        .bind(message_id)
        .bind(scheduled_at)
        .bind(MARK_SHOWN_TOLERANCE_SECS)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    #[instrument(skip_all)]
    pub async fn list_agenda(&self) -> Result<Vec<AgendaEntry>> {
        let rows: Vec<(i64, NaiveDateTime, bool)> = sqlx::query_as(
            "SELECT message_id, scheduled_at, shown FROM agenda ORDER BY scheduled_at ASC, message_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(into_entry).collect())
    }

    /// Today's entries scheduled at or before the minute of `now`.
    #[instrument(skip_all)]
    pub async fn list_today_until(&self, now: NaiveDateTime) -> Result<Vec<AgendaEntry>> {
        let rows: Vec<(i64, NaiveDateTime, bool)> = sqlx::query_as(
            "SELECT message_id, scheduled_at, shown FROM agenda \
             WHERE date(scheduled_at) = ? AND scheduled_at <= ? \
             ORDER BY scheduled_at ASC, message_id ASC",
        )
        .bind(now.date().format("%Y-%m-%d").to_string())
        .bind(truncate_to_minute(now))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(into_entry).collect())
    }

    /// Distinct message ids referenced by the agenda.
    pub async fn agenda_message_ids(&self) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar("SELECT DISTINCT message_id FROM agenda ORDER BY message_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    /// Delete entries whose date is not `today`. Returns the number removed.
    #[instrument(skip_all)]
    pub async fn purge_stale(&self, today: NaiveDate) -> Result<u64> {
        let res = sqlx::query("DELETE FROM agenda WHERE date(scheduled_at) != ?")
            .bind(today.format("%Y-%m-%d").to_string())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    #[instrument(skip_all)]
    pub async fn put_message(&self, id: i64, body: &Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO messages (id, body) VALUES (?, ?) \
             ON CONFLICT(id) DO UPDATE SET body = excluded.body, cached_at = CURRENT_TIMESTAMP",
        )
        .bind(id)
        .bind(body.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn has_message(&self, id: i64) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    /// Bodies for `ids`; ids with no cached body are simply absent.
    #[instrument(skip_all)]
    pub async fn get_messages(&self, ids: &[i64]) -> Result<HashMap<i64, Value>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT id, body FROM messages WHERE id IN (");
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
        let rows: Vec<(i64, String)> = qb.build_query_as().fetch_all(&self.pool).await?;

        let mut out = HashMap::with_capacity(rows.len());
        for (id, body) in rows {
            match serde_json::from_str(&body) {
                Ok(value) => {
                    out.insert(id, value);
                }
                Err(err) => warn!(?err, id, "cached message body is not valid JSON; ignoring"),
            }
        }
        Ok(out)
    }

    /// Replace the group snapshot in one transaction.
    #[instrument(skip_all)]
    pub async fn replace_groups(&self, groups: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM user_groups")
            .execute(&mut *tx)
            .await?;
        for group in groups {
            sqlx::query("INSERT INTO user_groups (name) VALUES (?)")
                .bind(group)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_groups(&self) -> Result<Vec<String>> {
        let groups = sqlx::query_scalar("SELECT name FROM user_groups ORDER BY rowid")
            .fetch_all(&self.pool)
            .await?;
        Ok(groups)
    }
}

fn into_entry((message_id, scheduled_at, shown): (i64, NaiveDateTime, bool)) -> AgendaEntry {
    AgendaEntry {
        message_id,
        scheduled_at,
        shown,
    }
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    // Rebuild URL, prefer sqlite:// form
    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Content, Message, MessageKind};
    use serde_json::json;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 18)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    async fn setup_cache() -> Cache {
        Cache::open("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let cache = setup_cache().await;
        assert!(cache.upsert_agenda(42, at(9, 0, 0)).await.unwrap());
        assert!(!cache.upsert_agenda(42, at(9, 0, 0)).await.unwrap());
        assert!(cache.agenda_exists(42, at(9, 0, 0)).await.unwrap());
        assert!(!cache.agenda_exists(42, at(9, 1, 0)).await.unwrap());
        assert_eq!(cache.list_agenda().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_agenda_is_ordered_by_time() {
        let cache = setup_cache().await;
        cache.upsert_agenda(2, at(11, 0, 0)).await.unwrap();
        cache.upsert_agenda(1, at(9, 30, 0)).await.unwrap();
        cache.upsert_agenda(3, at(10, 15, 0)).await.unwrap();
        let times: Vec<_> = cache
            .list_agenda()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.scheduled_at)
            .collect();
        assert_eq!(times, vec![at(9, 30, 0), at(10, 15, 0), at(11, 0, 0)]);
    }

    #[tokio::test]
    async fn mark_shown_tolerates_drift_and_claims_once() {
        let cache = setup_cache().await;
        cache.upsert_agenda(7, at(10, 0, 0)).await.unwrap();
        cache.upsert_agenda(7, at(11, 0, 0)).await.unwrap();

        assert!(!cache.mark_shown(7, at(10, 2, 0)).await.unwrap());
        assert!(cache.mark_shown(7, at(10, 0, 40)).await.unwrap());
        assert!(!cache.mark_shown(7, at(10, 0, 0)).await.unwrap());

        let agenda = cache.list_agenda().await.unwrap();
        assert!(agenda[0].shown);
        assert!(!agenda[1].shown);
    }

    #[tokio::test]
    async fn purge_keeps_only_today() {
        let cache = setup_cache().await;
        let yesterday = NaiveDate::from_ymd_opt(2026, 10, 17)
            .unwrap()
            .and_hms_opt(23, 59, 0)
            .unwrap();
        cache.upsert_agenda(1, yesterday).await.unwrap();
        cache.upsert_agenda(2, at(8, 0, 0)).await.unwrap();

        let removed = cache
            .purge_stale(NaiveDate::from_ymd_opt(2026, 10, 18).unwrap())
            .await
            .unwrap();
        assert_eq!(removed, 1);
        let agenda = cache.list_agenda().await.unwrap();
        assert_eq!(agenda.len(), 1);
        assert_eq!(agenda[0].message_id, 2);
    }

    #[tokio::test]
    async fn list_today_until_stops_at_current_minute() {
        let cache = setup_cache().await;
        cache.upsert_agenda(1, at(9, 0, 0)).await.unwrap();
        cache.upsert_agenda(2, at(10, 0, 0)).await.unwrap();
        cache.upsert_agenda(3, at(10, 1, 0)).await.unwrap();
        let listed: Vec<i64> = cache
            .list_today_until(at(10, 0, 30))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.message_id)
            .collect();
        assert_eq!(listed, vec![1, 2]);
    }

    #[tokio::test]
    async fn text_message_round_trip() {
        let cache = setup_cache().await;
        let msg = Message {
            id: 5,
            zone: 2,
            duration_seconds: 8,
            link: None,
            content: Content::Text { title: "Promo".into(), text: "50% off".into() },
        };
        cache.put_message(5, &msg.to_body()).await.unwrap();
        assert!(cache.has_message(5).await.unwrap());

        let bodies = cache.get_messages(&[5, 6]).await.unwrap();
        assert_eq!(bodies.len(), 1);
        let parsed = Message::parse(5, &bodies[&5]).unwrap();
        assert_eq!(parsed.kind(), MessageKind::Text);
        match parsed.content {
            Content::Text { title, text } => {
                assert_eq!(title.as_bytes(), b"Promo");
                assert_eq!(text.as_bytes(), b"50% off");
            }
            other => panic!("unexpected content {other:?}"),
        }
    }

    #[tokio::test]
    async fn put_message_replaces_body() {
        let cache = setup_cache().await;
        cache.put_message(1, &json!({ "type": "text", "v": 1 })).await.unwrap();
        cache.put_message(1, &json!({ "type": "text", "v": 2 })).await.unwrap();
        let bodies = cache.get_messages(&[1]).await.unwrap();
        assert_eq!(bodies[&1]["v"], 2);
        assert!(cache.get_messages(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replace_groups_is_a_snapshot() {
        let cache = setup_cache().await;
        cache
            .replace_groups(&["Soporte".to_string(), "Tecnología".to_string()])
            .await
            .unwrap();
        cache.replace_groups(&["Ventas".to_string()]).await.unwrap();
        assert_eq!(cache.list_groups().await.unwrap(), vec!["Ventas".to_string()]);
    }

    #[test]
    fn prepare_sqlite_url_passes_memory_through() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
    }

    #[test]
    fn prepare_sqlite_url_creates_parent() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("nested").join("agent.db");
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let rebuilt = prepare_sqlite_url(&url);
        assert_eq!(rebuilt, url);
        assert!(td.path().join("nested").exists());
    }
}
