//! The persistent, deduplicated post corpus and target registry (§4.A).
//!
//! Every operation runs through one `SqliteConnection` behind a
//! `tokio::sync::Mutex` instead of a pool: routing writers and readers
//! through a single connection is what makes `upsert_post`'s
//! insert-or-ignore return value trustworthy under concurrent callers
//! (the scheduler tick and an inbound `/api/fetch/once` request can both
//! be touching the store at once).

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{Row, SqliteConnection};
use tokio::sync::Mutex;

use crate::error::StoreError;

/// A monitored target (§3).
#[derive(Debug, Clone, serde::Serialize)]
pub struct Target {
    pub id: i64,
    pub kind: String,
    pub value: String,
    pub poll_interval_seconds: i64,
    pub last_fetched_id: Option<String>,
    pub last_fetched_at: Option<String>,
}

/// A captured post (§3).
#[derive(Debug, Clone, serde::Serialize)]
pub struct Post {
    pub id: String,
    pub target: String,
    pub content: String,
    pub created_at: String,
    pub raw: String,
    pub fetched_at: String,
    pub instance: String,
}

/// Fields needed to upsert one post, bundled so call sites at the
/// pipeline layer don't have to juggle a seven-argument call.
pub struct NewPost {
    pub id: String,
    pub target: String,
    pub content: String,
    pub created_at: String,
    pub raw: String,
    pub fetched_at: String,
    pub instance: String,
}

pub struct Store {
    conn: Mutex<SqliteConnection>,
}

impl Store {
    /// Wraps an already-open connection and ensures the schema exists.
    pub async fn new(conn: SqliteConnection) -> Result<Self, StoreError> {
        let store = Store {
            conn: Mutex::new(conn),
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS targets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                value TEXT NOT NULL,
                poll_interval_seconds INTEGER NOT NULL,
                last_fetched_id TEXT,
                last_fetched_at TEXT
            )
            "#,
        )
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS posts (
                id TEXT PRIMARY KEY,
                target TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                raw TEXT NOT NULL,
                fetched_at TEXT NOT NULL,
                instance TEXT NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS posts_target_idx ON posts(target)")
            .execute(&mut *conn)
            .await?;

        Ok(())
    }

    pub async fn add_target(
        &self,
        kind: &str,
        value: &str,
        poll_interval_seconds: i64,
    ) -> Result<i64, StoreError> {
        let mut conn = self.conn.lock().await;
        let result = sqlx::query(
            "INSERT INTO targets (kind, value, poll_interval_seconds) VALUES (?, ?, ?)",
        )
        .bind(kind)
        .bind(value)
        .bind(poll_interval_seconds)
        .execute(&mut *conn)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn delete_target(&self, id: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        sqlx::query("DELETE FROM targets WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn get_target(&self, id: i64) -> Result<Option<Target>, StoreError> {
        let mut conn = self.conn.lock().await;
        let row = sqlx::query(
            "SELECT id, kind, value, poll_interval_seconds, last_fetched_id, last_fetched_at \
             FROM targets WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row.map(row_to_target))
    }

    pub async fn get_targets(&self) -> Result<Vec<Target>, StoreError> {
        let mut conn = self.conn.lock().await;
        let rows = sqlx::query(
            "SELECT id, kind, value, poll_interval_seconds, last_fetched_id, last_fetched_at \
             FROM targets ORDER BY id ASC",
        )
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows.into_iter().map(row_to_target).collect())
    }

    /// Insert-or-ignore on `id`. Returns `true` iff a new row was inserted.
    pub async fn upsert_post(&self, post: NewPost) -> Result<bool, StoreError> {
        let mut conn = self.conn.lock().await;
        let result = sqlx::query(
            "INSERT OR IGNORE INTO posts (id, target, content, created_at, raw, fetched_at, instance) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&post.id)
        .bind(&post.target)
        .bind(&post.content)
        .bind(&post.created_at)
        .bind(&post.raw)
        .bind(&post.fetched_at)
        .bind(&post.instance)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_target_fetch_state(
        &self,
        id: i64,
        last_fetched_id: Option<&str>,
        last_fetched_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        sqlx::query("UPDATE targets SET last_fetched_id = ?, last_fetched_at = ? WHERE id = ?")
            .bind(last_fetched_id)
            .bind(last_fetched_at.to_rfc3339())
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn get_posts(
        &self,
        target: Option<&str>,
        limit: i64,
        query: Option<&str>,
    ) -> Result<Vec<Post>, StoreError> {
        let mut sql = String::from(
            "SELECT id, target, content, created_at, raw, fetched_at, instance FROM posts",
        );
        let mut conditions = Vec::new();
        if target.is_some() {
            conditions.push("target = ?");
        }
        if query.is_some() {
            conditions.push("content LIKE ? ESCAPE '\\'");
        }
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY datetime(created_at) DESC LIMIT ?");

        let mut q = sqlx::query(&sql);
        if let Some(target) = target {
            q = q.bind(target);
        }
        if let Some(query) = query {
            q = q.bind(format!("%{}%", like_escape(query)));
        }
        q = q.bind(limit);

        let mut conn = self.conn.lock().await;
        let rows = q.fetch_all(&mut *conn).await?;
        Ok(rows.into_iter().map(row_to_post).collect())
    }

    /// Streams every post as a JSON-line string, newest first.
    pub async fn export_posts(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.lock().await;
        let rows = sqlx::query(
            "SELECT id, target, content, created_at, raw, fetched_at, instance \
             FROM posts ORDER BY datetime(created_at) DESC",
        )
        .fetch_all(&mut *conn)
        .await?;
        drop(conn);

        Ok(rows
            .into_iter()
            .map(|row| {
                let post = row_to_post(row);
                let raw: JsonValue =
                    serde_json::from_str(&post.raw).unwrap_or_else(|_| serde_json::json!({}));
                serde_json::json!({
                    "id": post.id,
                    "target": post.target,
                    "content": post.content,
                    "created_at": post.created_at,
                    "raw": raw,
                    "fetched_at": post.fetched_at,
                    "instance": post.instance,
                })
                .to_string()
            })
            .collect())
    }

    /// For each distinct target, keeps only the `max_per_target` most
    /// recent rows by `created_at`; older rows are deleted. Ties are
    /// resolved arbitrarily (matches §4.A's tolerance note).
    pub async fn prune(&self, max_per_target: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let targets: Vec<String> = sqlx::query("SELECT DISTINCT target FROM posts")
            .fetch_all(&mut *conn)
            .await?
            .into_iter()
            .map(|row| row.get::<String, _>("target"))
            .collect();

        for target in targets {
            sqlx::query(
                "DELETE FROM posts WHERE target = ? AND id NOT IN ( \
                   SELECT id FROM posts WHERE target = ? ORDER BY datetime(created_at) DESC LIMIT ? \
                 )",
            )
            .bind(&target)
            .bind(&target)
            .bind(max_per_target)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }
}

fn like_escape(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn row_to_target(row: sqlx::sqlite::SqliteRow) -> Target {
    Target {
        id: row.get("id"),
        kind: row.get("kind"),
        value: row.get("value"),
        poll_interval_seconds: row.get("poll_interval_seconds"),
        last_fetched_id: row.get("last_fetched_id"),
        last_fetched_at: row.get("last_fetched_at"),
    }
}

fn row_to_post(row: sqlx::sqlite::SqliteRow) -> Post {
    Post {
        id: row.get("id"),
        target: row.get("target"),
        content: row.get("content"),
        created_at: row.get("created_at"),
        raw: row.get("raw"),
        fetched_at: row.get("fetched_at"),
        instance: row.get("instance"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> Store {
        let conn = common::open_sqlite_connection(":memory:").await.unwrap();
        Store::new(conn).await.unwrap()
    }

    fn post(id: &str, target: &str, content: &str, created_at: &str) -> NewPost {
        NewPost {
            id: id.to_string(),
            target: target.to_string(),
            content: content.to_string(),
            created_at: created_at.to_string(),
            raw: "{}".to_string(),
            fetched_at: "2024-01-01T00:00:00Z".to_string(),
            instance: "https://a.example".to_string(),
        }
    }

    #[tokio::test]
    async fn add_and_list_targets_ordered_by_id() {
        let store = test_store().await;
        let id1 = store.add_target("user", "alice", 60).await.unwrap();
        let id2 = store.add_target("hashtag", "rustlang", 120).await.unwrap();

        let targets = store.get_targets().await.unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].id, id1);
        assert_eq!(targets[1].id, id2);
        assert_eq!(targets[1].kind, "hashtag");
    }

    #[tokio::test]
    async fn delete_target_is_idempotent() {
        let store = test_store().await;
        let id = store.add_target("user", "alice", 60).await.unwrap();
        store.delete_target(id).await.unwrap();
        store.delete_target(id).await.unwrap();
        assert!(store.get_target(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_post_dedupes_by_id() {
        let store = test_store().await;
        assert!(store
            .upsert_post(post("t1", "user:alice", "hello", "2024-01-01T00:00:00Z"))
            .await
            .unwrap());
        assert!(!store
            .upsert_post(post("t1", "user:alice", "hello again", "2024-01-02T00:00:00Z"))
            .await
            .unwrap());

        let posts = store.get_posts(None, 50, None).await.unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].content, "hello");
    }

    #[tokio::test]
    async fn get_posts_filters_by_target_and_substring_ordered_desc() {
        let store = test_store().await;
        store
            .upsert_post(post("t1", "user:alice", "first post", "2024-01-01T00:00:00Z"))
            .await
            .unwrap();
        store
            .upsert_post(post("t2", "user:alice", "second post", "2024-01-02T00:00:00Z"))
            .await
            .unwrap();
        store
            .upsert_post(post("t3", "hashtag:rust", "unrelated", "2024-01-03T00:00:00Z"))
            .await
            .unwrap();

        let posts = store
            .get_posts(Some("user:alice"), 50, Some("post"))
            .await
            .unwrap();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].id, "t2");
        assert_eq!(posts[1].id, "t1");
    }

    #[tokio::test]
    async fn get_posts_applies_limit_last() {
        let store = test_store().await;
        for i in 0..5 {
            store
                .upsert_post(post(
                    &format!("t{i}"),
                    "user:alice",
                    "hi",
                    &format!("2024-01-0{}T00:00:00Z", i + 1),
                ))
                .await
                .unwrap();
        }
        let posts = store.get_posts(None, 2, None).await.unwrap();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].id, "t4");
        assert_eq!(posts[1].id, "t3");
    }

    #[tokio::test]
    async fn prune_keeps_n_most_recent_per_target() {
        let store = test_store().await;
        store
            .upsert_post(post("t1", "user:alice", "a", "2024-01-01T00:00:00Z"))
            .await
            .unwrap();
        store
            .upsert_post(post("t2", "user:alice", "b", "2024-01-02T00:00:00Z"))
            .await
            .unwrap();
        store
            .upsert_post(post("t3", "user:alice", "c", "2024-01-03T00:00:00Z"))
            .await
            .unwrap();

        store.prune(2).await.unwrap();

        let posts = store.get_posts(Some("user:alice"), 50, None).await.unwrap();
        let ids: Vec<&str> = posts.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["t3", "t2"]);
    }

    #[tokio::test]
    async fn export_posts_round_trips_raw_json() {
        let store = test_store().await;
        let mut p = post("t1", "user:alice", "hi", "2024-01-01T00:00:00Z");
        p.raw = serde_json::json!({"title": "hi"}).to_string();
        store.upsert_post(p).await.unwrap();

        let lines = store.export_posts().await.unwrap();
        assert_eq!(lines.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(value["raw"]["title"], "hi");
    }

    #[tokio::test]
    async fn export_posts_tolerates_unparsable_raw() {
        let store = test_store().await;
        let mut p = post("t1", "user:alice", "hi", "2024-01-01T00:00:00Z");
        p.raw = "not json".to_string();
        store.upsert_post(p).await.unwrap();

        let lines = store.export_posts().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(value["raw"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn update_target_fetch_state_records_id_and_time() {
        let store = test_store().await;
        let id = store.add_target("user", "alice", 60).await.unwrap();
        let now = Utc::now();
        store
            .update_target_fetch_state(id, Some("t9"), now)
            .await
            .unwrap();

        let target = store.get_target(id).await.unwrap().unwrap();
        assert_eq!(target.last_fetched_id.as_deref(), Some("t9"));
        assert_eq!(target.last_fetched_at.as_deref(), Some(now.to_rfc3339().as_str()));
    }
}
