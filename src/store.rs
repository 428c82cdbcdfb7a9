use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::SqlitePool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{GeneratedPost, GeneratedReply, PostId, PostRef, ReplyId};
use crate::telemetry::{
    DAILY_RETENTION_DAYS, DailyDelta, DailyStat, RUN_HISTORY_CAPACITY, RunCounts, RunEvent, RunRecord, RunTrigger,
    TelemetrySink,
};

/// Rows returned by the reply-target query.
const REPLY_CANDIDATE_LIMIT: i64 = 20;

/// Storage format for timestamps; sorts lexically.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Where generated content goes. The collaborator assigns identity.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn create_post(&self, post: &GeneratedPost) -> Result<PostId>;
    async fn create_reply(&self, post_id: &PostId, reply: &GeneratedReply) -> Result<ReplyId>;
    /// Human posts created at or after `since` with fewer than `max_comments` comments, newest first.
    async fn list_recent_under_commented_posts(&self, since: DateTime<Utc>, max_comments: u32) -> Result<Vec<PostRef>>;
    async fn count_ai_posts_created_today(&self, day_start: DateTime<Utc>) -> Result<u32>;
}

/// SQLite-backed persistence and telemetry.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Persistence for SqliteStore {
    async fn create_post(&self, post: &GeneratedPost) -> Result<PostId> {
        let id = Uuid::new_v4().to_string();
        let tags = serde_json::to_string(&post.tags).context("encoding post tags")?;

        sqlx::query(
            "INSERT INTO posts (id, title, body, excerpt, community, tags, is_ai_generated)
             VALUES (?, ?, ?, ?, ?, ?, 1)",
        )
        .bind(&id)
        .bind(&post.title)
        .bind(&post.body)
        .bind(&post.excerpt)
        .bind(&post.community)
        .bind(&tags)
        .execute(&self.pool)
        .await
        .context("inserting post")?;

        debug!(id = %id, title = %post.title, community = %post.community, "stored post");
        Ok(id)
    }

    async fn create_reply(&self, post_id: &PostId, reply: &GeneratedReply) -> Result<ReplyId> {
        let id = Uuid::new_v4().to_string();

        sqlx::query("INSERT INTO comments (id, post_id, body, tone, is_ai_generated) VALUES (?, ?, ?, ?, 1)")
            .bind(&id)
            .bind(post_id)
            .bind(&reply.body)
            .bind(reply.tone.as_str())
            .execute(&self.pool)
            .await
            .with_context(|| format!("inserting reply for post {post_id}"))?;

        debug!(id = %id, post_id = %post_id, tone = reply.tone.as_str(), "stored reply");
        Ok(id)
    }

    async fn list_recent_under_commented_posts(&self, since: DateTime<Utc>, max_comments: u32) -> Result<Vec<PostRef>> {
        let posts = sqlx::query_as::<_, PostRef>(
            "SELECT p.id, p.title, p.body, COUNT(c.id) AS comment_count, p.is_ai_generated, p.created_at
             FROM posts p
             LEFT JOIN comments c ON c.post_id = p.id
             WHERE p.created_at >= ? AND p.is_ai_generated = 0
             GROUP BY p.id
             HAVING COUNT(c.id) < ?
             ORDER BY p.created_at DESC
             LIMIT ?",
        )
        .bind(format_timestamp(since))
        .bind(i64::from(max_comments))
        .bind(REPLY_CANDIDATE_LIMIT)
        .fetch_all(&self.pool)
        .await
        .context("listing under-commented posts")?;
        Ok(posts)
    }

    async fn count_ai_posts_created_today(&self, day_start: DateTime<Utc>) -> Result<u32> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts WHERE is_ai_generated = 1 AND created_at >= ?")
            .bind(format_timestamp(day_start))
            .fetch_one(&self.pool)
            .await
            .context("counting today's AI posts")?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }
}

#[derive(sqlx::FromRow)]
struct RunRecordRow {
    run_trigger: String,
    event: String,
    timestamp: DateTime<Utc>,
    posts_created: i64,
    replies_created: i64,
    error: Option<String>,
}

impl RunRecordRow {
    fn into_record(self) -> Option<RunRecord> {
        let (Ok(trigger), Ok(event)) = (self.run_trigger.parse::<RunTrigger>(), self.event.parse::<RunEvent>()) else {
            warn!(trigger = %self.run_trigger, event = %self.event, "skipping unreadable run record");
            return None;
        };
        Some(RunRecord {
            trigger,
            event,
            timestamp: self.timestamp,
            counts: RunCounts {
                posts_created: u32::try_from(self.posts_created).unwrap_or_default(),
                replies_created: u32::try_from(self.replies_created).unwrap_or_default(),
            },
            error: self.error,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DailyStatRow {
    day: NaiveDate,
    posts: i64,
    replies: i64,
    runs: i64,
    errors: i64,
}

const RUN_COLUMNS: &str = "run_trigger, event, timestamp, posts_created, replies_created, error";

impl SqliteStore {
    async fn query_runs(&self, filter: &str, limit: usize) -> Result<Vec<RunRecord>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM run_records {filter} ORDER BY id DESC LIMIT ?");
        let rows = sqlx::query_as::<_, RunRecordRow>(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .context("querying run records")?;
        Ok(rows.into_iter().filter_map(RunRecordRow::into_record).collect())
    }
}

#[async_trait]
impl TelemetrySink for SqliteStore {
    async fn record_run(&self, record: RunRecord) -> Result<()> {
        let mut tx = self.pool.begin().await.context("starting transaction")?;

        sqlx::query(
            "INSERT INTO run_records (run_trigger, event, timestamp, posts_created, replies_created, error)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(record.trigger.as_str())
        .bind(record.event.as_str())
        .bind(format_timestamp(record.timestamp))
        .bind(i64::from(record.counts.posts_created))
        .bind(i64::from(record.counts.replies_created))
        .bind(&record.error)
        .execute(&mut *tx)
        .await
        .context("inserting run record")?;

        sqlx::query("DELETE FROM run_records WHERE id NOT IN (SELECT id FROM run_records ORDER BY id DESC LIMIT ?)")
            .bind(RUN_HISTORY_CAPACITY as i64)
            .execute(&mut *tx)
            .await
            .context("evicting old run records")?;

        tx.commit().await.context("committing run record")?;
        Ok(())
    }

    async fn add_daily(&self, day: NaiveDate, delta: DailyDelta) -> Result<()> {
        let mut tx = self.pool.begin().await.context("starting transaction")?;

        sqlx::query(
            "INSERT INTO daily_stats (day, posts, replies, runs, errors) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(day) DO UPDATE SET
                 posts = posts + excluded.posts,
                 replies = replies + excluded.replies,
                 runs = runs + excluded.runs,
                 errors = errors + excluded.errors",
        )
        .bind(day.format("%Y-%m-%d").to_string())
        .bind(i64::from(delta.posts))
        .bind(i64::from(delta.replies))
        .bind(i64::from(delta.runs))
        .bind(i64::from(delta.errors))
        .execute(&mut *tx)
        .await
        .context("updating daily stats")?;

        let cutoff = day - Duration::days(DAILY_RETENTION_DAYS);
        sqlx::query("DELETE FROM daily_stats WHERE day <= ?")
            .bind(cutoff.format("%Y-%m-%d").to_string())
            .execute(&mut *tx)
            .await
            .context("purging old daily stats")?;

        tx.commit().await.context("committing daily stats")?;
        Ok(())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        self.query_runs("", limit).await
    }

    async fn recent_errors(&self, limit: usize) -> Result<Vec<RunRecord>> {
        self.query_runs("WHERE event = 'error'", limit).await
    }

    async fn daily_stats(&self) -> Result<Vec<(NaiveDate, DailyStat)>> {
        let rows = sqlx::query_as::<_, DailyStatRow>(
            "SELECT day, posts, replies, runs, errors FROM daily_stats ORDER BY day DESC",
        )
        .fetch_all(&self.pool)
        .await
        .context("querying daily stats")?;

        let to_u32 = |v: i64| u32::try_from(v).unwrap_or_default();
        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.day,
                    DailyStat {
                        posts: to_u32(row.posts),
                        replies: to_u32(row.replies),
                        runs: to_u32(row.runs),
                        errors: to_u32(row.errors),
                    },
                )
            })
            .collect())
    }

    async fn last_run_at(&self) -> Result<Option<DateTime<Utc>>> {
        let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
            "SELECT timestamp FROM run_records WHERE event = 'attempt' AND run_trigger != 'test'
             ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("reading last run timestamp")?;
        Ok(row.map(|(ts,)| ts))
    }
}

/// Read a setting from the settings table.
pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await
        .context("reading setting")?;
    Ok(row.map(|(v,)| v))
}

/// Upsert a setting in the settings table.
pub async fn set_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await
    .context("upserting setting")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use crate::models::ReplyTone;
    use chrono::TimeZone;

    fn post(title: &str) -> GeneratedPost {
        GeneratedPost {
            title: title.to_string(),
            body: "Body text".to_string(),
            excerpt: "Body".to_string(),
            community: "general".to_string(),
            tags: vec!["a".to_string()],
        }
    }

    async fn insert_human_post(pool: &SqlitePool, id: &str, created_at: &str) {
        sqlx::query("INSERT INTO posts (id, title, body, created_at) VALUES (?, 'Human', 'Hi', ?)")
            .bind(id)
            .bind(created_at)
            .execute(pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn creates_posts_and_replies_flagged_as_ai() {
        let store = SqliteStore::new(memory_pool().await);
        let id = store.create_post(&post("First")).await.unwrap();
        let reply = GeneratedReply {
            body: "Nice one".to_string(),
            tone: ReplyTone::SharingExperience,
        };
        store.create_reply(&id, &reply).await.unwrap();

        let (ai, tags): (bool, String) = sqlx::query_as("SELECT is_ai_generated, tags FROM posts WHERE id = ?")
            .bind(&id)
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert!(ai);
        assert_eq!(tags, "[\"a\"]");

        let (tone,): (String,) = sqlx::query_as("SELECT tone FROM comments WHERE post_id = ?")
            .bind(&id)
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(tone, "sharing_experience");

        let midnight = Utc::now() - Duration::hours(1);
        assert_eq!(store.count_ai_posts_created_today(midnight).await.unwrap(), 1);
        assert_eq!(
            store
                .count_ai_posts_created_today(Utc::now() + Duration::hours(1))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn lists_recent_posts_under_comment_threshold() {
        let store = SqliteStore::new(memory_pool().await);
        let pool = &store.pool;
        insert_human_post(pool, "old", "2026-02-01T10:00:00Z").await;
        insert_human_post(pool, "quiet", "2026-03-01T10:00:00Z").await;
        insert_human_post(pool, "busy", "2026-03-01T11:00:00Z").await;
        for i in 0..3 {
            sqlx::query("INSERT INTO comments (id, post_id, body) VALUES (?, 'busy', 'x')")
                .bind(format!("c{i}"))
                .execute(pool)
                .await
                .unwrap();
        }
        sqlx::query("INSERT INTO comments (id, post_id, body) VALUES ('q1', 'quiet', 'x')")
            .execute(pool)
            .await
            .unwrap();

        let since = Utc.with_ymd_and_hms(2026, 2, 25, 0, 0, 0).unwrap();
        let posts = store.list_recent_under_commented_posts(since, 3).await.unwrap();

        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].id, "quiet");
        assert_eq!(posts[0].comment_count, 1);
        assert!(!posts[0].is_ai_generated);
    }

    #[tokio::test]
    async fn recent_ai_posts_do_not_crowd_out_human_posts() {
        let store = SqliteStore::new(memory_pool().await);
        let now = Utc::now();
        insert_human_post(&store.pool, "human", &format_timestamp(now - Duration::hours(1))).await;
        for i in 0..(REPLY_CANDIDATE_LIMIT + 1) {
            store.create_post(&post(&format!("Generated {i}"))).await.unwrap();
        }

        let posts = store
            .list_recent_under_commented_posts(now - Duration::days(1), 3)
            .await
            .unwrap();

        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].id, "human");
        assert!(posts.iter().all(|p| !p.is_ai_generated));
    }

    #[tokio::test]
    async fn run_records_are_capped_and_filtered() {
        let store = SqliteStore::new(memory_pool().await);
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();

        for i in 0..(RUN_HISTORY_CAPACITY as i64 + 3) {
            let record = RunRecord::attempt(RunTrigger::Scheduled, base + Duration::minutes(i));
            store.record_run(record).await.unwrap();
        }
        store
            .record_run(RunRecord::attempt(RunTrigger::Test, base + Duration::hours(5)))
            .await
            .unwrap();
        store
            .record_run(RunRecord::error(
                RunTrigger::Manual,
                base + Duration::hours(6),
                RunCounts {
                    posts_created: 1,
                    replies_created: 0,
                },
                "boom".to_string(),
            ))
            .await
            .unwrap();

        let runs = store.recent_runs(1000).await.unwrap();
        assert_eq!(runs.len(), RUN_HISTORY_CAPACITY);
        assert_eq!(runs[0].event, RunEvent::Error);

        let errors = store.recent_errors(10).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error.as_deref(), Some("boom"));
        assert_eq!(errors[0].counts.posts_created, 1);

        assert_eq!(
            store.last_run_at().await.unwrap(),
            Some(base + Duration::minutes(RUN_HISTORY_CAPACITY as i64 + 2))
        );
    }

    #[tokio::test]
    async fn daily_stats_accumulate_within_window() {
        let store = SqliteStore::new(memory_pool().await);
        let day = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();

        store.add_daily(day, DailyDelta::run()).await.unwrap();
        store.add_daily(day, DailyDelta::output(3, 7)).await.unwrap();
        store
            .add_daily(day + Duration::days(DAILY_RETENTION_DAYS), DailyDelta::error())
            .await
            .unwrap();

        let stats = store.daily_stats().await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].1.errors, 1);

        let day2 = day + Duration::days(DAILY_RETENTION_DAYS + 1);
        store.add_daily(day2, DailyDelta::output(3, 7)).await.unwrap();
        store.add_daily(day2, DailyDelta::run()).await.unwrap();
        let totals = store.totals().await.unwrap();
        assert_eq!((totals.posts, totals.replies, totals.runs, totals.errors), (3, 7, 1, 1));
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let pool = memory_pool().await;
        assert_eq!(get_setting(&pool, "status_token").await.unwrap(), None);
        set_setting(&pool, "status_token", "abc").await.unwrap();
        set_setting(&pool, "status_token", "def").await.unwrap();
        assert_eq!(get_setting(&pool, "status_token").await.unwrap().as_deref(), Some("def"));
    }
}
