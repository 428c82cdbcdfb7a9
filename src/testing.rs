//! Shared fakes for unit tests.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

use crate::clock::Clock;
use crate::llm::{ClientSettings, GenerationOptions};
use crate::models::{GeneratedPost, GeneratedReply, PostId, PostRef, ReplyId};
use crate::store::Persistence;

/// Manually advanced clock.
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    /// Default starting instant for tests: 2026-03-01 10:00:00 UTC.
    pub fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap()
    }

    pub fn arc() -> Arc<Self> {
        Self::at(Self::start())
    }

    pub fn at(now: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self { now: Mutex::new(now) })
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

pub fn client_settings(base_url: &str) -> ClientSettings {
    ClientSettings {
        api_key: Some("test-key".to_string()),
        base_url: base_url.to_string(),
        defaults: GenerationOptions::default(),
        timeout: Duration::from_secs(5),
        max_requests_per_hour: 100,
        cache_ttl: Some(chrono::Duration::hours(1)),
        min_length: 50,
        max_response_bytes: 1024 * 1024,
    }
}

/// In-memory persistence that records what the pipeline hands it.
#[derive(Default)]
pub struct FakePersistence {
    pub posts: Mutex<Vec<(PostId, GeneratedPost)>>,
    pub replies: Mutex<Vec<(PostId, GeneratedReply)>>,
    pub existing: Mutex<Vec<PostRef>>,
    pub posts_today: Mutex<u32>,
    pub fail_writes: Mutex<bool>,
}

impl FakePersistence {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn post_count(&self) -> usize {
        self.posts.lock().len()
    }

    pub fn reply_count(&self) -> usize {
        self.replies.lock().len()
    }
}

#[async_trait]
impl Persistence for FakePersistence {
    async fn create_post(&self, post: &GeneratedPost) -> Result<PostId> {
        if *self.fail_writes.lock() {
            bail!("disk full");
        }
        let mut posts = self.posts.lock();
        let id = format!("post-{}", posts.len() + 1);
        posts.push((id.clone(), post.clone()));
        *self.posts_today.lock() += 1;
        Ok(id)
    }

    async fn create_reply(&self, post_id: &PostId, reply: &GeneratedReply) -> Result<ReplyId> {
        if *self.fail_writes.lock() {
            bail!("disk full");
        }
        let mut replies = self.replies.lock();
        replies.push((post_id.clone(), reply.clone()));
        Ok(format!("reply-{}", replies.len()))
    }

    async fn list_recent_under_commented_posts(&self, since: DateTime<Utc>, max_comments: u32) -> Result<Vec<PostRef>> {
        Ok(self
            .existing
            .lock()
            .iter()
            .filter(|p| !p.is_ai_generated && p.created_at >= since && p.comment_count < i64::from(max_comments))
            .cloned()
            .collect())
    }

    async fn count_ai_posts_created_today(&self, _day_start: DateTime<Utc>) -> Result<u32> {
        Ok(*self.posts_today.lock())
    }
}
