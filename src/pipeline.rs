//! Batch workflow: fetch sources, generate posts and replies, hand them to persistence,
//! and record the run.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::PipelineError;
use crate::fetch::ContentFetcher;
use crate::llm::{GenerationOptions, LlmClient};
use crate::models::{GeneratedPost, GeneratedReply, PostId};
use crate::parse::{parse_posts, parse_replies};
use crate::prompts::{SYSTEM_PROMPT, post_prompt, reply_prompt};
use crate::quality::{self, QualityReport};
use crate::scheduler::Schedule;
use crate::store::Persistence;
use crate::telemetry::{DailyDelta, RunCounts, RunRecord, RunTrigger, TelemetrySink};

/// Source items used by a test run.
const TEST_MAX_ITEMS: usize = 3;
/// Posts generated by a test run.
const TEST_MAX_POSTS: u32 = 2;
/// Existing posts picked up for replies in one run.
const MAX_EXISTING_REPLY_TARGETS: usize = 5;

#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub schedule: Schedule,
    pub daily_quota: u32,
    pub replies_per_post: u32,
    pub topics: Vec<String>,
    pub communities: Vec<String>,
    pub min_quality_score: f64,
    pub moderate_posts: bool,
    pub reply_window: chrono::Duration,
    pub reply_max_comments: u32,
    pub timezone: Tz,
}

impl GenerationSettings {
    pub fn from_config(config: &Config) -> Self {
        let generation = &config.generation;
        Self {
            schedule: generation.schedule(),
            daily_quota: generation.daily_quota,
            replies_per_post: generation.replies_per_post(),
            topics: generation.topics.clone(),
            communities: generation.communities.clone(),
            min_quality_score: generation.min_quality_score,
            moderate_posts: generation.moderate_posts,
            reply_window: chrono::Duration::days(i64::from(generation.reply_window_days)),
            reply_max_comments: generation.reply_max_comments,
            timezone: config.timezone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    CheckingDue,
    Fetching,
    GeneratingPosts,
    GeneratingReplies,
    Recording,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplyPreview {
    pub post_title: String,
    pub reply: GeneratedReply,
}

/// Generated records returned by a test run instead of being persisted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Preview {
    pub posts: Vec<GeneratedPost>,
    pub replies: Vec<ReplyPreview>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub trigger: RunTrigger,
    pub source_items: usize,
    pub posts_requested: u32,
    pub posts_created: u32,
    pub posts_rejected: u32,
    pub replies_created: u32,
    pub reply_targets: usize,
    /// Whether the post output decoded as JSON rather than through the text fallback.
    pub structured_output: Option<bool>,
    pub quality: QualityReport,
    pub preview: Option<Preview>,
}

impl BatchSummary {
    fn new(trigger: RunTrigger) -> Self {
        Self {
            trigger,
            source_items: 0,
            posts_requested: 0,
            posts_created: 0,
            posts_rejected: 0,
            replies_created: 0,
            reply_targets: 0,
            structured_output: None,
            quality: QualityReport::default(),
            preview: trigger.is_test().then(Preview::default),
        }
    }

    fn counts(&self) -> RunCounts {
        RunCounts {
            posts_created: self.posts_created,
            replies_created: self.replies_created,
        }
    }
}

struct ReplyTarget {
    /// `None` for posts generated by a test run.
    post_id: Option<PostId>,
    title: String,
    body: String,
}

pub struct Orchestrator {
    settings: GenerationSettings,
    llm: Arc<LlmClient>,
    fetcher: ContentFetcher,
    store: Arc<dyn Persistence>,
    telemetry: Arc<dyn TelemetrySink>,
    clock: Arc<dyn Clock>,
    phase: Mutex<RunPhase>,
}

impl Orchestrator {
    pub fn new(
        settings: GenerationSettings,
        llm: Arc<LlmClient>,
        fetcher: ContentFetcher,
        store: Arc<dyn Persistence>,
        telemetry: Arc<dyn TelemetrySink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            llm,
            fetcher,
            store,
            telemetry,
            clock,
            phase: Mutex::new(RunPhase::Idle),
        }
    }

    pub fn phase(&self) -> RunPhase {
        *self.phase.lock()
    }

    pub fn schedule(&self) -> Schedule {
        self.settings.schedule
    }

    pub fn llm(&self) -> &LlmClient {
        &self.llm
    }

    pub fn telemetry(&self) -> &dyn TelemetrySink {
        self.telemetry.as_ref()
    }

    fn set_phase(&self, next: RunPhase) {
        let mut phase = self.phase.lock();
        if *phase != next {
            debug!(from = ?*phase, to = ?next, "run phase");
            *phase = next;
        }
    }

    /// Calendar day in the configured timezone.
    fn local_day(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.settings.timezone).date_naive()
    }

    /// Start of the local day containing `now`, in UTC.
    fn day_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let midnight = self.local_day(now).and_time(chrono::NaiveTime::MIN);
        self.settings
            .timezone
            .from_local_datetime(&midnight)
            .earliest()
            .map_or_else(|| midnight.and_utc(), |local| local.with_timezone(&Utc))
    }

    /// Whether the schedule interval has elapsed since the last non-test attempt.
    pub async fn should_run_now(&self) -> Result<bool, PipelineError> {
        self.set_phase(RunPhase::CheckingDue);
        let due = self.check_due().await;
        self.set_phase(RunPhase::Idle);
        due
    }

    async fn check_due(&self) -> Result<bool, PipelineError> {
        let Some(interval) = self.settings.schedule.interval() else {
            return Ok(false);
        };
        let last = self.telemetry.last_run_at().await.map_err(PipelineError::storage)?;
        Ok(match last {
            Some(last) => self.clock.now() - last >= interval,
            None => true,
        })
    }

    /// Posts this run may create: the per-run share of the daily quota, capped by what is left today.
    pub async fn posts_to_create(&self) -> Result<u32, PipelineError> {
        let quota = self.settings.daily_quota;
        let per_run = quota.div_ceil(self.settings.schedule.runs_per_day());
        let day_start = self.day_start(self.clock.now());
        let created_today = self
            .store
            .count_ai_posts_created_today(day_start)
            .await
            .map_err(PipelineError::storage)?;
        Ok(per_run.min(quota.saturating_sub(created_today)))
    }

    pub async fn run_manual(&self) -> Result<BatchSummary, PipelineError> {
        self.run_batch(RunTrigger::Manual).await
    }

    /// Runs only when due. `Ok(None)` means nothing was due.
    pub async fn run_scheduled(&self) -> Result<Option<BatchSummary>, PipelineError> {
        if !self.should_run_now().await? {
            return Ok(None);
        }
        self.run_batch(RunTrigger::Scheduled).await.map(Some)
    }

    /// Small run that returns generated records instead of persisting them.
    pub async fn run_test(&self) -> Result<BatchSummary, PipelineError> {
        self.run_batch(RunTrigger::Test).await
    }

    pub async fn run_batch(&self, trigger: RunTrigger) -> Result<BatchSummary, PipelineError> {
        let started = self.clock.now();
        let day = self.local_day(started);
        info!(trigger = %trigger, "starting generation run");

        self.record_run(RunRecord::attempt(trigger, started)).await;
        self.add_daily(day, DailyDelta::run()).await;

        let mut summary = BatchSummary::new(trigger);
        let outcome = self.execute(&mut summary).await;
        if outcome.is_err() {
            self.set_phase(RunPhase::Error);
        }
        self.set_phase(RunPhase::Recording);

        let counts = summary.counts();
        let finished = self.clock.now();
        if !trigger.is_test() && (counts.posts_created > 0 || counts.replies_created > 0) {
            self.add_daily(day, DailyDelta::output(counts.posts_created, counts.replies_created))
                .await;
        }

        let result = match outcome {
            Ok(()) => {
                self.record_run(RunRecord::success(trigger, finished, counts)).await;
                info!(
                    trigger = %trigger,
                    posts = counts.posts_created,
                    replies = counts.replies_created,
                    rejected = summary.posts_rejected,
                    "generation run complete"
                );
                Ok(summary)
            }
            Err(err) => {
                self.record_run(RunRecord::error(trigger, finished, counts, err.to_string()))
                    .await;
                self.add_daily(day, DailyDelta::error()).await;
                warn!(trigger = %trigger, kind = err.kind(), error = %err, "generation run failed");
                Err(err)
            }
        };

        self.set_phase(RunPhase::Idle);
        result
    }

    async fn execute(&self, summary: &mut BatchSummary) -> Result<(), PipelineError> {
        let test = summary.trigger.is_test();

        self.set_phase(RunPhase::Fetching);
        let mut items = self.fetcher.fetch_all().await;
        if items.is_empty() {
            return Err(PipelineError::NoSourceContent {
                sources: self.fetcher.source_count(),
            });
        }
        if test {
            items.truncate(TEST_MAX_ITEMS);
        }
        summary.source_items = items.len();

        self.set_phase(RunPhase::GeneratingPosts);
        let mut quota = self.posts_to_create().await?;
        if test {
            quota = quota.min(TEST_MAX_POSTS);
        }
        summary.posts_requested = quota;

        let options = self.llm.default_options().with_system(SYSTEM_PROMPT);
        let mut targets = Vec::new();

        if quota > 0 {
            let prompt = post_prompt(&items, &self.settings.topics, &self.settings.communities, quota);
            let result = self.llm.generate(&prompt, &options).await?;
            let outcome = parse_posts(&result.content);
            summary.structured_output = Some(outcome.is_structured());
            if !outcome.is_structured() {
                debug!("post output was not JSON, used text fallback");
            }

            for post in outcome.into_records().into_iter().take(quota as usize) {
                if let Some(target) = self.accept_post(post, summary, test).await? {
                    targets.push(target);
                }
            }
        } else {
            info!("daily post quota reached, skipping post generation");
        }

        self.set_phase(RunPhase::GeneratingReplies);
        let per_post = self.settings.replies_per_post;
        if per_post == 0 {
            debug!("reply generation disabled");
            return Ok(());
        }

        if !test {
            self.add_existing_targets(&mut targets).await?;
        }
        summary.reply_targets = targets.len();

        for target in &targets {
            self.reply_to(target, per_post, &options, summary).await?;
        }

        Ok(())
    }

    /// Score, optionally moderate, and persist (or preview) one generated post.
    async fn accept_post(
        &self,
        mut post: GeneratedPost,
        summary: &mut BatchSummary,
        test: bool,
    ) -> Result<Option<ReplyTarget>, PipelineError> {
        let score = quality::score(&post.body);
        summary.quality.push(score);
        if score < self.settings.min_quality_score {
            debug!(title = %post.title, score, "post below quality threshold, dropped");
            summary.posts_rejected += 1;
            return Ok(None);
        }

        if self.settings.moderate_posts {
            let text = format!("{}\n\n{}", post.title, post.body);
            let verdict = self.llm.moderate(&text, Some("community discussion post")).await;
            if !verdict.appropriate {
                info!(title = %post.title, reason = %verdict.reason, "post rejected by moderation");
                summary.posts_rejected += 1;
                return Ok(None);
            }
        }

        if !self.settings.communities.contains(&post.community)
            && let Some(fallback) = self.settings.communities.first()
        {
            debug!(requested = %post.community, using = %fallback, "unknown community");
            post.community = fallback.clone();
        }

        let post_id = match summary.preview.as_mut() {
            Some(preview) if test => {
                preview.posts.push(post.clone());
                None
            }
            _ => Some(self.store.create_post(&post).await.map_err(PipelineError::storage)?),
        };
        summary.posts_created += 1;

        Ok(Some(ReplyTarget {
            post_id,
            title: post.title,
            body: post.body,
        }))
    }

    /// Recent, under-commented, human-authored posts not already targeted.
    async fn add_existing_targets(&self, targets: &mut Vec<ReplyTarget>) -> Result<(), PipelineError> {
        let since = self.clock.now() - self.settings.reply_window;
        let existing = self
            .store
            .list_recent_under_commented_posts(since, self.settings.reply_max_comments)
            .await
            .map_err(PipelineError::storage)?;

        for post in existing.into_iter().take(MAX_EXISTING_REPLY_TARGETS) {
            if targets.iter().any(|t| t.post_id.as_ref() == Some(&post.id)) {
                continue;
            }
            targets.push(ReplyTarget {
                post_id: Some(post.id),
                title: post.title,
                body: post.body,
            });
        }
        Ok(())
    }

    async fn reply_to(
        &self,
        target: &ReplyTarget,
        per_post: u32,
        options: &GenerationOptions,
        summary: &mut BatchSummary,
    ) -> Result<(), PipelineError> {
        let prompt = reply_prompt(&target.title, &target.body, per_post);
        let result = self.llm.generate(&prompt, options).await?;

        for reply in parse_replies(&result.content).into_records().into_iter().take(per_post as usize) {
            summary.quality.push(quality::score(&reply.body));
            match (&target.post_id, summary.preview.as_mut()) {
                (Some(post_id), None) => {
                    self.store
                        .create_reply(post_id, &reply)
                        .await
                        .map_err(PipelineError::storage)?;
                }
                (_, Some(preview)) => preview.replies.push(ReplyPreview {
                    post_title: target.title.clone(),
                    reply,
                }),
                (None, None) => continue,
            }
            summary.replies_created += 1;
        }
        Ok(())
    }

    /// Telemetry is best-effort: failures are logged and the run continues.
    async fn record_run(&self, record: RunRecord) {
        if let Err(e) = self.telemetry.record_run(record).await {
            warn!(error = %e, "failed to record run");
        }
    }

    async fn add_daily(&self, day: NaiveDate, delta: DailyDelta) {
        if let Err(e) = self.telemetry.add_daily(day, delta).await {
            warn!(error = %e, "failed to update daily stats");
        }
    }
}
