use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Which fetch strategy produced a content item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentOrigin {
    Feed,
    PlatformApi,
    Scrape,
}

impl ContentOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentOrigin::Feed => "feed",
            ContentOrigin::PlatformApi => "platform-api",
            ContentOrigin::Scrape => "scrape",
        }
    }
}

/// One piece of source material, normalized to plain text. Lives for a single run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentItem {
    pub title: String,
    pub body: String,
    pub excerpt: String,
    pub source_url: String,
    pub published_at: DateTime<Utc>,
    pub author: Option<String>,
    pub origin: ContentOrigin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedPost {
    pub title: String,
    pub body: String,
    pub excerpt: String,
    pub community: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyTone {
    Helpful,
    Questioning,
    SharingExperience,
}

impl ReplyTone {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyTone::Helpful => "helpful",
            ReplyTone::Questioning => "questioning",
            ReplyTone::SharingExperience => "sharing_experience",
        }
    }

    /// Lenient label parsing for model output; unknown labels are `None`.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "helpful" => Some(ReplyTone::Helpful),
            "questioning" | "question" => Some(ReplyTone::Questioning),
            "sharing_experience" | "experience" => Some(ReplyTone::SharingExperience),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedReply {
    pub body: String,
    pub tone: ReplyTone,
}

/// Identity assigned by the persistence collaborator.
pub type PostId = String;
pub type ReplyId = String;

/// Existing post as seen by reply targeting.
#[derive(Debug, Clone, FromRow)]
pub struct PostRef {
    pub id: String,
    pub title: String,
    pub body: String,
    pub comment_count: i64,
    pub is_ai_generated: bool,
    pub created_at: DateTime<Utc>,
}
