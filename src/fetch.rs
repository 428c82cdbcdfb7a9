use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::Result;
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, Utc};
use scraper::{Html, Selector};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{Config, SourceConfig, SourceAuthConfig, parse_duration};
use crate::error::FetchError;
use crate::http::{HttpRequest, HttpResponse, Transport};
use crate::models::{ContentItem, ContentOrigin};
use crate::text::{excerpt, normalize};

/// Conventional feed locations tried against the site URL.
const FEED_PATHS: &[&str] = &["/feed/", "/rss.xml", "/feed.xml", "/rss/", "/atom.xml"];
const WORDPRESS_POSTS_PATH: &str = "/wp-json/wp/v2/posts?per_page=10&_embed";

pub const MAX_ITEMS_PER_SOURCE: usize = 10;
pub const MAX_ITEMS_TOTAL: usize = 20;
const MAX_HEADINGS: usize = 5;
const EXCERPT_CHARS: usize = 200;

static TITLE_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("title").expect("valid title selector"));
static HEADING_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h1, h2, h3").expect("valid heading selector"));

/// Pulls recent material from configured sources: feed, then WordPress API, then page scrape.
pub struct ContentFetcher {
    sources: Vec<SourceConfig>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    max_body_bytes: usize,
}

impl ContentFetcher {
    pub fn new(
        sources: Vec<SourceConfig>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            sources,
            transport,
            clock,
            timeout,
            max_body_bytes,
        }
    }

    pub fn from_config(config: &Config, transport: Arc<dyn Transport>, clock: Arc<dyn Clock>) -> Result<Self> {
        let timeout = parse_duration("fetch timeout", &config.fetch.timeout)?;
        Ok(Self::new(
            config.source.clone(),
            transport,
            clock,
            timeout,
            config.fetch.max_body_bytes,
        ))
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Fetch every source, newest items first, capped at [`MAX_ITEMS_TOTAL`].
    /// A failing source is logged and skipped.
    pub async fn fetch_all(&self) -> Vec<ContentItem> {
        let mut items = Vec::new();

        for source in &self.sources {
            match self.fetch_source(source).await {
                Ok(fetched) => {
                    let origin = fetched.first().map_or("none", |item| item.origin.as_str());
                    info!(source = %source.label(), items = fetched.len(), origin, "fetched source");
                    items.extend(fetched);
                }
                Err(e) => {
                    warn!(source = %source.label(), error = %e, "source fetch failed, skipping");
                }
            }
        }

        items.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        items.truncate(MAX_ITEMS_TOTAL);
        items
    }

    /// Run the strategy chain for one source. The first strategy yielding items wins.
    pub async fn fetch_source(&self, source: &SourceConfig) -> Result<Vec<ContentItem>, FetchError> {
        let url = source.url.as_str();
        let auth = auth_headers(source.auth.as_ref());
        let base = site_base(url);
        let mut failures = Vec::new();

        for candidate in feed_candidates(url, &base) {
            match self.try_feed(&candidate, &auth).await {
                Ok(items) => return Ok(items),
                Err(e) => {
                    debug!(url = %candidate, error = %e, "feed candidate failed");
                    failures.push(format!("feed: {e}"));
                }
            }
        }

        let api_url = format!("{base}{WORDPRESS_POSTS_PATH}");
        match self.try_wordpress(&api_url, &auth).await {
            Ok(items) => return Ok(items),
            Err(e) => {
                debug!(url = %api_url, error = %e, "platform API failed");
                failures.push(format!("api: {e}"));
            }
        }

        match self.try_scrape(url, &auth).await {
            Ok(items) => return Ok(items),
            Err(e) => {
                debug!(url = %url, error = %e, "scrape failed");
                failures.push(format!("scrape: {e}"));
            }
        }

        Err(FetchError::Exhausted {
            url: url.to_string(),
            failures,
        })
    }

    async fn get(&self, url: &str, auth: &[(String, String)]) -> Result<HttpResponse, FetchError> {
        let request = HttpRequest::get(url)
            .headers(auth.iter().cloned())
            .timeout(self.timeout)
            .max_body_bytes(self.max_body_bytes);
        let response = self.transport.send(request).await?;
        if !response.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: response.status,
            });
        }
        Ok(response)
    }

    async fn try_feed(&self, url: &str, auth: &[(String, String)]) -> Result<Vec<ContentItem>, FetchError> {
        let response = self.get(url, auth).await?;
        let feed = feed_rs::parser::parse(&response.body[..]).map_err(|e| FetchError::Parse {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        let now = self.clock.now();
        let mut items: Vec<ContentItem> = feed
            .entries
            .into_iter()
            .filter_map(|entry| {
                // Prefer full content over summary
                let summary = entry.summary.map(|s| normalize(&s.content)).filter(|s| !s.is_empty());
                let body = entry
                    .content
                    .and_then(|c| c.body)
                    .map(|b| normalize(&b))
                    .filter(|b| !b.is_empty())
                    .or_else(|| summary.clone())
                    .unwrap_or_default();
                let title = entry.title.map(|t| normalize(&t.content)).unwrap_or_default();

                if body.is_empty() && title.is_empty() {
                    debug!(entry_id = %entry.id, "skipping empty entry");
                    return None;
                }

                Some(ContentItem {
                    excerpt: summary
                        .map(|s| excerpt(&s, EXCERPT_CHARS))
                        .unwrap_or_else(|| excerpt(&body, EXCERPT_CHARS)),
                    source_url: entry
                        .links
                        .first()
                        .map(|l| l.href.clone())
                        .unwrap_or_else(|| url.to_string()),
                    published_at: entry.published.or(entry.updated).unwrap_or(now),
                    author: entry.authors.first().map(|a| a.name.clone()),
                    origin: ContentOrigin::Feed,
                    title,
                    body,
                })
            })
            .collect();

        items.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        items.truncate(MAX_ITEMS_PER_SOURCE);
        non_empty(url, items)
    }

    async fn try_wordpress(&self, url: &str, auth: &[(String, String)]) -> Result<Vec<ContentItem>, FetchError> {
        let response = self.get(url, auth).await?;
        let posts: Vec<WpPost> = serde_json::from_slice(&response.body).map_err(|e| FetchError::Parse {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        let now = self.clock.now();
        let items = posts
            .into_iter()
            .take(MAX_ITEMS_PER_SOURCE)
            .filter_map(|post| {
                let title = normalize(&post.title.rendered);
                let body = post.content.map(|c| normalize(&c.rendered)).unwrap_or_default();
                if title.is_empty() && body.is_empty() {
                    return None;
                }
                let summary = post.excerpt.map(|e| normalize(&e.rendered)).filter(|e| !e.is_empty());
                Some(ContentItem {
                    excerpt: excerpt(summary.as_deref().unwrap_or(&body), EXCERPT_CHARS),
                    source_url: post.link.unwrap_or_else(|| url.to_string()),
                    published_at: post.date_gmt.as_deref().and_then(parse_wp_date).unwrap_or(now),
                    author: post
                        .embedded
                        .and_then(|e| e.author.into_iter().next())
                        .and_then(|a| a.name),
                    origin: ContentOrigin::PlatformApi,
                    title,
                    body,
                })
            })
            .collect();
        non_empty(url, items)
    }

    async fn try_scrape(&self, url: &str, auth: &[(String, String)]) -> Result<Vec<ContentItem>, FetchError> {
        let response = self.get(url, auth).await?;
        let (page_title, headings) = scrape_topics(&response.text());

        let now = self.clock.now();
        let make_item = |title: String, body: String| ContentItem {
            excerpt: excerpt(&body, EXCERPT_CHARS),
            source_url: url.to_string(),
            published_at: now,
            author: None,
            origin: ContentOrigin::Scrape,
            title,
            body,
        };

        let items = if headings.is_empty() {
            page_title.map(|t| make_item(t.clone(), t)).into_iter().collect()
        } else {
            headings
                .into_iter()
                .map(|heading| {
                    let body = match &page_title {
                        Some(page) => format!("{heading} ({page})"),
                        None => heading.clone(),
                    };
                    make_item(heading, body)
                })
                .collect()
        };
        non_empty(url, items)
    }
}

fn non_empty(url: &str, items: Vec<ContentItem>) -> Result<Vec<ContentItem>, FetchError> {
    if items.is_empty() {
        Err(FetchError::Empty { url: url.to_string() })
    } else {
        Ok(items)
    }
}

/// Page title and up to [`MAX_HEADINGS`] heading texts.
fn scrape_topics(html: &str) -> (Option<String>, Vec<String>) {
    let document = Html::parse_document(html);
    let text_of = |el: scraper::ElementRef<'_>| normalize(&el.text().collect::<String>());

    let title = document
        .select(&TITLE_SELECTOR)
        .next()
        .map(text_of)
        .filter(|t| !t.is_empty());
    let headings = document
        .select(&HEADING_SELECTOR)
        .map(text_of)
        .filter(|t| !t.is_empty())
        .take(MAX_HEADINGS)
        .collect();
    (title, headings)
}

fn looks_like_feed(url: &str) -> bool {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_lowercase())
        .unwrap_or_else(|_| url.to_lowercase());
    path.contains("feed") || path.contains("rss") || path.contains("atom") || path.ends_with(".xml")
}

/// Base the conventional paths are appended to: the URL itself for a site, its origin for a feed URL.
fn site_base(url: &str) -> String {
    if looks_like_feed(url)
        && let Ok(parsed) = url::Url::parse(url)
    {
        return parsed.origin().ascii_serialization();
    }
    url.trim_end_matches('/').to_string()
}

fn feed_candidates(url: &str, base: &str) -> Vec<String> {
    let mut candidates = Vec::with_capacity(FEED_PATHS.len() + 1);
    if looks_like_feed(url) {
        candidates.push(url.to_string());
    }
    for path in FEED_PATHS {
        let candidate = format!("{base}{path}");
        if !candidates.contains(&candidate) {
            candidates.push(candidate);
        }
    }
    candidates
}

fn auth_headers(auth: Option<&SourceAuthConfig>) -> Vec<(String, String)> {
    let Some(auth) = auth else {
        return Vec::new();
    };
    match auth.auth_type.as_str() {
        "basic" => match (&auth.username, &auth.password) {
            (Some(user), Some(pass)) => {
                let credentials = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
                vec![("Authorization".to_string(), format!("Basic {credentials}"))]
            }
            _ => Vec::new(),
        },
        "bearer" => auth
            .token
            .as_ref()
            .map(|token| vec![("Authorization".to_string(), format!("Bearer {token}"))])
            .unwrap_or_default(),
        "header" => match (&auth.header_name, &auth.header_value) {
            (Some(name), Some(value)) => vec![(name.clone(), value.clone())],
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// WordPress `date_gmt` is a naive timestamp in UTC.
fn parse_wp_date(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

#[derive(Deserialize)]
struct WpPost {
    link: Option<String>,
    date_gmt: Option<String>,
    #[serde(default)]
    title: WpRendered,
    content: Option<WpRendered>,
    excerpt: Option<WpRendered>,
    #[serde(rename = "_embedded")]
    embedded: Option<WpEmbedded>,
}

#[derive(Default, Deserialize)]
struct WpRendered {
    #[serde(default)]
    rendered: String,
}

#[derive(Deserialize)]
struct WpEmbedded {
    #[serde(default)]
    author: Vec<WpAuthor>,
}

#[derive(Deserialize)]
struct WpAuthor {
    name: Option<String>,
}
