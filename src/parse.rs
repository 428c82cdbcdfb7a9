//! Tolerant extraction of posts and replies from model output.
//!
//! Never fails: when no usable JSON is found the text is split heuristically.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::models::{GeneratedPost, GeneratedReply, ReplyTone};
use crate::text::excerpt;

pub const MAX_POSTS: usize = 10;
pub const MAX_REPLIES: usize = 5;

const DEFAULT_COMMUNITY: &str = "general";
const FALLBACK_TAG: &str = "ai-generated";
const MIN_FALLBACK_REPLY_CHARS: usize = 20;
const EXCERPT_CHARS: usize = 200;
/// Opening brackets tried before giving up on JSON.
const MAX_JSON_CANDIDATES: usize = 16;

static LIST_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:\d+[.)]|[-*•])\s+").expect("valid list marker regex"));

#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome<T> {
    /// Decoded from a JSON structure in the response.
    Parsed(Vec<T>),
    /// Recovered by splitting free-form text.
    FallbackParsed(Vec<T>),
}

impl<T> ParseOutcome<T> {
    pub fn into_records(self) -> Vec<T> {
        match self {
            ParseOutcome::Parsed(records) | ParseOutcome::FallbackParsed(records) => records,
        }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, ParseOutcome::Parsed(_))
    }
}

/// Locate the first balanced `{...}` or `[...]` in `text` that decodes as JSON.
///
/// The scan skips brackets inside string literals and honors escapes.
pub fn extract_json(text: &str) -> Option<Value> {
    text.char_indices()
        .filter(|(_, c)| matches!(c, '{' | '['))
        .take(MAX_JSON_CANDIDATES)
        .find_map(|(start, _)| {
            let end = balanced_end(&text[start..])?;
            serde_json::from_str(&text[start..start + end]).ok()
        })
}

/// Byte length of the balanced structure opening at the start of `text`.
fn balanced_end(text: &str) -> Option<usize> {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (idx, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(c) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(idx + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Deserialize)]
struct RawPost {
    title: Option<String>,
    #[serde(alias = "body")]
    content: Option<String>,
    excerpt: Option<String>,
    community: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Deserialize)]
struct RawReply {
    #[serde(alias = "body")]
    content: Option<String>,
    tone: Option<String>,
}

/// Records under `key` in an object, or the value itself if it is an array of objects.
fn record_array(value: Value, key: &str) -> Option<Vec<Value>> {
    match value {
        // Bare arrays of scalars are citations like `[1]`, not records
        Value::Array(items) if items.iter().all(Value::is_object) => Some(items),
        Value::Object(mut map) => match map.remove(key) {
            Some(Value::Array(items)) => Some(items),
            _ => None,
        },
        _ => None,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn post_from_value(value: Value) -> Option<GeneratedPost> {
    let raw: RawPost = serde_json::from_value(value).ok()?;
    let title = non_empty(raw.title)?;
    let body = non_empty(raw.content)?;
    Some(GeneratedPost {
        excerpt: non_empty(raw.excerpt).unwrap_or_else(|| excerpt(&body, EXCERPT_CHARS)),
        community: non_empty(raw.community).unwrap_or_else(|| DEFAULT_COMMUNITY.to_string()),
        tags: raw
            .tags
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect(),
        title,
        body,
    })
}

fn reply_from_value(value: Value) -> Option<GeneratedReply> {
    let raw: RawReply = serde_json::from_value(value).ok()?;
    Some(GeneratedReply {
        body: non_empty(raw.content)?,
        tone: raw
            .tone
            .as_deref()
            .and_then(ReplyTone::from_label)
            .unwrap_or(ReplyTone::Helpful),
    })
}

pub fn parse_posts(text: &str) -> ParseOutcome<GeneratedPost> {
    if let Some(items) = extract_json(text).and_then(|v| record_array(v, "posts")) {
        // A well-formed array is authoritative even when every record is dropped
        let posts = items.into_iter().filter_map(post_from_value).take(MAX_POSTS).collect();
        return ParseOutcome::Parsed(posts);
    }

    let posts = split_sections(text)
        .into_iter()
        .filter_map(|section| {
            let mut lines = section.lines().map(str::trim).filter(|l| !l.is_empty());
            let title = clean_title(lines.next()?);
            let body = lines.collect::<Vec<_>>().join("\n");
            if title.is_empty() || body.is_empty() {
                return None;
            }
            Some(GeneratedPost {
                excerpt: excerpt(&body, EXCERPT_CHARS),
                community: DEFAULT_COMMUNITY.to_string(),
                tags: vec![FALLBACK_TAG.to_string()],
                title,
                body,
            })
        })
        .take(MAX_POSTS)
        .collect();
    ParseOutcome::FallbackParsed(posts)
}

pub fn parse_replies(text: &str) -> ParseOutcome<GeneratedReply> {
    if let Some(items) = extract_json(text).and_then(|v| record_array(v, "replies")) {
        let replies = items
            .into_iter()
            .filter_map(reply_from_value)
            .take(MAX_REPLIES)
            .collect();
        return ParseOutcome::Parsed(replies);
    }

    let replies = text
        .lines()
        .map(|line| {
            strip_marker(line)
                .trim()
                .trim_matches(|c| matches!(c, '"' | '\u{201c}' | '\u{201d}'))
                .trim()
                .to_string()
        })
        .filter(|line| line.chars().count() >= MIN_FALLBACK_REPLY_CHARS)
        .map(|body| GeneratedReply {
            body,
            tone: ReplyTone::Helpful,
        })
        .take(MAX_REPLIES)
        .collect();
    ParseOutcome::FallbackParsed(replies)
}

/// Sections start at list markers when any line has one, otherwise at blank lines.
fn split_sections(text: &str) -> Vec<String> {
    let has_markers = text.lines().any(|line| LIST_MARKER.is_match(line));
    let mut sections: Vec<String> = Vec::new();
    let mut current = String::new();

    for line in text.lines() {
        let starts_section = if has_markers {
            LIST_MARKER.is_match(line)
        } else {
            line.trim().is_empty()
        };
        if starts_section && !current.trim().is_empty() {
            sections.push(std::mem::take(&mut current));
        }
        if has_markers || !line.trim().is_empty() {
            current.push_str(line);
            current.push('\n');
        }
    }
    if !current.trim().is_empty() {
        sections.push(current);
    }
    sections
}

fn strip_marker(line: &str) -> &str {
    match LIST_MARKER.find(line) {
        Some(m) => &line[m.end()..],
        None => line,
    }
}

fn clean_title(line: &str) -> String {
    let line = strip_marker(line).trim().trim_start_matches('#').trim();
    let line = line.trim_matches('*').trim();
    let line = match line.get(..6) {
        Some(prefix) if prefix.eq_ignore_ascii_case("title:") => &line[6..],
        _ => line,
    };
    line.trim().trim_matches('*').trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_first_balanced_object() {
        let text = "Sure! Here it is:\n{\"posts\": [{\"title\": \"A {tricky} \\\"one\\\"\"}]}\nThanks";
        let value = extract_json(text).unwrap();
        assert_eq!(value["posts"][0]["title"], "A {tricky} \"one\"");
    }

    #[test]
    fn skips_unbalanced_candidates() {
        let text = "Note [see below) then {\"ok\": true}";
        assert_eq!(extract_json(text).unwrap()["ok"], true);
        assert!(extract_json("no json here").is_none());
        assert!(extract_json("{\"open\": ").is_none());
    }

    #[test]
    fn parses_posts_object_and_fills_defaults() {
        let text = r#"```json
{"posts": [
  {"title": "Home lab power usage", "content": "How much does your rack draw at idle? Mine sits around 90W.", "tags": ["homelab"]},
  {"title": "", "content": "dropped: empty title"},
  {"title": "Missing body"}
]}
```"#;
        let outcome = parse_posts(text);
        assert!(outcome.is_structured());
        let posts = outcome.into_records();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].community, "general");
        assert_eq!(posts[0].tags, vec!["homelab"]);
        assert_eq!(posts[0].excerpt, posts[0].body);
    }

    #[test]
    fn parses_compact_posts_object() {
        let text = r#"{"posts":[{"title":"T","content":"C is long enough to pass","community":"general","tags":["a","b"]}]}"#;
        let outcome = parse_posts(text);
        assert!(outcome.is_structured());
        let posts = outcome.into_records();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].title, "T");
        assert_eq!(posts[0].body, "C is long enough to pass");
        assert_eq!(posts[0].community, "general");
        assert_eq!(posts[0].tags, vec!["a", "b"]);
    }

    #[test]
    fn parses_bare_reply_array_with_unknown_tone() {
        let text = r#"[{"content": "Have you tried a smaller model?", "tone": "questioning"},
                       {"content": "I ran into the same issue last year.", "tone": "nostalgic"}]"#;
        let replies = parse_replies(text).into_records();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].tone, ReplyTone::Questioning);
        assert_eq!(replies[1].tone, ReplyTone::Helpful);
    }

    #[test]
    fn numbered_list_falls_back_to_sections() {
        let outcome = parse_posts("1. Intro\nSome body text here.\n\n2. Next\nMore body.");
        assert!(!outcome.is_structured());
        let posts = outcome.into_records();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].title, "Intro");
        assert_eq!(posts[0].body, "Some body text here.");
        assert_eq!(posts[1].title, "Next");
        assert_eq!(posts[1].tags, vec!["ai-generated"]);
    }

    #[test]
    fn blank_lines_split_when_no_markers() {
        let text = "## Title: Backups\nTest your restores.\n\n**Cheap NAS**\nWhich one would you buy?\n\nlonely title";
        let posts = parse_posts(text).into_records();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].title, "Backups");
        assert_eq!(posts[1].title, "Cheap NAS");
    }

    #[test]
    fn reply_fallback_keeps_substantial_lines() {
        let text = "Replies:\n- \"Great write-up, I learned a lot from this.\"\n- ok\n* Could you share your config file?";
        let outcome = parse_replies(text);
        assert!(!outcome.is_structured());
        let replies = outcome.into_records();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].body, "Great write-up, I learned a lot from this.");
        assert!(replies.iter().all(|r| r.tone == ReplyTone::Helpful));
    }

    #[test]
    fn results_are_capped() {
        let text = (1..=8)
            .map(|i| format!("- This is fallback reply number {i} with enough text"))
            .collect::<Vec<_>>()
            .join("\n");
        assert_eq!(parse_replies(&text).into_records().len(), MAX_REPLIES);

        let posts: Vec<_> = (0..15)
            .map(|i| serde_json::json!({"title": format!("Post {i}"), "content": "Body"}))
            .collect();
        let text = serde_json::json!({ "posts": posts }).to_string();
        assert_eq!(parse_posts(&text).into_records().len(), MAX_POSTS);
    }

    #[test]
    fn structured_posts_with_unknown_fields_parse_to_nothing() {
        let text = r#"{"posts":[{"headline":"Backups","text":"Test your restores often, it matters."}]}"#;
        let outcome = parse_posts(text);
        assert_eq!(outcome, ParseOutcome::Parsed(Vec::new()));
    }

    #[test]
    fn structured_replies_without_content_parse_to_nothing() {
        let text = r#"{"replies":[{"text":"Great write-up, I learned a lot from this."}]}"#;
        let outcome = parse_replies(text);
        assert!(outcome.is_structured());
        assert!(outcome.into_records().is_empty());
    }

    #[test]
    fn scalar_array_in_prose_does_not_count_as_structured() {
        let text = "- As noted in [1], the restore step is the slow part.\n- Could you share your config file?";
        let outcome = parse_replies(text);
        assert!(!outcome.is_structured());
        assert_eq!(outcome.into_records().len(), 2);
    }

    #[test]
    fn garbage_yields_empty_fallback() {
        assert_eq!(parse_posts(""), ParseOutcome::FallbackParsed(Vec::new()));
        assert_eq!(parse_replies("ok"), ParseOutcome::FallbackParsed(Vec::new()));
    }
}
