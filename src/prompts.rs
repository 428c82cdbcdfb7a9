//! Prompt templates for post and reply generation.

use std::fmt::Write;

use crate::models::ContentItem;

pub const SYSTEM_PROMPT: &str = "You are an active, friendly member of an online discussion community. \
You write in a natural, conversational voice, share practical experience, ask genuine questions, \
and never mention that you are an AI or language model.";

const POST_PROMPT: &str = r#"Write {count} new discussion posts for our community.

Communities you may post in: {communities}
Topics the community cares about: {topics}

Use the recent articles below as inspiration. Do not copy them; start a conversation about the ideas in them.

{items}
Each post needs a specific title, a body of at least three sentences that ends with a question to the community, a one-sentence excerpt, one community from the list above, and up to three short lowercase tags.

Respond with ONLY a JSON object in this shape:
{"posts": [{"title": "...", "content": "...", "excerpt": "...", "community": "...", "tags": ["..."]}]}"#;

const REPLY_PROMPT: &str = r#"Write {count} replies to this community discussion post.

Title: {title}

{body}

Each reply should add something new: a helpful tip, a follow-up question, or a relevant personal experience. Keep each reply between two and five sentences and vary the voice between replies.

Respond with ONLY a JSON object in this shape:
{"replies": [{"content": "...", "tone": "helpful" | "questioning" | "sharing_experience"}]}"#;

/// Source text beyond this many characters is cut from the reply prompt.
const MAX_POST_BODY_CHARS: usize = 2000;

fn join_or(values: &[String], fallback: &str) -> String {
    if values.is_empty() {
        fallback.to_string()
    } else {
        values.join(", ")
    }
}

pub fn post_prompt(items: &[ContentItem], topics: &[String], communities: &[String], count: u32) -> String {
    let mut listing = String::new();
    for (idx, item) in items.iter().enumerate() {
        let _ = writeln!(listing, "{}. {}", idx + 1, item.title);
        if !item.excerpt.is_empty() {
            let _ = writeln!(listing, "   {}", item.excerpt);
        }
        let _ = writeln!(listing, "   Source: {}", item.source_url);
    }

    POST_PROMPT
        .replace("{count}", &count.to_string())
        .replace("{communities}", &join_or(communities, "general"))
        .replace("{topics}", &join_or(topics, "anything the community would enjoy"))
        .replace("{items}", &listing)
}

pub fn reply_prompt(title: &str, body: &str, count: u32) -> String {
    let body: String = body.chars().take(MAX_POST_BODY_CHARS).collect();
    REPLY_PROMPT
        .replace("{count}", &count.to_string())
        .replace("{title}", title)
        .replace("{body}", &body)
}
