use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::{GenerationOptions, GenerationResult};

/// Content-addressed key: SHA-256 hex of the canonical JSON of `(prompt, options)`.
pub fn cache_key(prompt: &str, options: &GenerationOptions) -> String {
    #[derive(Serialize)]
    struct KeyInput<'a> {
        prompt: &'a str,
        options: &'a GenerationOptions,
    }

    // Struct field order is fixed, so the encoding is stable across calls.
    let encoded = serde_json::to_vec(&KeyInput { prompt, options }).unwrap_or_else(|_| prompt.as_bytes().to_vec());
    let digest = Sha256::digest(&encoded);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

struct CacheEntry {
    result: GenerationResult,
    expires_at: DateTime<Utc>,
}

/// TTL cache of successful provider responses.
pub struct ResponseCache {
    ttl: Duration,
    entries: HashMap<String, CacheEntry>,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Live entry for `key`; an expired entry is dropped on access.
    pub fn get(&mut self, key: &str, now: DateTime<Utc>) -> Option<GenerationResult> {
        match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.result.clone()),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&mut self, key: String, result: GenerationResult, now: DateTime<Utc>) {
        self.entries.insert(
            key,
            CacheEntry {
                result,
                expires_at: now + self.ttl,
            },
        );
    }

    /// Returns the number of entries removed.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
