//! Pass/fail gate applied to raw model output before it is handed back to callers.

use std::collections::HashMap;

use thiserror::Error;

use crate::quality::{find_disclaimer, sentence_count, words};

/// Share of all tokens a single long word may take before the text counts as repetitive.
const MAX_WORD_SHARE: f64 = 0.2;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("content too short ({length} < {min} characters)")]
    TooShort { length: usize, min: usize },
    #[error("content has fewer than two sentences")]
    TooFewSentences,
    #[error("content is repetitive ('{word}' is {percent}% of words)")]
    Repetitive { word: String, percent: u32 },
    #[error("content contains disclaimer phrase '{phrase}'")]
    Disclaimer { phrase: &'static str },
}

pub fn validate_content(text: &str, min_length: usize) -> Result<(), Rejection> {
    let text = text.trim();

    let length = text.chars().count();
    if length < min_length {
        return Err(Rejection::TooShort {
            length,
            min: min_length,
        });
    }

    if sentence_count(text) < 2 {
        return Err(Rejection::TooFewSentences);
    }

    let tokens = words(text);
    if !tokens.is_empty() {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for word in tokens.iter().filter(|w| w.chars().count() > 3) {
            *counts.entry(word.as_str()).or_default() += 1;
        }
        if let Some((word, count)) = counts.into_iter().max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(a.0))) {
            let share = count as f64 / tokens.len() as f64;
            if share > MAX_WORD_SHARE {
                return Err(Rejection::Repetitive {
                    word: word.to_string(),
                    percent: (share * 100.0).round() as u32,
                });
            }
        }
    }

    if let Some(phrase) = find_disclaimer(text) {
        return Err(Rejection::Disclaimer { phrase });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = "Backups only count once you have restored from them. \
        I test mine every quarter on a spare machine and it has caught two broken archives so far.";

    #[test]
    fn accepts_three_sentences_over_a_hundred_chars() {
        let text = "Our meetup moved to Thursdays this month. \
            The new venue has better coffee and parking. \
            Who is planning to come along next week?";
        assert!(text.chars().count() >= 100);
        assert_eq!(validate_content(text, 50), Ok(()));
    }

    #[test]
    fn accepts_reasonable_content() {
        assert_eq!(validate_content(GOOD, 50), Ok(()));
    }

    #[test]
    fn rejects_short_content() {
        assert_eq!(
            validate_content("Too short. Really.", 50),
            Err(Rejection::TooShort { length: 18, min: 50 })
        );
    }

    #[test]
    fn rejects_single_sentence() {
        let text = "This is one long sentence without any terminal punctuation that goes on for a while";
        assert_eq!(validate_content(text, 50), Err(Rejection::TooFewSentences));
    }

    #[test]
    fn rejects_repeated_long_word() {
        let text = "Docker docker docker is great. Docker docker everywhere and docker for all of us.";
        let err = validate_content(text, 50).unwrap_err();
        assert!(matches!(err, Rejection::Repetitive { ref word, .. } if word == "docker"));
    }

    #[test]
    fn short_words_do_not_trigger_repetition() {
        let text = "It is what it is and it is fine. It is not bad at all, it is ok by me and you.";
        assert_eq!(validate_content(text, 50), Ok(()));
    }

    #[test]
    fn rejects_disclaimers() {
        let text = "As an AI language model I have no opinions. Still, the topic is interesting to read about.";
        assert_eq!(
            validate_content(text, 50),
            Err(Rejection::Disclaimer { phrase: "as an ai" })
        );
    }
}
