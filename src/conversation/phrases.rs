//! Transcript post-processing
//!
//! Pronunciation-rewrite rules (ordered regex replacements, with a
//! compact one-line-per-rule text format) and detection of the small
//! closed set of spoken control phrases ("wait" and "repeat" families).
//!
//! Control-phrase matching is case-insensitive, whole-word, and only
//! triggers at the end of a sentence.

use anyhow::{Context, Result};
use regex::Regex;

/// Phrases that ask the assistant to hold on and re-open the listening window
pub const WAIT_PHRASES: [&str; 4] = ["wait", "please wait", "hold on", "one moment"];

/// Phrases that ask the assistant to replay the last utterance
pub const REPEAT_PHRASES: [&str; 4] = ["repeat", "say again", "repeat that", "say that again"];

/// Which direction a pronunciation rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleDirection {
    /// Rewrites text before synthesis
    Tts,
    /// Rewrites transcripts after recognition
    Stt,
}

impl std::fmt::Display for RuleDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleDirection::Tts => write!(f, "TTS"),
            RuleDirection::Stt => write!(f, "STT"),
        }
    }
}

/// One ordered rewrite rule
#[derive(Debug, Clone)]
pub struct PronunciationRule {
    pub direction: RuleDirection,
    pub pattern: String,
    pub replacement: String,
    pub description: Option<String>,
}

impl PartialEq for PronunciationRule {
    fn eq(&self, other: &Self) -> bool {
        self.direction == other.direction
            && self.pattern == other.pattern
            && self.replacement == other.replacement
            && self.description == other.description
    }
}

/// Apply the rules for one direction, in order
pub fn apply_rules(text: &str, direction: RuleDirection, rules: &[PronunciationRule]) -> String {
    let mut out = text.to_string();
    for rule in rules.iter().filter(|r| r.direction == direction) {
        match Regex::new(&rule.pattern) {
            Ok(re) => {
                out = re.replace_all(&out, rule.replacement.as_str()).into_owned();
            }
            Err(e) => {
                tracing::warn!("Skipping bad pronunciation pattern {:?}: {}", rule.pattern, e);
            }
        }
    }
    out
}

/// Parse the compact rule format: one rule per line,
/// `TTS|STT <pattern> <replacement> [# description]`. Lines starting with
/// `#` are disabled. Patterns and replacements containing spaces are
/// double-quoted.
pub fn parse_compact_rules(text: &str) -> Result<Vec<PronunciationRule>> {
    let mut rules = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (direction, rest) = match line.split_once(char::is_whitespace) {
            Some((dir, rest)) => (dir, rest.trim_start()),
            None => continue,
        };
        let direction = match direction.to_uppercase().as_str() {
            "TTS" => RuleDirection::Tts,
            "STT" => RuleDirection::Stt,
            other => {
                anyhow::bail!("rule must start with TTS or STT, got {:?}", other);
            }
        };

        let (pattern, rest) = take_token(rest).context("rule missing pattern")?;
        let (replacement, rest) = take_token(rest).context("rule missing replacement")?;

        let description = rest
            .trim()
            .strip_prefix('#')
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());

        rules.push(PronunciationRule {
            direction,
            pattern,
            replacement,
            description,
        });
    }

    Ok(rules)
}

/// Serialize rules back into the compact format
pub fn serialize_compact_rules(rules: &[PronunciationRule]) -> String {
    let mut out = String::new();
    for rule in rules {
        out.push_str(&format!(
            "{} {} {}",
            rule.direction,
            quote_token(&rule.pattern),
            quote_token(&rule.replacement),
        ));
        if let Some(desc) = &rule.description {
            out.push_str(&format!(" # {}", desc));
        }
        out.push('\n');
    }
    out
}

/// Pull one token off the front: either a double-quoted string or a run
/// of non-whitespace
fn take_token(input: &str) -> Option<(String, &str)> {
    let input = input.trim_start();
    if input.is_empty() || input.starts_with('#') {
        return None;
    }
    if let Some(rest) = input.strip_prefix('"') {
        let end = rest.find('"')?;
        return Some((rest[..end].to_string(), &rest[end + 1..]));
    }
    let end = input
        .find(char::is_whitespace)
        .unwrap_or(input.len());
    Some((input[..end].to_string(), &input[end..]))
}

fn quote_token(token: &str) -> String {
    if token.contains(char::is_whitespace) {
        format!("\"{}\"", token)
    } else {
        token.to_string()
    }
}

/// True when the transcript ends with a wait-family phrase
pub fn should_wait(transcript: &str) -> bool {
    ends_with_phrase(transcript, &WAIT_PHRASES)
}

/// True when the transcript ends with a repeat-family phrase
pub fn should_repeat(transcript: &str) -> bool {
    ends_with_phrase(transcript, &REPEAT_PHRASES)
}

/// Whole-word, case-insensitive match of any phrase at the end of a
/// sentence. Trailing punctuation is ignored.
fn ends_with_phrase(transcript: &str, phrases: &[&str]) -> bool {
    let trimmed = transcript
        .trim()
        .trim_end_matches(['.', '!', '?', ','])
        .trim_end();
    if trimmed.is_empty() {
        return false;
    }
    let lower = trimmed.to_lowercase();

    for phrase in phrases {
        if lower == *phrase {
            return true;
        }
        if let Some(prefix) = lower.strip_suffix(phrase) {
            // Word boundary before the phrase
            if prefix
                .chars()
                .last()
                .map(|c| !c.is_alphanumeric())
                .unwrap_or(false)
            {
                return true;
            }
        }
    }
    false
}
