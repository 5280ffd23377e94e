//! Prompt moderation.
//!
//! Deterministic keyword screening run synchronously before a job is queued.
//! Prompts are normalized (lowercased, common character substitutions undone,
//! split on anything that is not alphanumeric) and compared against per-category
//! term lists. Longer terms also match near-misses so that deliberate
//! misspellings do not slip through.

use strsim::jaro_winkler;
use strum::Display;

use crate::models::mode::Mode;

/// Similarity at which a prompt token counts as a misspelled blocked term.
const FUZZY_THRESHOLD: f64 = 0.94;

/// Shorter terms only match exactly; fuzzy matching them is too noisy.
const FUZZY_MIN_LEN: usize = 5;

/// Policy violation categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ModerationCategory {
    Explicit,
    Violent,
    IdentityAbuse,
}

impl ModerationCategory {
    /// Stable, human-readable reason surfaced to clients.
    pub fn reason(self) -> &'static str {
        match self {
            ModerationCategory::Explicit => "Prompt rejected: sexually explicit content is not allowed",
            ModerationCategory::Violent => "Prompt rejected: graphic violence is not allowed",
            ModerationCategory::IdentityAbuse => {
                "Prompt rejected: impersonating or targeting real people is not allowed"
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModerationVerdict {
    Accept,
    Reject {
        category: ModerationCategory,
        reason: String,
    },
}

impl ModerationVerdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, ModerationVerdict::Accept)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ModerationVerdict::Accept => None,
            ModerationVerdict::Reject { reason, .. } => Some(reason),
        }
    }

    fn reject(category: ModerationCategory) -> Self {
        ModerationVerdict::Reject {
            category,
            reason: category.reason().to_string(),
        }
    }
}

struct Rule {
    category: ModerationCategory,
    terms: &'static [&'static str],
    phrases: &'static [&'static [&'static str]],
}

const RULES: &[Rule] = &[
    Rule {
        category: ModerationCategory::Explicit,
        terms: &["nude", "naked", "nsfw", "porn", "pornographic", "erotic", "hentai"],
        phrases: &[&["sex", "scene"], &["without", "clothes"]],
    },
    Rule {
        category: ModerationCategory::Violent,
        terms: &["gore", "gory", "decapitated", "dismembered", "mutilated", "massacre", "torture"],
        phrases: &[&["blood", "bath"], &["mass", "shooting"], &["school", "shooting"]],
    },
    Rule {
        category: ModerationCategory::IdentityAbuse,
        terms: &["deepfake", "impersonate", "impersonating", "doxx", "dox", "doxxing"],
        phrases: &[&["fake", "id"], &["home", "address", "of"], &["hate", "speech"]],
    },
];

/// Time-based media additionally screen for cloning a real person's voice
/// or likeness. A likeness word alone is fine ("the voice of the ocean"); it
/// must come with a cloning verb or a real-person signal.
const LIKENESS_TARGETS: &[&str] = &["voice", "voices", "face", "likeness"];

const IMPERSONATION_SIGNALS: &[&str] = &[
    "clone", "cloned", "cloning", "mimic", "mimicking", "imitate", "imitating", "famous",
    "celebrity", "celebrities", "real", "actor", "actress", "president", "politician", "singer",
];

const LIKENESS_PHRASES: &[&[&str]] = &[&["face", "swap"], &["faceswap"]];

/// Stateless prompt screening.
#[derive(Debug, Clone, Default)]
pub struct ModerationFilter;

impl ModerationFilter {
    pub fn new() -> Self {
        Self
    }

    /// Screen a prompt for the given mode. Never fails.
    pub fn check(&self, prompt: &str, mode: Mode) -> ModerationVerdict {
        let tokens = normalize(prompt);

        let verdict = RULES
            .iter()
            .find(|rule| {
                tokens.iter().any(|token| matches_any_term(token, rule.terms))
                    || rule.phrases.iter().any(|phrase| contains_phrase(&tokens, phrase))
            })
            .map(|rule| ModerationVerdict::reject(rule.category))
            .or_else(|| {
                (mode.requires_duration() && is_likeness_request(&tokens))
                    .then(|| ModerationVerdict::reject(ModerationCategory::IdentityAbuse))
            })
            .unwrap_or(ModerationVerdict::Accept);

        match &verdict {
            ModerationVerdict::Accept => {
                tracing::debug!(mode = %mode, tokens = tokens.len(), "Prompt accepted");
            }
            ModerationVerdict::Reject { category, .. } => {
                tracing::info!(mode = %mode, category = %category, "Prompt rejected by moderation");
            }
        }
        verdict
    }
}

fn normalize(prompt: &str) -> Vec<String> {
    let folded: String = prompt
        .chars()
        .map(|c| match c {
            '0' => 'o',
            '1' => 'i',
            '3' => 'e',
            '4' | '@' => 'a',
            '5' | '$' => 's',
            '7' => 't',
            other => other.to_ascii_lowercase(),
        })
        .collect();

    folded
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

fn matches_any_term(token: &str, terms: &[&str]) -> bool {
    terms.iter().any(|term| {
        token == *term
            || (term.len() >= FUZZY_MIN_LEN
                && token.len() >= FUZZY_MIN_LEN
                && jaro_winkler(token, term) >= FUZZY_THRESHOLD)
    })
}

fn is_likeness_request(tokens: &[String]) -> bool {
    let has = |words: &[&str]| tokens.iter().any(|token| words.contains(&token.as_str()));
    LIKENESS_PHRASES
        .iter()
        .any(|phrase| contains_phrase(tokens, phrase))
        || (has(LIKENESS_TARGETS) && has(IMPERSONATION_SIGNALS))
}

fn contains_phrase(tokens: &[String], phrase: &[&str]) -> bool {
    tokens
        .windows(phrase.len())
        .any(|window| window.iter().zip(phrase).all(|(token, word)| token == word))
}
