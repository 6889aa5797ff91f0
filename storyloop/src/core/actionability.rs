//! Lexical check that story text is specific enough to verify.
//!
//! A sentence fails when it uses a vague verb or adjective from the [`Lexicon`]
//! and carries no quantifier: a digit, a percent sign, a comparison symbol, or
//! one of the lexicon's comparison phrases. This is a word-list heuristic, not a
//! judgement about meaning; the lexicon is configurable for that reason.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::plan::Plan;

static SENTENCE_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?;]+(?:\s+|$)|\n+").expect("sentence regex is valid"));

/// Inflections accepted after a lexicon word ("improves", "properly", ...).
const SUFFIXES: &str = "(?:s|es|d|ed|ing|ly|ment|ments|ation|ations)?";

/// Abbreviations whose trailing period does not end a sentence.
const ABBREVIATIONS: &[&str] = &["e.g", "i.e", "eg", "ie", "etc", "vs", "cf", "approx", "incl"];

/// Word lists driving the check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Lexicon {
    pub vague_verbs: Vec<String>,
    pub vague_adjectives: Vec<String>,
    /// Phrases that make a sentence measurable even without digits.
    pub comparison_phrases: Vec<String>,
}

impl Default for Lexicon {
    fn default() -> Self {
        let words = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            vague_verbs: words(&["optimize", "improve", "simplify", "reduce", "enhance"]),
            vague_adjectives: words(&[
                "proper",
                "comprehensive",
                "robust",
                "appropriate",
                "consistent",
                "clean",
            ]),
            comparison_phrases: words(&[
                "at least",
                "at most",
                "less than",
                "more than",
                "fewer than",
                "greater than",
                "no more than",
                "within",
                "under",
                "below",
                "above",
            ]),
        }
    }
}

/// One vague sentence found in a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionabilityIssue {
    pub story_id: String,
    /// `description` or `acceptance_criteria[N]`.
    pub field: String,
    /// The vague word as written.
    pub term: String,
    pub sentence: String,
}

impl fmt::Display for ActionabilityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: '{}' is not quantified in \"{}\"",
            self.story_id, self.field, self.term, self.sentence
        )
    }
}

/// Compiled form of a [`Lexicon`].
#[derive(Debug, Clone)]
pub struct ActionabilityChecker {
    vague: Option<Regex>,
    quantifier: Regex,
}

impl ActionabilityChecker {
    pub fn new(lexicon: &Lexicon) -> Result<Self, regex::Error> {
        let terms: Vec<String> = lexicon
            .vague_verbs
            .iter()
            .chain(&lexicon.vague_adjectives)
            .map(|word| word.trim())
            .filter(|word| !word.is_empty())
            .map(word_forms)
            .collect();
        let vague = if terms.is_empty() {
            None
        } else {
            Some(Regex::new(&format!(
                r"(?i)\b(?:{}){SUFFIXES}\b",
                terms.join("|")
            ))?)
        };

        let mut quantifier = String::from(r"(?i)\d|%|[<>≤≥]");
        let phrases: Vec<String> = lexicon
            .comparison_phrases
            .iter()
            .map(|phrase| phrase.trim())
            .filter(|phrase| !phrase.is_empty())
            .map(|phrase| regex::escape(phrase).replace(' ', r"\s+"))
            .collect();
        if !phrases.is_empty() {
            quantifier.push_str(&format!(r"|\b(?:{})\b", phrases.join("|")));
        }

        Ok(Self {
            vague,
            quantifier: Regex::new(&quantifier)?,
        })
    }

    /// First unquantified vague term in `text`, with the sentence it sits in.
    pub fn find_vague(&self, text: &str) -> Option<(String, String)> {
        let vague = self.vague.as_ref()?;
        sentences(text)
            .into_iter()
            .map(str::trim)
            .filter(|sentence| !sentence.is_empty())
            .find_map(|sentence| {
                let hit = vague.find(sentence)?;
                if self.quantifier.is_match(sentence) {
                    return None;
                }
                Some((hit.as_str().to_string(), sentence.to_string()))
            })
    }

    /// Check every story description and acceptance criterion in `plan`.
    pub fn check_plan(&self, plan: &Plan) -> Vec<ActionabilityIssue> {
        let mut issues = Vec::new();
        for story in &plan.stories {
            let fields = std::iter::once(("description".to_string(), &story.description)).chain(
                story
                    .acceptance_criteria
                    .iter()
                    .enumerate()
                    .map(|(idx, item)| (format!("acceptance_criteria[{idx}]"), item)),
            );
            for (field, text) in fields {
                if let Some((term, sentence)) = self.find_vague(text) {
                    issues.push(ActionabilityIssue {
                        story_id: story.id.clone(),
                        field,
                        term,
                        sentence,
                    });
                }
            }
        }
        issues
    }
}

/// Alternation matching `word` and its common inflections.
///
/// A final `y` or `e` is dropped before endings that replace it, so
/// "simplify" also matches "simplified" and "optimize" matches "optimization".
fn word_forms(word: &str) -> String {
    let full = regex::escape(word);
    let stem = || regex::escape(&word[..word.len() - 1]);
    match word.as_bytes().last().map(u8::to_ascii_lowercase) {
        Some(b'y') if word.len() > 1 => {
            format!("(?:{full}{SUFFIXES}|{}(?:ies|ied|ication|ications))", stem())
        }
        Some(b'e') if word.len() > 1 => {
            format!("(?:{full}{SUFFIXES}|{}(?:ing|ation|ations))", stem())
        }
        _ => format!("(?:{full}{SUFFIXES})"),
    }
}

/// Split `text` at sentence breaks, except periods that close an abbreviation.
fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    for brk in SENTENCE_BREAK.find_iter(text) {
        let before = &text[start..brk.start()];
        if brk.as_str().starts_with('.') && ends_with_abbreviation(before) {
            continue;
        }
        out.push(before);
        start = brk.end();
    }
    out.push(&text[start..]);
    out
}

fn ends_with_abbreviation(text: &str) -> bool {
    let Some(last) = text.split_whitespace().next_back() else {
        return false;
    };
    let last = last.trim_start_matches(|c: char| !c.is_alphanumeric());
    ABBREVIATIONS
        .iter()
        .any(|abbr| last.eq_ignore_ascii_case(abbr))
}
