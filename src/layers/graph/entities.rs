//! Cheap entity-candidate extraction from recent conversation text.
//!
//! No model calls: known names first, then issue-style references, then
//! capitalized phrases ranked by how often they appear.

use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CandidateKind {
    /// From the configured known-entities list.
    Known,
    /// Issue or ticket reference such as `#123` or `OPS-42`.
    Reference,
    /// Capitalized word or phrase.
    Proper,
}

impl CandidateKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Known => "Entity",
            Self::Reference => "Reference",
            Self::Proper => "Entity",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub name: String,
    pub kind: CandidateKind,
}

pub trait EntityExtractor: Send + Sync {
    /// Up to `max` distinct candidates from `texts` (newest first), best first.
    fn candidates(&self, texts: &[String], max: usize) -> Vec<Candidate>;
}

static REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:#\d+\b)|\b[A-Z][A-Z0-9]+-\d+\b").expect("static regex"));

static PROPER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Z][A-Za-z0-9]+(?:[ \t]+[A-Z][A-Za-z0-9]+)*\b").expect("static regex")
});

/// Capitalized words that are almost never entities.
const STOP_WORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "an", "and", "any", "are", "as", "at", "be", "because",
    "but", "by", "can", "could", "did", "do", "does", "done", "for", "from", "good", "great", "has",
    "have", "he", "hello", "her", "here", "hey", "hi", "his", "how", "i", "if", "in", "is", "it",
    "its", "just", "let", "maybe", "me", "my", "no", "not", "now", "ok", "okay", "on", "or", "our",
    "please", "she", "should", "so", "sure", "thanks", "thank", "that", "the", "their", "then",
    "there", "these", "they", "this", "those", "to", "today", "tomorrow", "we", "well", "what",
    "when", "where", "which", "who", "why", "will", "with", "would", "yes", "yesterday", "you",
    "your", "monday", "tuesday", "wednesday", "thursday", "friday", "saturday", "sunday",
];

pub struct HeuristicEntityExtractor {
    known: Vec<(String, Regex)>,
    stop_words: HashSet<&'static str>,
}

impl HeuristicEntityExtractor {
    pub fn new(known_entities: &[String]) -> Self {
        let known = known_entities
            .iter()
            .filter(|name| !name.trim().is_empty())
            .filter_map(|name| {
                let pattern = format!(r"(?i)\b{}\b", regex::escape(name.trim()));
                Regex::new(&pattern).ok().map(|re| (name.trim().to_string(), re))
            })
            .collect();
        Self {
            known,
            stop_words: STOP_WORDS.iter().copied().collect(),
        }
    }

    /// Strip leading stop words from a capitalized phrase ("The Strata Repo" →
    /// "Strata Repo"). Returns `None` if nothing is left.
    fn clean_phrase(&self, phrase: &str) -> Option<String> {
        let words: Vec<&str> = phrase
            .split_whitespace()
            .skip_while(|w| self.stop_words.contains(w.to_lowercase().as_str()))
            .collect();
        if words.is_empty() {
            return None;
        }
        let joined = words.join(" ");
        if joined.chars().count() < 2 {
            return None;
        }
        Some(joined)
    }
}

impl EntityExtractor for HeuristicEntityExtractor {
    fn candidates(&self, texts: &[String], max: usize) -> Vec<Candidate> {
        let mut out: Vec<Candidate> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut push = |out: &mut Vec<Candidate>, name: String, kind: CandidateKind| {
            if seen.insert(name.to_lowercase()) {
                out.push(Candidate { name, kind });
            }
        };

        for (name, re) in &self.known {
            if texts.iter().any(|t| re.is_match(t)) {
                push(&mut out, name.clone(), CandidateKind::Known);
            }
        }

        for text in texts {
            for m in REFERENCE.find_iter(text) {
                push(&mut out, m.as_str().to_string(), CandidateKind::Reference);
            }
        }

        // Frequency first, then first appearance (texts are newest first).
        let mut counts: HashMap<String, (usize, usize, String)> = HashMap::new();
        let mut order = 0usize;
        for text in texts {
            let text = REFERENCE.replace_all(text, " ");
            for m in PROPER.find_iter(&text) {
                let Some(phrase) = self.clean_phrase(m.as_str()) else {
                    continue;
                };
                let entry = counts
                    .entry(phrase.to_lowercase())
                    .or_insert_with(|| (0, order, phrase.clone()));
                entry.0 += 1;
                order += 1;
            }
        }
        let mut proper: Vec<(usize, usize, String)> = counts.into_values().collect();
        proper.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        for (_, _, name) in proper {
            push(&mut out, name, CandidateKind::Proper);
        }

        out.truncate(max);
        out
    }
}
