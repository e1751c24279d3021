//! Gate for user-supplied replacement patterns.
//!
//! Every pattern goes through three checks before it reaches the regex engine:
//! a length bound, a small allowlist of known-good idioms, and a static
//! structural analysis over the parsed HIR. The analysis is conservative: it
//! rejects whole shapes of pattern (a repeating quantifier nested in another,
//! repetition of overlapping alternatives, excessive quantifier counts) that
//! are super-linear in backtracking engines, so rules written for those
//! engines are refused here too. A quantifier "repeats" when it can match its
//! sub-pattern more than once, bounded or not.

use std::fmt;

use regex::Regex;
use regex_syntax::hir::{Class, Hir, HirKind, Literal};
use regex_syntax::Parser;
use thiserror::Error;
use tracing::warn;

pub const MAX_PATTERN_LENGTH: usize = 500;
pub const MAX_REPETITIONS: usize = 25;
const PREVIEW_CHAR_LIMIT: usize = 64;

/// Idioms that trip the nested-quantifier check but are common in cleanup
/// rules (blank-line collapsing, citation markers).
///
/// These are only safe on the linear-time `regex` engine; never hand this
/// list to a backtracking engine.
pub const SAFE_PATTERN_ALLOWLIST: &[&str] = &[
    r"(\s*\n){2,}",
    r"(\n\s*){2,}",
    r"(\s*\n)+",
    r"(\n\s*)+",
    r"(\[\d+\])+",
    r"(\[\w+\])+",
    r"(&nbsp;\s*)+",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hazard {
    NestedQuantifier,
    OverlappingAlternation,
    TooManyRepetitions(usize),
}

impl fmt::Display for Hazard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hazard::NestedQuantifier => f.write_str("nested unbounded quantifiers"),
            Hazard::OverlappingAlternation => {
                f.write_str("unbounded repetition over overlapping alternatives")
            }
            Hazard::TooManyRepetitions(count) => write!(
                f,
                "{count} quantifiers (limit {MAX_REPETITIONS})"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("pattern is empty")]
    Empty,
    #[error("pattern is {length} characters long (limit {MAX_PATTERN_LENGTH})")]
    TooLong { length: usize },
    #[error("pattern '{preview}' rejected: {hazard}")]
    Unsafe { preview: String, hazard: Hazard },
    #[error("pattern '{preview}' is invalid: {message}")]
    Invalid { preview: String, message: String },
}

/// Returns true when `pattern` may be handed to the regex engine.
pub fn validate(pattern: &str) -> bool {
    check(pattern).is_ok()
}

/// Validates and compiles `pattern`. Any rejection or engine error is passed
/// to `on_error` and `None` is returned, so callers can skip the single rule.
pub fn compile<F>(pattern: &str, mut on_error: F) -> Option<Regex>
where
    F: FnMut(PatternError),
{
    if let Err(err) = check(pattern) {
        on_error(err);
        return None;
    }

    match Regex::new(pattern) {
        Ok(regex) => Some(regex),
        Err(err) => {
            let err = PatternError::Invalid {
                preview: preview(pattern),
                message: err.to_string(),
            };
            warn!("{}", err);
            on_error(err);
            None
        }
    }
}

/// Whitespace-normalized, truncated rendering of an untrusted pattern.
pub fn preview(pattern: &str) -> String {
    let mut words = pattern.split_whitespace();
    let mut rendered = String::new();
    let mut truncated = false;

    if let Some(first) = words.next() {
        rendered.push_str(first);
    }
    for word in words {
        if rendered.chars().count() > PREVIEW_CHAR_LIMIT {
            truncated = true;
            break;
        }
        rendered.push(' ');
        rendered.push_str(word);
    }

    if rendered.chars().count() > PREVIEW_CHAR_LIMIT {
        rendered = rendered.chars().take(PREVIEW_CHAR_LIMIT).collect();
        truncated = true;
    }
    if truncated {
        rendered.push('…');
    }
    rendered
}

fn check(pattern: &str) -> Result<(), PatternError> {
    let result = check_inner(pattern);
    if let Err(err) = &result {
        warn!("Rejected replacement pattern: {}", err);
    }
    result
}

fn check_inner(pattern: &str) -> Result<(), PatternError> {
    if pattern.is_empty() {
        return Err(PatternError::Empty);
    }

    // Byte length bounds char length from above, so the common case stays O(1).
    if pattern.len() > MAX_PATTERN_LENGTH {
        let length = pattern.chars().count();
        if length > MAX_PATTERN_LENGTH {
            return Err(PatternError::TooLong { length });
        }
    }

    if SAFE_PATTERN_ALLOWLIST.contains(&pattern) {
        return Ok(());
    }

    let hir = Parser::new()
        .parse(pattern)
        .map_err(|err| PatternError::Invalid {
            preview: preview(pattern),
            message: err.to_string(),
        })?;

    analyze(&hir).map_err(|hazard| PatternError::Unsafe {
        preview: preview(pattern),
        hazard,
    })
}

/// Structural analysis on its own, without the allowlist.
pub fn analyze(hir: &Hir) -> Result<(), Hazard> {
    let mut repetitions = 0;
    walk(hir, 0, &mut repetitions)?;
    if repetitions > MAX_REPETITIONS {
        return Err(Hazard::TooManyRepetitions(repetitions));
    }
    Ok(())
}

fn walk(hir: &Hir, repeating_depth: usize, repetitions: &mut usize) -> Result<(), Hazard> {
    match hir.kind() {
        HirKind::Repetition(rep) => {
            *repetitions += 1;
            let repeating = rep.max != Some(1);
            if repeating {
                if repeating_depth > 0 {
                    return Err(Hazard::NestedQuantifier);
                }
                if has_overlapping_alternation(&rep.sub) {
                    return Err(Hazard::OverlappingAlternation);
                }
            }
            walk(&rep.sub, repeating_depth + usize::from(repeating), repetitions)
        }
        HirKind::Capture(capture) => walk(&capture.sub, repeating_depth, repetitions),
        HirKind::Concat(subs) | HirKind::Alternation(subs) => subs
            .iter()
            .try_for_each(|sub| walk(sub, repeating_depth, repetitions)),
        HirKind::Empty | HirKind::Literal(_) | HirKind::Class(_) | HirKind::Look(_) => Ok(()),
    }
}

fn has_overlapping_alternation(hir: &Hir) -> bool {
    match hir.kind() {
        HirKind::Alternation(branches) => {
            let firsts: Vec<FirstSet> = branches.iter().map(first_set).collect();
            for (i, a) in firsts.iter().enumerate() {
                if firsts[i + 1..].iter().any(|b| a.overlaps(b)) {
                    return true;
                }
            }
            branches.iter().any(has_overlapping_alternation)
        }
        HirKind::Repetition(rep) => has_overlapping_alternation(&rep.sub),
        HirKind::Capture(capture) => has_overlapping_alternation(&capture.sub),
        HirKind::Concat(subs) => subs.iter().any(has_overlapping_alternation),
        HirKind::Empty | HirKind::Literal(_) | HirKind::Class(_) | HirKind::Look(_) => false,
    }
}

/// Over-approximation of the characters a sub-pattern can start with.
#[derive(Debug, Default)]
struct FirstSet {
    ranges: Vec<(char, char)>,
    any: bool,
    nullable: bool,
}

impl FirstSet {
    fn nullable() -> Self {
        Self {
            nullable: true,
            ..Self::default()
        }
    }

    fn any() -> Self {
        Self {
            any: true,
            ..Self::default()
        }
    }

    fn merge(&mut self, other: FirstSet) {
        self.ranges.extend(other.ranges);
        self.any |= other.any;
    }

    fn overlaps(&self, other: &FirstSet) -> bool {
        if self.nullable || other.nullable || self.any || other.any {
            return true;
        }
        self.ranges.iter().any(|&(a_start, a_end)| {
            other
                .ranges
                .iter()
                .any(|&(b_start, b_end)| a_start <= b_end && b_start <= a_end)
        })
    }
}

fn first_set(hir: &Hir) -> FirstSet {
    match hir.kind() {
        HirKind::Empty | HirKind::Look(_) => FirstSet::nullable(),
        HirKind::Literal(Literal(bytes)) => {
            if bytes.is_empty() {
                return FirstSet::nullable();
            }
            match std::str::from_utf8(bytes).ok().and_then(|s| s.chars().next()) {
                Some(ch) => FirstSet {
                    ranges: vec![(ch, ch)],
                    ..FirstSet::default()
                },
                None => FirstSet::any(),
            }
        }
        HirKind::Class(Class::Unicode(class)) => FirstSet {
            ranges: class
                .ranges()
                .iter()
                .map(|range| (range.start(), range.end()))
                .collect(),
            ..FirstSet::default()
        },
        HirKind::Class(Class::Bytes(class)) => {
            if class.ranges().iter().any(|range| range.end() >= 0x80) {
                return FirstSet::any();
            }
            FirstSet {
                ranges: class
                    .ranges()
                    .iter()
                    .map(|range| (char::from(range.start()), char::from(range.end())))
                    .collect(),
                ..FirstSet::default()
            }
        }
        HirKind::Repetition(rep) => {
            let mut set = first_set(&rep.sub);
            set.nullable |= rep.min == 0;
            set
        }
        HirKind::Capture(capture) => first_set(&capture.sub),
        HirKind::Concat(subs) => {
            let mut acc = FirstSet::nullable();
            for sub in subs {
                let next = first_set(sub);
                let nullable = next.nullable;
                acc.merge(next);
                acc.nullable = nullable;
                if !nullable {
                    break;
                }
            }
            acc
        }
        HirKind::Alternation(branches) => {
            let mut acc = FirstSet::default();
            for branch in branches {
                let next = first_set(branch);
                acc.nullable |= next.nullable;
                acc.merge(next);
            }
            acc
        }
    }
}
