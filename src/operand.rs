use std::cmp::Ordering;

use lazy_static::lazy_static;
use log::{error, warn};
use regex::Regex;

use crate::util::format_number;

lazy_static! {
    static ref LOWER_REGEX: Regex = Regex::new(r"^lower\((.*)\)").unwrap();
    static ref WILDCARD_REGEX: Regex = Regex::new(r"^wildcard\((.*)\)").unwrap();
    static ref REGEX_REGEX: Regex = Regex::new(r"^regex\((.*)\)").unwrap();
    static ref GREATER_THAN_REGEX: Regex = Regex::new(r"^gt\((.*)\)").unwrap();
    static ref GREATER_THAN_OR_EQUAL_REGEX: Regex = Regex::new(r"^gte\((.*)\)").unwrap();
    static ref LESS_THAN_REGEX: Regex = Regex::new(r"^lt\((.*)\)").unwrap();
    static ref LESS_THAN_OR_EQUAL_REGEX: Regex = Regex::new(r"^lte\((.*)\)").unwrap();
    static ref IN_LIST_REGEX: Regex = Regex::new(r"^inlist\(([^)]+)\)$").unwrap();
    static ref VERSION_REGEX: Regex = Regex::new(r"^\d+(\.\d+)+$").unwrap();
}

/// A segment operand, classified from its textual form.
///
/// A leading wildcard star means the value must *end with* the rest (`wildcard(*v)`); a trailing
/// star means it must *start with* it (`wildcard(v*)`).
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    Equals(String),
    Lower(String),
    Contains(String),
    EndsWith(String),
    StartsWith(String),
    Regex(Pattern),
    GreaterThan(String),
    GreaterThanOrEqual(String),
    LessThan(String),
    LessThanOrEqual(String),
    /// Membership in a remotely managed attribute list.
    InList(String),
    /// An `inlist` operand whose list id could not be read, or a `regex` operand that does not
    /// compile. Never matches.
    Malformed(String),
}

impl Operand {
    pub fn parse(operand: &str) -> Operand {
        if operand.starts_with("inlist") {
            return match IN_LIST_REGEX.captures(operand) {
                Some(caps) => Operand::InList(caps[1].to_string()),
                None => {
                    error!("Invalid 'inlist' operand format: {}", operand);
                    Operand::Malformed(operand.to_string())
                }
            };
        }

        let capture = |re: &Regex| re.captures(operand).map(|caps| caps[1].to_string());

        if let Some(v) = capture(&LOWER_REGEX) {
            Operand::Lower(v)
        } else if let Some(v) = capture(&WILDCARD_REGEX) {
            let starts_with_star = v.starts_with('*');
            let rest = v.strip_prefix('*').unwrap_or(&v);
            let ends_with_star = rest.ends_with('*');
            let trimmed = rest.strip_suffix('*').unwrap_or(rest).to_string();
            match (starts_with_star, ends_with_star) {
                (true, true) => Operand::Contains(trimmed),
                (true, false) => Operand::EndsWith(trimmed),
                (false, true) => Operand::StartsWith(trimmed),
                (false, false) => Operand::Equals(trimmed),
            }
        } else if let Some(v) = capture(&REGEX_REGEX) {
            match Regex::new(&v) {
                Ok(re) => Operand::Regex(Pattern(re)),
                Err(e) => {
                    warn!("Invalid regex for 'regex' operand ({}): {}", e, v);
                    Operand::Malformed(operand.to_string())
                }
            }
        } else if let Some(v) = capture(&GREATER_THAN_REGEX) {
            Operand::GreaterThan(v)
        } else if let Some(v) = capture(&GREATER_THAN_OR_EQUAL_REGEX) {
            Operand::GreaterThanOrEqual(v)
        } else if let Some(v) = capture(&LESS_THAN_REGEX) {
            Operand::LessThan(v)
        } else if let Some(v) = capture(&LESS_THAN_OR_EQUAL_REGEX) {
            Operand::LessThanOrEqual(v)
        } else {
            Operand::Equals(operand.to_string())
        }
    }

    /// Evaluate this operand against an attribute value already rendered as a string.
    ///
    /// List membership needs the evaluation context and is special-cased by the segment
    /// evaluator; calling this on [Operand::InList] yields false.
    pub fn matches(&self, actual: &str) -> bool {
        match self {
            Operand::Equals(expected) => normalized(expected, actual, |e, a| e == a),
            Operand::Lower(expected) => normalized(expected, actual, |e, a| {
                e.to_lowercase() == a.to_lowercase()
            }),
            Operand::Contains(expected) => normalized(expected, actual, |e, a| a.contains(e)),
            Operand::EndsWith(expected) => normalized(expected, actual, |e, a| a.ends_with(e)),
            Operand::StartsWith(expected) => {
                normalized(expected, actual, |e, a| a.starts_with(e))
            }
            Operand::Regex(pattern) => pattern.0.is_match(actual),
            Operand::GreaterThan(expected) => ordering_op(actual, expected, |o| o.is_gt()),
            Operand::GreaterThanOrEqual(expected) => ordering_op(actual, expected, |o| o.is_ge()),
            Operand::LessThan(expected) => ordering_op(actual, expected, |o| o.is_lt()),
            Operand::LessThanOrEqual(expected) => ordering_op(actual, expected, |o| o.is_le()),
            Operand::InList(_) => {
                error!("inlist operand should be special-cased, shouldn't get here");
                false
            }
            Operand::Malformed(_) => false,
        }
    }
}

/// A `regex(...)` operand, compiled once when the operand is parsed.
#[derive(Clone, Debug)]
pub struct Pattern(Regex);

impl Pattern {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

/// Applies `f` after rendering numeric operands canonically, so `5.0` and `5` compare equal.
/// Version strings are left as they are.
fn normalized<F: Fn(&str, &str) -> bool>(expected: &str, actual: &str, f: F) -> bool {
    if is_version(expected) && is_version(actual) {
        return f(expected, actual);
    }
    match (parse_number(expected), parse_number(actual)) {
        (Some(e), Some(a)) => f(&format_number(e), &format_number(a)),
        _ => f(expected, actual),
    }
}

fn ordering_op<F: Fn(Ordering) -> bool>(actual: &str, expected: &str, f: F) -> bool {
    compare_values(actual, expected).map(f).unwrap_or(false)
}

/// Orders `actual` relative to `expected`, component-wise when both are dotted version strings and
/// numerically otherwise. Returns None if the two cannot be compared.
pub fn compare_values(actual: &str, expected: &str) -> Option<Ordering> {
    let (actual, expected) = (actual.trim(), expected.trim());
    if is_version(actual) && is_version(expected) {
        return Some(compare_versions(actual, expected));
    }
    let a = parse_number(actual)?;
    let e = parse_number(expected)?;
    a.partial_cmp(&e)
}

/// Compares dotted versions component by component. Missing trailing components count as zero,
/// so `17.2` equals `17.2.0`.
pub fn compare_versions(lhs: &str, rhs: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| part.trim().parse::<u64>().unwrap_or(0))
            .collect()
    };
    let (l, r) = (parse(lhs), parse(rhs));
    let len = l.len().max(r.len());
    (0..len)
        .map(|i| {
            let lc = l.get(i).copied().unwrap_or(0);
            let rc = r.get(i).copied().unwrap_or(0);
            lc.cmp(&rc)
        })
        .find(|o| o.is_ne())
        .unwrap_or(Ordering::Equal)
}

fn is_version(s: &str) -> bool {
    VERSION_REGEX.is_match(s.trim())
}

fn parse_number(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    s.parse::<f64>().ok().filter(|f| f.is_finite())
}
