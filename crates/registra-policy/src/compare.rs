//! Value comparison.
//!
//! When both operands parse as integers the numeric comparators apply;
//! otherwise string semantics apply. Unmatched comparator and kind
//! combinations never raise: they log and return false.

use regex::Regex;

use crate::model::Comparator;

/// Compare a checked value against an expected value.
#[must_use]
pub fn compare(checked: Option<&str>, comparator: Comparator, expected: Option<&str>) -> bool {
    if let (Some(c), Some(e)) = (checked, expected)
        && let (Ok(cn), Ok(en)) = (c.trim().parse::<i64>(), e.trim().parse::<i64>())
    {
        return compare_numeric(cn, comparator, en);
    }
    compare_string(checked, comparator, expected)
}

fn compare_numeric(checked: i64, comparator: Comparator, expected: i64) -> bool {
    match comparator {
        Comparator::Equals => checked == expected,
        Comparator::NotEquals => checked != expected,
        Comparator::GreaterThan => checked > expected,
        Comparator::GreaterThanOrEquals => checked >= expected,
        Comparator::LessThan => checked < expected,
        Comparator::LessThanOrEquals => checked <= expected,
        _ => {
            tracing::warn!(?comparator, "Unsupported numeric comparator");
            false
        }
    }
}

fn compare_string(checked: Option<&str>, comparator: Comparator, expected: Option<&str>) -> bool {
    match comparator {
        Comparator::Like => match (checked, expected) {
            (Some(c), Some(e)) => like_match(c, e),
            _ => false,
        },
        Comparator::Equals => match (checked, expected) {
            (Some(c), Some(e)) => c == e,
            (None, None) => true,
            _ => false,
        },
        Comparator::IsNull => checked.is_none(),
        _ => {
            tracing::warn!(?comparator, "Unsupported string comparator");
            false
        }
    }
}

/// SQL-style LIKE: `%` wildcards become `.*`, matched as a substring search.
fn like_match(checked: &str, expected: &str) -> bool {
    let pattern = expected
        .split('%')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    match Regex::new(&pattern) {
        Ok(re) => re.is_match(checked),
        Err(err) => {
            tracing::warn!(expected, error = %err, "Invalid LIKE expression");
            false
        }
    }
}
