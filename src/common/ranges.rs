//! Inclusive integer range lists
//!
//! Port rules, UID rules and health-check expected statuses all accept the
//! same compact syntax: ranges separated by `/`, each either a single value or
//! `start-end`.
//!
//! ```
//! use meta_router::common::IntRanges;
//!
//! let ports: IntRanges<u16> = IntRanges::parse("80/443/8000-8999").unwrap();
//! assert!(ports.check(443));
//! assert!(ports.check(8080));
//! assert!(!ports.check(22));
//! ```

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Error returned for malformed range expressions
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid range: {0}")]
pub struct InvalidRange(pub String);

/// One inclusive range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntRange<T> {
    pub start: T,
    pub end: T,
}

impl<T: Copy + Ord> IntRange<T> {
    /// Create a range; `None` if `start > end`
    pub fn new(start: T, end: T) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// Range holding one value
    pub const fn single(value: T) -> Self {
        Self {
            start: value,
            end: value,
        }
    }

    /// Check if a value is within this range
    pub fn contains(&self, value: T) -> bool {
        value >= self.start && value <= self.end
    }
}

/// List of inclusive ranges; an empty list accepts everything
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntRanges<T>(Vec<IntRange<T>>);

impl<T> Default for IntRanges<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T> IntRanges<T>
where
    T: Copy + Ord + FromStr,
{
    /// Parse `a/b-c/d`; empty input and `*` yield the accept-all list
    ///
    /// # Errors
    ///
    /// Returns `InvalidRange` for non-numeric parts or reversed ranges.
    pub fn parse(expr: &str) -> Result<Self, InvalidRange> {
        let expr = expr.trim();
        if expr.is_empty() || expr == "*" {
            return Ok(Self::default());
        }

        let mut ranges = Vec::new();
        for part in expr.split('/') {
            let part = part.trim();
            let bad = || InvalidRange(part.to_string());
            let range = match part.split_once('-') {
                Some((start, end)) => {
                    let start = start.trim().parse::<T>().map_err(|_| bad())?;
                    let end = end.trim().parse::<T>().map_err(|_| bad())?;
                    IntRange::new(start, end).ok_or_else(bad)?
                }
                None => IntRange::single(part.parse::<T>().map_err(|_| bad())?),
            };
            ranges.push(range);
        }
        Ok(Self(ranges))
    }

    /// Check a value; an empty list accepts any value
    pub fn check(&self, value: T) -> bool {
        self.0.is_empty() || self.0.iter().any(|r| r.contains(value))
    }

    /// Whether the list accepts everything
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The parsed ranges
    pub fn ranges(&self) -> &[IntRange<T>] {
        &self.0
    }
}

impl<T: fmt::Display + PartialEq> fmt::Display for IntRanges<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("*");
        }
        for (i, r) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            if r.start == r.end {
                write!(f, "{}", r.start)?;
            } else {
                write!(f, "{}-{}", r.start, r.end)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_and_range() {
        let r: IntRanges<u16> = IntRanges::parse("53/10001-65535").unwrap();
        assert!(r.check(53));
        assert!(r.check(20000));
        assert!(!r.check(54));
        assert_eq!(r.ranges().len(), 2);
    }

    #[test]
    fn test_parse_empty_accepts_all() {
        let r: IntRanges<u16> = IntRanges::parse("").unwrap();
        assert!(r.is_empty());
        assert!(r.check(0));
        let r: IntRanges<u16> = IntRanges::parse("*").unwrap();
        assert!(r.check(599));
    }

    #[test]
    fn test_parse_reversed_range_fails() {
        assert!(IntRanges::<u16>::parse("443-80").is_err());
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert_eq!(
            IntRanges::<u16>::parse("80/abc"),
            Err(InvalidRange("abc".into()))
        );
        assert!(IntRanges::<u16>::parse("70000").is_err());
    }

    #[test]
    fn test_display() {
        let r: IntRanges<u16> = IntRanges::parse("200/204/300-399").unwrap();
        assert_eq!(r.to_string(), "200/204/300-399");
        assert_eq!(IntRanges::<u16>::default().to_string(), "*");
    }

    #[test]
    fn test_u32_ranges() {
        let r: IntRanges<u32> = IntRanges::parse("1000-2000").unwrap();
        assert!(r.check(1500));
        assert!(!r.check(999));
    }
}
