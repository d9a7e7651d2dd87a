//! `domain` rule provider strategy
//!
//! Line forms:
//!
//! | Line            | Matches                                  |
//! |-----------------|------------------------------------------|
//! | `example.com`   | exactly `example.com`                    |
//! | `+.example.com` | `example.com` and every subdomain        |
//! | `.example.com`  | every subdomain, not `example.com` itself |
//! | `*.example.com` | wildcard pattern (`*` any run, `?` one)  |
//!
//! Suffix lines are stored reversed with a leading dot ("google.com" becomes
//! ".moc.elgoog") in one Aho-Corasick automaton, so a host is checked against
//! every suffix in a single pass over its reversed form.

use std::collections::HashSet;

use aho_corasick::AhoCorasick;
use async_trait::async_trait;
use tracing::warn;

use super::{RuleBehavior, RuleStrategy};
use crate::metadata::Metadata;
use crate::rules::domain::wildcard_match;
use crate::rules::RuleMatchHelper;

#[derive(Debug)]
struct SuffixPattern {
    reversed: String,
    /// Subdomains only
    strict: bool,
}

/// Domain set with exact, suffix and wildcard entries
#[derive(Debug, Default)]
pub struct DomainStrategy {
    exact: HashSet<String>,
    suffixes: Vec<SuffixPattern>,
    suffix_automaton: Option<AhoCorasick>,
    wildcards: Vec<String>,
    count: usize,
}

impl DomainStrategy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `host` belongs to the set
    #[must_use]
    pub fn match_domain(&self, host: &str) -> bool {
        let host = normalize(host);
        if host.is_empty() {
            return false;
        }
        if self.exact.contains(host.as_str()) {
            return true;
        }
        if self.match_suffix(&host) {
            return true;
        }
        self.wildcards.iter().any(|p| wildcard_match(p, &host))
    }

    fn match_suffix(&self, host: &str) -> bool {
        let Some(automaton) = self.suffix_automaton.as_ref() else {
            return false;
        };
        // "mail.google.com" -> ".moc.elgoog.liam"
        let reversed: String = std::iter::once('.').chain(host.chars().rev()).collect();
        let bytes = reversed.as_bytes();

        automaton
            .find_overlapping_iter(&reversed)
            .filter(|mat| mat.start() == 0)
            .any(|mat| {
                let end = mat.end();
                let whole = end == bytes.len();
                let boundary = whole || bytes[end] == b'.';
                boundary && !(whole && self.suffixes[mat.pattern().as_usize()].strict)
            })
    }

    fn add_suffix(&mut self, suffix: &str, strict: bool) {
        let reversed: String = std::iter::once('.').chain(suffix.chars().rev()).collect();
        self.suffixes.push(SuffixPattern { reversed, strict });
    }
}

fn normalize(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

#[async_trait]
impl RuleStrategy for DomainStrategy {
    fn behavior(&self) -> RuleBehavior {
        RuleBehavior::Domain
    }

    async fn matches(&self, metadata: &mut Metadata, _helper: &RuleMatchHelper<'_>) -> bool {
        self.match_domain(metadata.rule_host())
    }

    fn insert(&mut self, line: &str) {
        let line = normalize(line.trim());
        if let Some(rest) = line.strip_prefix("+.") {
            if rest.is_empty() {
                warn!(line = %line, "empty domain suffix, skipped");
                return;
            }
            self.add_suffix(rest, false);
        } else if line.contains('*') || line.contains('?') {
            self.wildcards.push(line);
        } else if let Some(rest) = line.strip_prefix('.') {
            if rest.is_empty() {
                warn!(line = %line, "empty domain suffix, skipped");
                return;
            }
            self.add_suffix(rest, true);
        } else if line.is_empty() || line.contains(',') || line.contains(' ') {
            warn!(line = %line, "invalid domain in rule provider, skipped");
            return;
        } else {
            self.exact.insert(line);
        }
        self.count += 1;
    }

    fn finish_insert(&mut self) {
        if self.suffixes.is_empty() {
            self.suffix_automaton = None;
            return;
        }
        match AhoCorasick::new(self.suffixes.iter().map(|s| s.reversed.as_str())) {
            Ok(automaton) => self.suffix_automaton = Some(automaton),
            Err(e) => {
                warn!(error = %e, "failed to build domain suffix automaton");
                self.suffix_automaton = None;
            }
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn count(&self) -> usize {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy(lines: &[&str]) -> DomainStrategy {
        let mut s = DomainStrategy::new();
        for line in lines {
            s.insert(line);
        }
        s.finish_insert();
        s
    }

    #[test]
    fn test_exact() {
        let s = strategy(&["example.com"]);
        assert!(s.match_domain("example.com"));
        assert!(s.match_domain("EXAMPLE.com."));
        assert!(!s.match_domain("www.example.com"));
    }

    #[test]
    fn test_plus_suffix_includes_self() {
        let s = strategy(&["+.google.com"]);
        assert!(s.match_domain("google.com"));
        assert!(s.match_domain("mail.google.com"));
        assert!(!s.match_domain("notgoogle.com"));
        assert!(!s.match_domain("google.com.evil"));
    }

    #[test]
    fn test_dot_suffix_is_strict() {
        let s = strategy(&[".apple.com"]);
        assert!(!s.match_domain("apple.com"));
        assert!(s.match_domain("a.b.apple.com"));
    }

    #[test]
    fn test_overlapping_suffixes() {
        // Both patterns hit the same reversed prefix.
        let s = strategy(&[".example.com", "+.a.example.com"]);
        assert!(s.match_domain("a.example.com"));
        assert!(s.match_domain("x.example.com"));
        assert!(!s.match_domain("example.com"));
    }

    #[test]
    fn test_wildcard() {
        let s = strategy(&["*.cdn.example.net", "img?.example.org"]);
        assert!(s.match_domain("eu.cdn.example.net"));
        assert!(s.match_domain("img1.example.org"));
        assert!(!s.match_domain("cdn.example.net"));
    }

    #[test]
    fn test_count_and_reset() {
        let mut s = strategy(&["a.com", "+.b.com", ".c.com", "*.d.com", "bad entry", "+."]);
        assert_eq!(s.count(), 4);
        s.reset();
        s.finish_insert();
        assert_eq!(s.count(), 0);
        assert!(!s.match_domain("a.com"));
    }

    #[tokio::test]
    async fn test_uses_sniffed_host() {
        let s = strategy(&["+.example.com"]);
        let mut m = Metadata::default();
        m.host = "1.2.3.4".into();
        m.sniff_host = "www.example.com".into();
        assert!(s.matches(&mut m, &RuleMatchHelper::empty()).await);
    }
}
