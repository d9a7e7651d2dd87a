//! Domain rules
//!
//! All domain rules look at [`Metadata::rule_host`], so a sniffed host takes
//! precedence over the host the client asked for. Matching is
//! case-insensitive; connections without a host never match.

use async_trait::async_trait;
use regex::Regex;

use super::{Rule, RuleMatchHelper, RuleType};
use crate::error::RuleError;
use crate::metadata::Metadata;

/// How a [`DomainRule`] compares the host
#[derive(Debug, Clone)]
enum DomainMatch {
    Exact(String),
    Suffix(String),
    Keyword(String),
    Wildcard(String),
    Regex(Regex),
}

/// `DOMAIN`, `DOMAIN-SUFFIX`, `DOMAIN-KEYWORD`, `DOMAIN-WILDCARD` and `DOMAIN-REGEX`
#[derive(Debug)]
pub struct DomainRule {
    rule_type: RuleType,
    matcher: DomainMatch,
    payload: String,
    adapter: String,
}

impl DomainRule {
    /// Build a domain rule of the given type
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidRegex` for a bad `DOMAIN-REGEX` pattern and
    /// `RuleError::InvalidPayload` for an empty domain or a non-domain type.
    pub fn new(rule_type: RuleType, payload: &str, adapter: &str) -> Result<Self, RuleError> {
        if payload.is_empty() {
            return Err(RuleError::invalid_payload(rule_type.as_str(), payload));
        }
        let lower = payload.to_ascii_lowercase();
        let matcher = match rule_type {
            RuleType::Domain => DomainMatch::Exact(lower),
            RuleType::DomainSuffix => DomainMatch::Suffix(lower.trim_start_matches('.').to_string()),
            RuleType::DomainKeyword => DomainMatch::Keyword(lower),
            RuleType::DomainWildcard => DomainMatch::Wildcard(lower),
            RuleType::DomainRegex => DomainMatch::Regex(
                Regex::new(payload).map_err(|_| RuleError::InvalidRegex(payload.to_string()))?,
            ),
            other => return Err(RuleError::invalid_payload(other.as_str(), payload)),
        };
        Ok(Self {
            rule_type,
            matcher,
            payload: payload.to_string(),
            adapter: adapter.to_string(),
        })
    }

    /// Match a bare host name
    #[must_use]
    pub fn match_host(&self, host: &str) -> bool {
        if host.is_empty() {
            return false;
        }
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        match &self.matcher {
            DomainMatch::Exact(d) => host == *d,
            DomainMatch::Suffix(s) => is_subdomain_of(&host, s),
            DomainMatch::Keyword(k) => host.contains(k.as_str()),
            DomainMatch::Wildcard(p) => wildcard_match(p, &host),
            DomainMatch::Regex(re) => re.is_match(&host),
        }
    }
}

#[async_trait]
impl Rule for DomainRule {
    fn rule_type(&self) -> RuleType {
        self.rule_type
    }

    async fn matches(&self, metadata: &mut Metadata, _: &RuleMatchHelper<'_>) -> Option<String> {
        self.match_host(metadata.rule_host())
            .then(|| self.adapter.clone())
    }

    fn adapter(&self) -> &str {
        &self.adapter
    }

    fn payload(&self) -> &str {
        &self.payload
    }
}

/// `host` equals `suffix` or ends with `.suffix`
#[must_use]
pub fn is_subdomain_of(host: &str, suffix: &str) -> bool {
    host.strip_suffix(suffix)
        .is_some_and(|rest| rest.is_empty() || rest.ends_with('.'))
}

/// Glob match where `*` matches any run of characters and `?` exactly one
#[must_use]
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p = pattern.as_bytes();
    let t = text.as_bytes();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == b'?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == b'*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}
