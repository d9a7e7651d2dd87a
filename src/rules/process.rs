//! Process and UID rules
//!
//! These rules ask the [`RuleMatchHelper`] to look up the owning process the
//! first time one of them is evaluated for a connection.

use async_trait::async_trait;
use regex::Regex;

use super::{Rule, RuleMatchHelper, RuleType};
use crate::common::IntRanges;
use crate::error::RuleError;
use crate::metadata::Metadata;

#[derive(Debug)]
enum ProcessMatch {
    Name(String),
    Path(String),
    NameRegex(Regex),
    PathRegex(Regex),
}

/// `PROCESS-NAME`, `PROCESS-PATH` and their `-REGEX` variants
#[derive(Debug)]
pub struct ProcessRule {
    matcher: ProcessMatch,
    payload: String,
    adapter: String,
}

impl ProcessRule {
    /// # Errors
    ///
    /// Returns `RuleError::InvalidRegex` for a bad pattern.
    pub fn new(rule_type: RuleType, payload: &str, adapter: &str) -> Result<Self, RuleError> {
        let regex = || Regex::new(payload).map_err(|_| RuleError::InvalidRegex(payload.to_string()));
        let matcher = match rule_type {
            RuleType::ProcessName => ProcessMatch::Name(payload.to_string()),
            RuleType::ProcessPath => ProcessMatch::Path(payload.to_string()),
            RuleType::ProcessNameRegex => ProcessMatch::NameRegex(regex()?),
            RuleType::ProcessPathRegex => ProcessMatch::PathRegex(regex()?),
            other => return Err(RuleError::invalid_payload(other.as_str(), payload)),
        };
        Ok(Self {
            matcher,
            payload: payload.to_string(),
            adapter: adapter.to_string(),
        })
    }
}

#[async_trait]
impl Rule for ProcessRule {
    fn rule_type(&self) -> RuleType {
        match self.matcher {
            ProcessMatch::Name(_) => RuleType::ProcessName,
            ProcessMatch::Path(_) => RuleType::ProcessPath,
            ProcessMatch::NameRegex(_) => RuleType::ProcessNameRegex,
            ProcessMatch::PathRegex(_) => RuleType::ProcessPathRegex,
        }
    }

    async fn matches(&self, metadata: &mut Metadata, helper: &RuleMatchHelper<'_>) -> Option<String> {
        helper.find_process(metadata);
        let hit = match &self.matcher {
            ProcessMatch::Name(n) => metadata.process.eq_ignore_ascii_case(n),
            ProcessMatch::Path(p) => metadata.process_path.eq_ignore_ascii_case(p),
            ProcessMatch::NameRegex(re) => !metadata.process.is_empty() && re.is_match(&metadata.process),
            ProcessMatch::PathRegex(re) => {
                !metadata.process_path.is_empty() && re.is_match(&metadata.process_path)
            }
        };
        hit.then(|| self.adapter.clone())
    }

    fn adapter(&self) -> &str {
        &self.adapter
    }

    fn payload(&self) -> &str {
        &self.payload
    }

    fn should_find_process(&self) -> bool {
        true
    }
}

/// `UID,1000-1999`
#[derive(Debug)]
pub struct UidRule {
    ranges: IntRanges<u32>,
    payload: String,
    adapter: String,
}

impl UidRule {
    /// # Errors
    ///
    /// Returns `RuleError::InvalidPayload` for an empty or malformed list.
    pub fn new(payload: &str, adapter: &str) -> Result<Self, RuleError> {
        let ranges = IntRanges::parse(payload)
            .map_err(|_| RuleError::invalid_payload("UID", payload))?;
        if ranges.is_empty() {
            return Err(RuleError::invalid_payload("UID", payload));
        }
        Ok(Self {
            ranges,
            payload: payload.to_string(),
            adapter: adapter.to_string(),
        })
    }
}

#[async_trait]
impl Rule for UidRule {
    fn rule_type(&self) -> RuleType {
        RuleType::Uid
    }

    async fn matches(&self, metadata: &mut Metadata, helper: &RuleMatchHelper<'_>) -> Option<String> {
        helper.find_process(metadata);
        metadata
            .uid
            .is_some_and(|uid| self.ranges.check(uid))
            .then(|| self.adapter.clone())
    }

    fn adapter(&self) -> &str {
        &self.adapter
    }

    fn payload(&self) -> &str {
        &self.payload
    }

    fn should_find_process(&self) -> bool {
        true
    }
}
