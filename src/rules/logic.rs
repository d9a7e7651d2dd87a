//! Logic rules: `AND`, `OR`, `NOT` and `SUB-RULE`
//!
//! A logic payload is a parenthesised, comma-separated list of operands, each
//! itself a parenthesised rule:
//!
//! ```text
//! ((DOMAIN,baidu.com),(NETWORK,TCP),(NOT,((DST-PORT,80))))
//! ```
//!
//! Parsing records every balanced bracket span in one pass, then keeps the
//! spans not contained in an already kept one (skipping the outermost). Those
//! are exactly the operands at this level; nested logic operands re-enter the
//! parser through [`RuleParser`].
//!
//! Parentheses inside an operand's own payload (for example a `DOMAIN-REGEX`
//! group) take part in bracket matching like any other. Balanced groups stay
//! inside their operand; an unbalanced escaped `\(` makes the whole logic
//! payload malformed.
//!
//! `SUB-RULE,(guard),name` evaluates its guard and, on a match, walks the named
//! sub-rule list in order; the first match wins with that rule's own adapter.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;

use super::parser::RuleParser;
use super::types::parse_rule_payload;
use super::{Rule, RuleMatchHelper, RuleType};
use crate::error::RuleError;
use crate::metadata::Metadata;

/// Named rule lists reachable from `SUB-RULE`
pub type SubRules = HashMap<String, Vec<Arc<dyn Rule>>>;

/// Shared, set-once sub-rule graph
///
/// Rules inside the graph refer back to it weakly, so the graph owner (the
/// rule snapshot) decides its lifetime.
pub type SubRuleGraph = OnceLock<SubRules>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
}

impl Span {
    fn inside(&self, outer: &Span) -> bool {
        outer.start < self.start && outer.end > self.end
    }
}

/// Boolean combinator over other rules
#[derive(Debug)]
pub struct Logic {
    rule_type: RuleType,
    payload: String,
    display: OnceLock<String>,
    adapter: String,
    rules: Vec<Arc<dyn Rule>>,
    sub_rules: Option<Weak<SubRuleGraph>>,
}

impl Logic {
    /// Parse an `AND` rule
    ///
    /// # Errors
    ///
    /// Returns a `RuleError` for malformed payloads or operands.
    pub fn new_and(payload: &str, adapter: &str, parser: &RuleParser) -> Result<Self, RuleError> {
        Self::parse(RuleType::And, payload, adapter, parser)
    }

    /// Parse an `OR` rule
    ///
    /// # Errors
    ///
    /// Returns a `RuleError` for malformed payloads or operands.
    pub fn new_or(payload: &str, adapter: &str, parser: &RuleParser) -> Result<Self, RuleError> {
        Self::parse(RuleType::Or, payload, adapter, parser)
    }

    /// Parse a `NOT` rule; exactly one operand
    ///
    /// # Errors
    ///
    /// Returns a `RuleError` for malformed payloads or a wrong operand count.
    pub fn new_not(payload: &str, adapter: &str, parser: &RuleParser) -> Result<Self, RuleError> {
        Self::parse(RuleType::Not, payload, adapter, parser)
    }

    /// Parse a `SUB-RULE`; the payload is the bare guard, `(TYPE,PAYLOAD)`
    ///
    /// # Errors
    ///
    /// Returns a `RuleError` for malformed payloads or a wrong operand count.
    pub fn new_sub_rule(
        payload: &str,
        target: &str,
        sub_rules: Weak<SubRuleGraph>,
        parser: &RuleParser,
    ) -> Result<Self, RuleError> {
        let mut logic = Self::parse(RuleType::SubRule, &format!("({payload})"), target, parser)?;
        logic.payload = payload.to_string();
        logic.sub_rules = Some(sub_rules);
        Ok(logic)
    }

    fn parse(
        rule_type: RuleType,
        payload: &str,
        adapter: &str,
        parser: &RuleParser,
    ) -> Result<Self, RuleError> {
        let rules = parse_operands(payload, parser)?;
        let count_ok = match rule_type {
            RuleType::Not | RuleType::SubRule => rules.len() == 1,
            _ => !rules.is_empty(),
        };
        if !count_ok {
            return Err(RuleError::OperandCount {
                rule_type: rule_type.as_str().to_string(),
                expected: if matches!(rule_type, RuleType::Not | RuleType::SubRule) {
                    "exactly 1"
                } else {
                    "at least 1"
                },
                got: rules.len(),
            });
        }
        Ok(Self {
            rule_type,
            payload: payload.to_string(),
            display: OnceLock::new(),
            adapter: adapter.to_string(),
            rules,
            sub_rules: None,
        })
    }

    /// Operands of this rule
    #[must_use]
    pub fn rules(&self) -> &[Arc<dyn Rule>] {
        &self.rules
    }
}

/// All balanced bracket spans of `payload`, sorted by start
fn bracket_spans(payload: &str) -> Result<Vec<Span>, RuleError> {
    let mut stack = Vec::new();
    let mut spans = Vec::new();
    for (i, c) in payload.bytes().enumerate() {
        match c {
            b'(' => stack.push(i),
            b')' => {
                let start = stack
                    .pop()
                    .ok_or_else(|| RuleError::LogicFormat(format!("missing '(' in {payload}")))?;
                spans.push(Span { start, end: i });
            }
            _ => {}
        }
    }
    if !stack.is_empty() {
        return Err(RuleError::LogicFormat(format!("missing ')' in {payload}")));
    }
    spans.sort_by_key(|s| s.start);
    Ok(spans)
}

/// Spans that are direct children of the whole expression
fn direct_children(payload_len: usize, spans: &[Span]) -> Vec<Span> {
    let mut kept: Vec<Span> = Vec::new();
    for span in spans {
        if span.start == 0 && span.end == payload_len - 1 {
            continue;
        }
        if !kept.iter().any(|k| span.inside(k)) {
            kept.push(*span);
        }
    }
    kept
}

fn parse_operands(payload: &str, parser: &RuleParser) -> Result<Vec<Arc<dyn Rule>>, RuleError> {
    if !payload.starts_with('(') || !payload.ends_with(')') {
        return Err(RuleError::LogicFormat(format!(
            "payload must be wrapped in parentheses: {payload}"
        )));
    }
    let spans = bracket_spans(payload)?;
    direct_children(payload.len(), &spans)
        .into_iter()
        .map(|span| operand_to_rule(&payload[span.start + 1..span.end], parser))
        .collect()
}

fn operand_to_rule(operand: &str, parser: &RuleParser) -> Result<Arc<dyn Rule>, RuleError> {
    let line = parse_rule_payload(operand, false);
    match line.rule_type.as_str() {
        "" => Err(RuleError::LogicFormat(format!("[{operand}] format is error"))),
        "MATCH" | "SUB-RULE" => Err(RuleError::NotAllowedInLogic(line.rule_type)),
        _ => parser.parse(&line.rule_type, &line.payload, "", &line.params),
    }
}

async fn match_sub_rules(
    metadata: &mut Metadata,
    list: &[Arc<dyn Rule>],
    helper: &RuleMatchHelper<'_>,
) -> Option<String> {
    for rule in list {
        if let Some(adapter) = rule.matches(metadata, helper).await {
            return Some(adapter);
        }
    }
    None
}

#[async_trait]
impl Rule for Logic {
    fn rule_type(&self) -> RuleType {
        self.rule_type
    }

    async fn matches(&self, metadata: &mut Metadata, helper: &RuleMatchHelper<'_>) -> Option<String> {
        match self.rule_type {
            RuleType::SubRule => {
                self.rules[0].matches(metadata, helper).await?;
                let graph = self.sub_rules.as_ref()?.upgrade()?;
                let list = graph.get()?.get(&self.adapter)?;
                match_sub_rules(metadata, list, helper).await
            }
            RuleType::Not => match self.rules[0].matches(metadata, helper).await {
                Some(_) => None,
                None => Some(self.adapter.clone()),
            },
            RuleType::Or => {
                for rule in &self.rules {
                    if rule.matches(metadata, helper).await.is_some() {
                        return Some(self.adapter.clone());
                    }
                }
                None
            }
            RuleType::And => {
                for rule in &self.rules {
                    rule.matches(metadata, helper).await?;
                }
                Some(self.adapter.clone())
            }
            _ => None,
        }
    }

    fn adapter(&self) -> &str {
        &self.adapter
    }

    fn payload(&self) -> &str {
        self.display.get_or_init(|| {
            let operand = |r: &Arc<dyn Rule>| format!("({},{})", r.rule_type(), r.payload());
            match self.rule_type {
                RuleType::Not => format!("(!{})", operand(&self.rules[0])),
                RuleType::Or | RuleType::And => {
                    let sep = if self.rule_type == RuleType::Or { " || " } else { " && " };
                    let parts: Vec<String> = self.rules.iter().map(operand).collect();
                    format!("({})", parts.join(sep))
                }
                _ => self.payload.clone(),
            }
        })
    }

    fn provider_names(&self) -> Vec<String> {
        self.rules.iter().flat_map(|r| r.provider_names()).collect()
    }

    fn should_resolve_ip(&self) -> bool {
        self.rules.iter().any(|r| r.should_resolve_ip())
    }

    fn should_find_process(&self) -> bool {
        self.rules.iter().any(|r| r.should_find_process())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Network;

    fn parser() -> RuleParser {
        RuleParser::new()
    }

    #[test]
    fn test_bracket_spans() {
        let spans = bracket_spans("((A,1),(B,2))").unwrap();
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0], Span { start: 0, end: 12 });
        let kids = direct_children(13, &spans);
        assert_eq!(kids, vec![Span { start: 1, end: 5 }, Span { start: 7, end: 11 }]);
    }

    #[test]
    fn test_bracket_spans_unbalanced() {
        assert!(bracket_spans("(DOMAIN,a.com))").is_err());
        assert!(bracket_spans("((DOMAIN,a.com)").is_err());
    }

    #[test]
    fn test_nested_children_skipped() {
        let payload = "((NOT,((DOMAIN,a.com))),(NETWORK,TCP))";
        let spans = bracket_spans(payload).unwrap();
        let kids = direct_children(payload.len(), &spans);
        assert_eq!(kids.len(), 2);
        assert_eq!(&payload[kids[0].start + 1..kids[0].end], "NOT,((DOMAIN,a.com))");
    }

    #[tokio::test]
    async fn test_and_scenario() {
        let rule = Logic::new_and(
            "((DOMAIN,baidu.com),(NETWORK,TCP),(DST-PORT,10001-65535))",
            "DIRECT",
            &parser(),
        )
        .unwrap();
        let helper = RuleMatchHelper::empty();
        let mut m = Metadata::new(Network::Tcp).with_host("baidu.com");
        m.dst_port = 20000;
        assert_eq!(rule.matches(&mut m, &helper).await.as_deref(), Some("DIRECT"));
        m.dst_port = 80;
        assert!(rule.matches(&mut m, &helper).await.is_none());
    }

    #[test]
    fn test_missing_outer_paren() {
        let err = Logic::new_and("(DOMAIN,baidu.com),(NETWORK,TCP))", "DIRECT", &parser());
        assert!(matches!(err, Err(RuleError::LogicFormat(_))));
    }

    #[tokio::test]
    async fn test_not_negates() {
        let rule = Logic::new_not("((DOMAIN,a.com))", "X", &parser()).unwrap();
        let helper = RuleMatchHelper::empty();
        let mut hit = Metadata::new(Network::Tcp).with_host("a.com");
        let mut miss = Metadata::new(Network::Tcp).with_host("b.com");
        assert!(rule.matches(&mut hit, &helper).await.is_none());
        assert_eq!(rule.matches(&mut miss, &helper).await.as_deref(), Some("X"));
    }

    #[test]
    fn test_not_requires_one_operand() {
        let err = Logic::new_not("((DOMAIN,a.com),(DOMAIN,b.com))", "X", &parser());
        assert!(matches!(err, Err(RuleError::OperandCount { got: 2, .. })));
        let err = Logic::new_and("()", "X", &parser());
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_or() {
        let rule = Logic::new_or("((DOMAIN,a.com),(DST-PORT,53))", "Y", &parser()).unwrap();
        let helper = RuleMatchHelper::empty();
        let mut m = Metadata::new(Network::Udp).with_host("z.com");
        m.dst_port = 53;
        assert!(rule.matches(&mut m, &helper).await.is_some());
        m.dst_port = 54;
        assert!(rule.matches(&mut m, &helper).await.is_none());
    }

    #[test]
    fn test_match_and_sub_rule_rejected_inside_logic() {
        let err = Logic::new_and("((MATCH,x),(NETWORK,TCP))", "X", &parser());
        assert!(matches!(err, Err(RuleError::NotAllowedInLogic(ref t)) if t == "MATCH"));
        let err = Logic::new_or("((SUB-RULE,(NETWORK,TCP)))", "X", &parser());
        assert!(matches!(err, Err(RuleError::NotAllowedInLogic(_))));
    }

    #[test]
    fn test_payload_rendering_is_memoized() {
        let rule = Logic::new_and("((DOMAIN,a.com),(NETWORK,udp))", "X", &parser()).unwrap();
        assert_eq!(rule.payload(), "((DOMAIN,a.com) && (NETWORK,UDP))");
        assert_eq!(rule.payload(), "((DOMAIN,a.com) && (NETWORK,UDP))");

        let rule = Logic::new_or("((DOMAIN,a.com),(DOMAIN,b.com))", "X", &parser()).unwrap();
        assert_eq!(rule.payload(), "((DOMAIN,a.com) || (DOMAIN,b.com))");

        let rule = Logic::new_not("((DST-PORT,80))", "X", &parser()).unwrap();
        assert_eq!(rule.payload(), "(!(DST-PORT,80))");
    }

    #[test]
    fn test_nested_logic() {
        let rule = Logic::new_and(
            "((OR,((DOMAIN,a.com),(DOMAIN,b.com))),(NOT,((NETWORK,UDP))))",
            "X",
            &parser(),
        )
        .unwrap();
        assert_eq!(rule.rules().len(), 2);
        assert_eq!(rule.rules()[0].rule_type(), RuleType::Or);
        assert_eq!(rule.rules()[1].rule_type(), RuleType::Not);
    }

    #[test]
    fn test_regex_groups_inside_operand() {
        let rule = Logic::new_and(r"((DOMAIN-REGEX,^(www\.)?a\.com$),(NETWORK,TCP))", "X", &parser())
            .unwrap();
        assert_eq!(rule.rules()[0].payload(), r"^(www\.)?a\.com$");
    }

    #[test]
    fn test_regex_with_escaped_paren_breaks_logic_parsing() {
        // Known limitation: escaped parentheses still count as brackets.
        let rule = Logic::new_and(r"((DOMAIN-REGEX,^a\(b$),(NETWORK,TCP))", "X", &parser());
        assert!(matches!(rule, Err(RuleError::LogicFormat(_))));
    }
}
