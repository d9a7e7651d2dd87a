//! Error types for meta-router
//!
//! Errors are grouped by subsystem. Each subsystem enum converts into the
//! top-level [`RouterError`], and each one can tell whether retrying the
//! failed operation makes sense.

use std::io;

use thiserror::Error;

/// Top-level error type for meta-router
#[derive(Debug, Error)]
pub enum RouterError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Rule parsing errors
    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    /// Rule/proxy provider errors
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Proxy group errors
    #[error("Group error: {0}")]
    Group(#[from] GroupError),

    /// Outbound adapter errors
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// UDP session errors
    #[error("NAT error: {0}")]
    Nat(#[from] NatError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RouterError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) | Self::Rule(_) => false,
            Self::Provider(e) => e.is_recoverable(),
            Self::Group(e) => e.is_recoverable(),
            Self::Adapter(e) => e.is_recoverable(),
            Self::Nat(e) => e.is_recoverable(),
            Self::Io(e) => is_transient_io(e),
        }
    }
}

fn is_transient_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
    )
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are generally not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Rule parsing and validation errors
#[derive(Debug, Error)]
pub enum RuleError {
    /// Rule type is not known
    #[error("unsupported rule type: {0}")]
    UnsupportedType(String),

    /// Rule line could not be split into type/payload/target
    #[error("invalid rule format: {0}")]
    InvalidFormat(String),

    /// Logic payload is not a well-formed parenthesised list
    #[error("logic rule format error: {0}")]
    LogicFormat(String),

    /// Wrong number of operands for a logic rule
    #[error("{rule_type} requires {expected} operand(s), got {got}")]
    OperandCount {
        rule_type: String,
        expected: &'static str,
        got: usize,
    },

    /// Rule type is not allowed as an operand of a logic rule
    #[error("rule type {0} is not allowed inside a logic rule")]
    NotAllowedInLogic(String),

    /// Invalid regular expression
    #[error("invalid regex pattern: {0}")]
    InvalidRegex(String),

    /// Invalid CIDR or IP literal
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),

    /// Invalid port or port range
    #[error("invalid port range: {0}")]
    InvalidPort(String),

    /// Invalid payload for a specific rule type
    #[error("invalid payload for {rule_type}: {payload}")]
    InvalidPayload { rule_type: String, payload: String },

    /// SUB-RULE refers to a list that does not exist
    #[error("sub-rule not found: {0}")]
    SubRuleNotFound(String),

    /// SUB-RULE lists reference each other in a loop
    #[error("sub-rule loop detected: {0}")]
    SubRuleLoop(String),

    /// SUB-RULE used where no sub-rule lists are available
    #[error("sub-rules are not available here")]
    SubRulesUnavailable,

    /// RULE-SET refers to a provider that does not exist
    #[error("rule provider not found: {0}")]
    ProviderNotFound(String),
}

impl RuleError {
    /// Create an invalid-payload error
    pub fn invalid_payload(rule_type: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::InvalidPayload {
            rule_type: rule_type.into(),
            payload: payload.into(),
        }
    }
}

/// Rule and proxy provider errors
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Provider does not exist
    #[error("provider not found: {0}")]
    NotFound(String),

    /// Unknown provider behavior
    #[error("unknown rule provider behavior: {0}")]
    UnknownBehavior(String),

    /// Unknown provider format
    #[error("unknown rule provider format: {0}")]
    UnknownFormat(String),

    /// Binary format requested for a behavior that has no binary form
    #[error("behavior {0} does not support the binary format")]
    BinaryUnsupported(String),

    /// Binary blob is truncated or has a bad header
    #[error("invalid binary rule set: {0}")]
    InvalidBinary(String),

    /// Provider has neither a path nor an inline payload
    #[error("provider {0} has no source")]
    NoSource(String),

    /// Proxy provider has no proxies
    #[error("provider {0} has no proxies")]
    Empty(String),

    /// Proxy option map could not be built into an adapter
    #[error("provider {provider}: {reason}")]
    InvalidProxy { provider: String, reason: String },

    /// Rule error while loading a provider
    #[error(transparent)]
    Rule(#[from] RuleError),

    /// I/O error while reading a provider file
    #[error("provider I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProviderError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => is_transient_io(e),
            _ => false,
        }
    }
}

/// Proxy group errors
#[derive(Debug, Error)]
pub enum GroupError {
    /// `Selector::set` was given a name no member has
    #[error("proxy not exist: {0}")]
    ProxyNotExist(String),

    /// Group has no members and no providers
    #[error("group {0} has no proxies")]
    Empty(String),

    /// Unknown group type
    #[error("unsupported group type: {0}")]
    UnsupportedType(String),

    /// Unknown load-balance strategy
    #[error("unsupported load balance strategy: {0}")]
    InvalidStrategy(String),

    /// Group references a proxy or provider that does not exist
    #[error("group {group}: unknown member {member}")]
    UnknownMember { group: String, member: String },

    /// Groups reference each other in a loop
    #[error("proxy group loop detected: {0}")]
    DependencyLoop(String),

    /// Invalid filter regex
    #[error("invalid filter in group {group}: {pattern}")]
    InvalidFilter { group: String, pattern: String },

    /// Invalid expected-status expression
    #[error("invalid expected status: {0}")]
    InvalidExpectedStatus(String),

    /// Provider error
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl GroupError {
    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Outbound adapter errors
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Dial failed
    #[error("{proxy} failed to connect to {addr}: {reason}")]
    DialFailed {
        proxy: String,
        addr: String,
        reason: String,
    },

    /// Adapter does not carry UDP
    #[error("{0} does not support UDP")]
    UdpUnsupported(String),

    /// Operation timed out
    #[error("{proxy} timed out after {timeout_ms}ms")]
    Timeout { proxy: String, timeout_ms: u64 },

    /// Adapter rejects every connection
    #[error("connection rejected by {0}")]
    Rejected(String),

    /// Capability is not provided by this adapter
    #[error("{op} is not supported by {proxy}")]
    Unsupported { proxy: String, op: &'static str },

    /// Destination is not usable
    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    /// Adapter options are missing or malformed
    #[error("invalid adapter options: {0}")]
    InvalidOptions(String),

    /// Health-check probe failed
    #[error("url test failed: {0}")]
    Probe(String),

    /// Probe answered with a status outside the expected set
    #[error("unexpected status code: {0}")]
    UnexpectedStatus(u16),

    /// Adapter was closed
    #[error("adapter {0} is closed")]
    Closed(String),

    /// I/O error during connection
    #[error("adapter I/O error: {0}")]
    Io(#[from] io::Error),
}

impl AdapterError {
    /// Create a dial failure
    pub fn dial(proxy: impl Into<String>, addr: impl Into<String>, reason: impl ToString) -> Self {
        Self::DialFailed {
            proxy: proxy.into(),
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::DialFailed { .. } | Self::Timeout { .. } | Self::Probe(_) => true,
            Self::UdpUnsupported(_)
            | Self::Rejected(_)
            | Self::Unsupported { .. }
            | Self::InvalidDestination(_)
            | Self::InvalidOptions(_)
            | Self::UnexpectedStatus(_)
            | Self::Closed(_) => false,
            Self::Io(e) => is_transient_io(e),
        }
    }
}

/// UDP session errors
#[derive(Debug, Error)]
pub enum NatError {
    /// Destination address could not be determined
    #[error("invalid UDP destination: {0}")]
    InvalidDestination(String),

    /// Destination host did not resolve
    #[error("failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    /// Packet sender is closed
    #[error("packet sender closed")]
    Closed,

    /// Adapter error while opening or using the session
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// I/O error on the session socket
    #[error("NAT I/O error: {0}")]
    Io(#[from] io::Error),
}

impl NatError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Resolve { .. } => true,
            Self::InvalidDestination(_) | Self::Closed => false,
            Self::Adapter(e) => e.is_recoverable(),
            Self::Io(e) => is_transient_io(e),
        }
    }
}

/// Result type alias for meta-router operations
pub type Result<T> = std::result::Result<T, RouterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_not_recoverable() {
        let err = ConfigError::ValidationError("bad".into());
        assert!(!err.is_recoverable());
        let err: RouterError = err.into();
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_proxy_not_exist_message() {
        let err = GroupError::ProxyNotExist("hk-01".into());
        assert!(err.to_string().contains("proxy not exist"));
        assert!(err.to_string().contains("hk-01"));
    }

    #[test]
    fn test_adapter_error_recoverable() {
        assert!(AdapterError::dial("p", "1.1.1.1:443", "refused").is_recoverable());
        assert!(AdapterError::Timeout {
            proxy: "p".into(),
            timeout_ms: 5000
        }
        .is_recoverable());
        assert!(!AdapterError::UdpUnsupported("p".into()).is_recoverable());
        assert!(!AdapterError::Rejected("REJECT".into()).is_recoverable());
    }

    #[test]
    fn test_nat_error_from_adapter() {
        let err: NatError = AdapterError::UdpUnsupported("p".into()).into();
        assert!(matches!(err, NatError::Adapter(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_io_error_recoverable() {
        let err: RouterError = io::Error::new(io::ErrorKind::TimedOut, "t").into();
        assert!(err.is_recoverable());
        let err: RouterError = io::Error::new(io::ErrorKind::NotFound, "n").into();
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_rule_error_display() {
        let err = RuleError::OperandCount {
            rule_type: "NOT".into(),
            expected: "exactly 1",
            got: 2,
        };
        assert_eq!(err.to_string(), "NOT requires exactly 1 operand(s), got 2");
    }
}
