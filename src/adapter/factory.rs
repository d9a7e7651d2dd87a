//! Building adapters from option maps
//!
//! Proxies are configured as JSON option bags (`{"name": .., "type": .., ..}`).
//! [`AdapterFactory`] turns one bag into an adapter. [`BuiltinFactory`] knows
//! the built-in types and accepts constructors for protocol types the
//! embedder provides.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::{Compatible, Direct, Pass, ProxyAdapter, Reject, RejectDrop};
use crate::error::AdapterError;
use crate::provider::overrides::ProxyOptions;

/// Builds an adapter from its options
pub trait AdapterFactory: Send + Sync {
    /// # Errors
    ///
    /// Returns `AdapterError::InvalidOptions` for a missing name or an
    /// unknown type.
    fn build(&self, options: &ProxyOptions) -> Result<Arc<dyn ProxyAdapter>, AdapterError>;
}

/// Constructor for one adapter type
pub type AdapterConstructor =
    Box<dyn Fn(&ProxyOptions) -> Result<Arc<dyn ProxyAdapter>, AdapterError> + Send + Sync>;

/// Factory for built-in adapter types plus registered protocol constructors
#[derive(Default)]
pub struct BuiltinFactory {
    constructors: HashMap<String, AdapterConstructor>,
}

impl BuiltinFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for `type_name` (case-insensitive)
    #[must_use]
    pub fn with_type(mut self, type_name: &str, constructor: AdapterConstructor) -> Self {
        self.constructors.insert(type_name.to_ascii_lowercase(), constructor);
        self
    }
}

/// `name` of an option bag
///
/// # Errors
///
/// Returns `AdapterError::InvalidOptions` if it is missing or empty.
pub fn option_name(options: &ProxyOptions) -> Result<&str, AdapterError> {
    match options.get("name") {
        Some(Value::String(name)) if !name.is_empty() => Ok(name),
        _ => Err(AdapterError::InvalidOptions("missing proxy name".into())),
    }
}

fn option_bool(options: &ProxyOptions, key: &str, default: bool) -> bool {
    options.get(key).and_then(Value::as_bool).unwrap_or(default)
}

impl AdapterFactory for BuiltinFactory {
    fn build(&self, options: &ProxyOptions) -> Result<Arc<dyn ProxyAdapter>, AdapterError> {
        let name = option_name(options)?;
        let type_name = options
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| AdapterError::InvalidOptions(format!("proxy {name}: missing type")))?
            .to_ascii_lowercase();

        let adapter: Arc<dyn ProxyAdapter> = match type_name.as_str() {
            "direct" => Arc::new(Direct::new(name).with_udp(option_bool(options, "udp", true))),
            "reject" => Arc::new(Reject::new(name)),
            "reject-drop" => Arc::new(RejectDrop::new(name)),
            "pass" => Arc::new(Pass::new(name)),
            "compatible" => Arc::new(Compatible::new()),
            other => match self.constructors.get(other) {
                Some(constructor) => constructor(options)?,
                None => {
                    return Err(AdapterError::InvalidOptions(format!(
                        "proxy {name}: unsupported type {other}"
                    )))
                }
            },
        };
        Ok(adapter)
    }
}

impl fmt::Debug for BuiltinFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.constructors.keys().collect();
        types.sort();
        f.debug_struct("BuiltinFactory").field("types", &types).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterType;
    use serde_json::json;

    fn options(v: Value) -> ProxyOptions {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_builtin_types() {
        let factory = BuiltinFactory::new();
        let direct = factory
            .build(&options(json!({"name": "out", "type": "Direct", "udp": false})))
            .unwrap();
        assert_eq!(direct.name(), "out");
        assert_eq!(direct.adapter_type(), AdapterType::Direct);
        assert!(!direct.support_udp());

        let reject = factory.build(&options(json!({"name": "no", "type": "reject"}))).unwrap();
        assert_eq!(reject.adapter_type(), AdapterType::Reject);
    }

    #[test]
    fn test_registered_constructor() {
        let factory = BuiltinFactory::new().with_type(
            "mock",
            Box::new(|o: &ProxyOptions| {
                let adapter: Arc<dyn ProxyAdapter> = Arc::new(Reject::new(option_name(o)?));
                Ok(adapter)
            }),
        );
        let adapter = factory.build(&options(json!({"name": "m1", "type": "MOCK"}))).unwrap();
        assert_eq!(adapter.name(), "m1");
    }

    #[test]
    fn test_invalid_options() {
        let factory = BuiltinFactory::new();
        assert!(matches!(
            factory.build(&options(json!({"type": "direct"}))),
            Err(AdapterError::InvalidOptions(_))
        ));
        assert!(matches!(
            factory.build(&options(json!({"name": "x", "type": "vmess"}))),
            Err(AdapterError::InvalidOptions(_))
        ));
        assert!(factory.build(&options(json!({"name": "x"}))).is_err());
    }
}
