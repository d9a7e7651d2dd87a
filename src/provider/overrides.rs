//! Per-provider overrides of proxy options
//!
//! A proxy provider may rewrite the option maps of its proxies before they are
//! built: prefix or suffix the name, force UDP on or off, pin the outgoing
//! interface, and so on. The overridable fields form a fixed table of
//! `(field, apply)` pairs; adding a field means adding one row.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Option bag of one proxy
pub type ProxyOptions = Map<String, Value>;

/// Fields a provider may override
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct OverrideSchema {
    pub additional_prefix: Option<String>,
    pub additional_suffix: Option<String>,
    pub udp: Option<bool>,
    pub tfo: Option<bool>,
    pub mptcp: Option<bool>,
    pub skip_cert_verify: Option<bool>,
    pub interface_name: Option<String>,
    pub routing_mark: Option<u32>,
    pub ip_version: Option<String>,
    pub dialer_proxy: Option<String>,
    pub up: Option<String>,
    pub down: Option<String>,
}

type ApplyFn = fn(&OverrideSchema, &mut ProxyOptions);

fn set_bool(options: &mut ProxyOptions, key: &str, value: Option<bool>) {
    if let Some(v) = value {
        options.insert(key.to_string(), Value::Bool(v));
    }
}

fn set_string(options: &mut ProxyOptions, key: &str, value: Option<&String>) {
    if let Some(v) = value {
        options.insert(key.to_string(), Value::String(v.clone()));
    }
}

fn rename(options: &mut ProxyOptions, f: impl FnOnce(&str) -> String) {
    if let Some(Value::String(name)) = options.get("name") {
        let renamed = f(name);
        options.insert("name".to_string(), Value::String(renamed));
    }
}

const FIELDS: &[(&str, ApplyFn)] = &[
    ("additional-prefix", |o, m| {
        if let Some(prefix) = &o.additional_prefix {
            rename(m, |name| format!("{prefix}{name}"));
        }
    }),
    ("additional-suffix", |o, m| {
        if let Some(suffix) = &o.additional_suffix {
            rename(m, |name| format!("{name}{suffix}"));
        }
    }),
    ("udp", |o, m| set_bool(m, "udp", o.udp)),
    ("tfo", |o, m| set_bool(m, "tfo", o.tfo)),
    ("mptcp", |o, m| set_bool(m, "mptcp", o.mptcp)),
    ("skip-cert-verify", |o, m| set_bool(m, "skip-cert-verify", o.skip_cert_verify)),
    ("interface-name", |o, m| set_string(m, "interface-name", o.interface_name.as_ref())),
    ("routing-mark", |o, m| {
        if let Some(mark) = o.routing_mark {
            m.insert("routing-mark".to_string(), Value::from(mark));
        }
    }),
    ("ip-version", |o, m| set_string(m, "ip-version", o.ip_version.as_ref())),
    ("dialer-proxy", |o, m| set_string(m, "dialer-proxy", o.dialer_proxy.as_ref())),
    ("up", |o, m| set_string(m, "up", o.up.as_ref())),
    ("down", |o, m| set_string(m, "down", o.down.as_ref())),
];

impl OverrideSchema {
    /// Apply every set field to `options`
    pub fn apply(&self, options: &mut ProxyOptions) {
        for (_, apply) in FIELDS {
            apply(self, options);
        }
    }

    /// Names of the overridable fields
    #[must_use]
    pub fn field_names() -> Vec<&'static str> {
        FIELDS.iter().map(|(name, _)| *name).collect()
    }

    /// Whether no field is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
