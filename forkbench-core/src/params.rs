//! Benchmark Parameters
//!
//! A [`Combination`] is one point of a benchmark's parameter space. Fixtures
//! see it, together with passthrough properties and the environment, through
//! [`Params`].

use crate::fixture::FixtureError;
use forkbench_ipc::ParamValue;
use std::fmt;
use std::str::FromStr;

/// A declared parameter axis, e.g. `byte.size = ["1048576", "4194304"]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamDef {
    /// Parameter name
    pub name: &'static str,
    /// Values in declaration order
    pub values: &'static [&'static str],
}

/// One (parameter values × thread count) point
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Combination {
    /// `(name, value)` pairs in axis order
    pub params: Vec<(String, String)>,
    /// Worker threads invoking the benchmark
    pub threads: u32,
}

impl Combination {
    /// Build a combination
    pub fn new(params: Vec<(String, String)>, threads: u32) -> Self {
        Self { params, threads }
    }

    /// `name=value` labels joined by commas; empty without parameters
    pub fn label(&self) -> String {
        self.params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Value of one parameter
    pub fn get(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Wire form of the parameter values
    pub fn to_param_values(&self) -> Vec<ParamValue> {
        self.params
            .iter()
            .map(|(k, v)| ParamValue::new(k, v))
            .collect()
    }
}

impl fmt::Display for Combination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = self.label();
        if label.is_empty() {
            write!(f, "threads={}", self.threads)
        } else {
            write!(f, "{label},threads={}", self.threads)
        }
    }
}

/// Read-only parameter lookup handed to fixture setup.
///
/// Lookup order: combination values, then `-D` properties, then the
/// environment variable `NAME`, then `NAME` uppercased with dots replaced by
/// underscores (`byte.size` → `BYTE_SIZE`).
#[derive(Debug, Clone, Default)]
pub struct Params {
    values: Vec<(String, String)>,
    properties: Vec<(String, String)>,
}

impl Params {
    /// No values, no properties (environment lookups still apply)
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the combination values and properties of a fork
    pub fn from_wire(values: &[ParamValue], properties: &[ParamValue]) -> Self {
        let pairs = |list: &[ParamValue]| {
            list.iter()
                .map(|p| (p.name.clone(), p.value.clone()))
                .collect::<Vec<_>>()
        };
        Self {
            values: pairs(values),
            properties: pairs(properties),
        }
    }

    /// Add a combination value
    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.push((name.into(), value.into()));
        self
    }

    /// Add a passthrough property
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push((name.into(), value.into()));
        self
    }

    /// Raw value of `key`
    pub fn get(&self, key: &str) -> Option<String> {
        let lookup = |list: &[(String, String)]| {
            list.iter()
                .rev()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        };
        lookup(&self.values)
            .or_else(|| lookup(&self.properties))
            .or_else(|| std::env::var(key).ok())
            .or_else(|| std::env::var(env_name(key)).ok())
    }

    /// Parse `key`, or fall back to `default` when it is absent
    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T, FixtureError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e| FixtureError::InvalidParam {
                    name: key.to_string(),
                    value: raw.clone(),
                    message: format!("{e}"),
                }),
            None => Ok(default),
        }
    }

    /// Parse `key`, failing when it is absent
    pub fn require<T>(&self, key: &str) -> Result<T, FixtureError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let raw = self
            .get(key)
            .ok_or_else(|| FixtureError::MissingParam(key.to_string()))?;
        raw.trim().parse().map_err(|e| FixtureError::InvalidParam {
            name: key.to_string(),
            value: raw.clone(),
            message: format!("{e}"),
        })
    }

    /// Combination values, in axis order
    pub fn values(&self) -> &[(String, String)] {
        &self.values
    }
}

fn env_name(key: &str) -> String {
    key.replace('.', "_").to_uppercase()
}
