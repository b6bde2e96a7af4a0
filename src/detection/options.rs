use std::collections::BTreeMap;

use serde_json::Value;

use crate::config::parse_color;
use crate::error::OptionError;
use crate::models::Color;

/// Algorithm-specific options as handed over by the caller.
///
/// Values are JSON so that numbers, colors (`[r, g, b]` or `"r,g,b"`) and
/// nested range objects can share one map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectorOptions {
    values: BTreeMap<String, Value>,
}

impl DetectorOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Parse a `key=value` pair from the command line. The value is read as
    /// JSON when possible and kept as a string otherwise.
    pub fn insert_pair(&mut self, pair: &str) -> Result<(), OptionError> {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| OptionError::invalid(pair, "expected key=value"))?;
        let value = serde_json::from_str(raw.trim())
            .unwrap_or_else(|_| Value::String(raw.trim().to_string()));
        self.values.insert(key.trim().to_string(), value);
        Ok(())
    }

    pub fn get_f64(&self, key: &str) -> Result<Option<f64>, OptionError> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value_as_f64(value).map(Some).ok_or_else(|| {
                OptionError::invalid(key, format!("expected a number, got {value}"))
            }),
        }
    }

    pub fn require_f64(&self, key: &str) -> Result<f64, OptionError> {
        self.get_f64(key)?.ok_or_else(|| OptionError::Missing(key.to_string()))
    }

    pub fn get_u32(&self, key: &str) -> Result<Option<u32>, OptionError> {
        match self.get_f64(key)? {
            None => Ok(None),
            Some(v) if v >= 0.0 && v.fract() == 0.0 && v <= u32::MAX as f64 => Ok(Some(v as u32)),
            Some(v) => Err(OptionError::invalid(
                key,
                format!("expected a non-negative integer, got {v}"),
            )),
        }
    }

    pub fn get_str(&self, key: &str) -> Result<Option<&str>, OptionError> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(value) => Err(OptionError::invalid(key, format!("expected text, got {value}"))),
        }
    }

    pub fn get_color(&self, key: &str) -> Result<Option<Color>, OptionError> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value_as_color(value).map(Some).ok_or_else(|| {
                OptionError::invalid(key, format!("expected an r,g,b color, got {value}"))
            }),
        }
    }

    pub fn require_color(&self, key: &str) -> Result<Color, OptionError> {
        self.get_color(key)?.ok_or_else(|| OptionError::Missing(key.to_string()))
    }

    /// A `[[r,g,b],[r,g,b]]` pair of colors.
    pub fn get_color_pair(&self, key: &str) -> Result<Option<(Color, Color)>, OptionError> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Array(items)) if items.len() == 2 => {
                let low = value_as_color(&items[0]);
                let high = value_as_color(&items[1]);
                match (low, high) {
                    (Some(low), Some(high)) => Ok(Some((low, high))),
                    _ => Err(OptionError::invalid(key, "expected two r,g,b colors")),
                }
            }
            Some(_) => Err(OptionError::invalid(key, "expected two r,g,b colors")),
        }
    }

    /// Nested object of numbers, e.g. `lab_ranges`.
    pub fn get_number_map(&self, key: &str) -> Result<Option<BTreeMap<String, f64>>, OptionError> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| {
                    value_as_f64(v)
                        .map(|n| (k.clone(), n))
                        .ok_or_else(|| OptionError::invalid(key, format!("'{k}' is not a number")))
                })
                .collect::<Result<_, _>>()
                .map(Some),
            Some(value) => {
                Err(OptionError::invalid(key, format!("expected an object, got {value}")))
            }
        }
    }

    /// Flattened `name -> text` view for persisting alongside run settings.
    pub fn to_string_pairs(&self) -> Vec<(String, String)> {
        self.values
            .iter()
            .map(|(k, v)| {
                let text = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), text)
            })
            .collect()
    }
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn value_as_color(value: &Value) -> Option<Color> {
    match value {
        Value::String(s) => parse_color(s),
        Value::Array(items) if items.len() == 3 => {
            let mut channels = [0u8; 3];
            for (slot, item) in channels.iter_mut().zip(items) {
                let n = item.as_u64()?;
                *slot = u8::try_from(n).ok()?;
            }
            Some(Color::new(channels[0], channels[1], channels[2]))
        }
        _ => None,
    }
}
