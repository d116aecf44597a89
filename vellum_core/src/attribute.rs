//! Attribute bag and canonical string forms of typed attribute values.
//!
//! Every attribute value on a node is a string. Typed values are converted
//! on write through [`ToAttribute`] and parsed on read through
//! [`FromAttribute`]. Floats are formatted with a fixed number of decimal
//! digits chosen per [`FloatFamily`]; two nodes compare float attributes by
//! re-parsing the canonical string, so the formatting is deterministic and
//! idempotent.

use crate::hash::Checksum;
use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Decimal digits kept for contrast values (min/max intensity, gamma).
pub const CONTRAST_PRECISION: usize = 3;

/// Decimal digits kept for thresholds (cutoffs, tolerances).
pub const THRESHOLD_PRECISION: usize = 2;

/// Family of float attributes sharing one canonical precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatFamily {
    Contrast,
    Threshold,
}

impl FloatFamily {
    /// Number of decimal digits kept for this family.
    pub const fn precision(self) -> usize {
        match self {
            FloatFamily::Contrast => CONTRAST_PRECISION,
            FloatFamily::Threshold => THRESHOLD_PRECISION,
        }
    }

    /// Canonical string form of `value` in this family.
    pub fn format(self, value: f64) -> String {
        format_float(value, self.precision())
    }
}

/// Format a float with exactly `precision` decimal digits.
///
/// Negative zero is written as zero so that `-0.0001` and `0.0001` have the
/// same canonical form at 3 digits.
pub fn format_float(value: f64, precision: usize) -> String {
    let formatted = format!("{:.*}", precision, value);
    match formatted.strip_prefix('-') {
        Some(rest) if rest.chars().all(|c| c == '0' || c == '.') => rest.to_string(),
        _ => formatted,
    }
}

/// Re-canonicalize a string holding a float to `precision` digits.
///
/// Returns `None` when the string is not a number.
pub fn round_str(value: &str, precision: usize) -> Option<String> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .map(|v| format_float(v, precision))
}

/// Conversion of a typed value into its canonical attribute string.
pub trait ToAttribute {
    fn to_attribute(&self) -> String;
}

impl ToAttribute for str {
    fn to_attribute(&self) -> String {
        self.to_string()
    }
}

impl ToAttribute for String {
    fn to_attribute(&self) -> String {
        self.clone()
    }
}

impl<T: ToAttribute + ?Sized> ToAttribute for &T {
    fn to_attribute(&self) -> String {
        (**self).to_attribute()
    }
}

impl ToAttribute for bool {
    fn to_attribute(&self) -> String {
        let text = if *self { "true" } else { "false" };
        text.to_string()
    }
}

macro_rules! integer_attribute {
    ($($t:ty),*) => {
        $(
            impl ToAttribute for $t {
                fn to_attribute(&self) -> String {
                    self.to_string()
                }
            }

            impl FromAttribute for $t {
                fn from_attribute(value: &str) -> Option<Self> {
                    value.trim().parse().ok()
                }
            }
        )*
    };
}

integer_attribute!(i32, i64, u32, u64, usize);

impl ToAttribute for f64 {
    /// Plain floats use the contrast precision.
    fn to_attribute(&self) -> String {
        FloatFamily::Contrast.format(*self)
    }
}

impl ToAttribute for f32 {
    fn to_attribute(&self) -> String {
        FloatFamily::Contrast.format(f64::from(*self))
    }
}

impl ToAttribute for Checksum {
    fn to_attribute(&self) -> String {
        self.to_hex()
    }
}

impl ToAttribute for DateTime<Utc> {
    fn to_attribute(&self) -> String {
        self.to_rfc3339()
    }
}

/// Parsing of an attribute string into a typed value.
pub trait FromAttribute: Sized {
    fn from_attribute(value: &str) -> Option<Self>;
}

impl FromAttribute for String {
    fn from_attribute(value: &str) -> Option<Self> {
        Some(value.to_string())
    }
}

impl FromAttribute for bool {
    fn from_attribute(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        }
    }
}

impl FromAttribute for f64 {
    fn from_attribute(value: &str) -> Option<Self> {
        value.trim().parse().ok()
    }
}

impl FromAttribute for DateTime<Utc> {
    fn from_attribute(value: &str) -> Option<Self> {
        DateTime::parse_from_rfc3339(value.trim())
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Insertion-ordered mapping of attribute names to string values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes(Vec<(String, String)>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the value of an attribute.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Set an attribute, returning true if the stored value changed.
    pub fn set(&mut self, name: &str, value: String) -> bool {
        match self.0.iter_mut().find(|(key, _)| key == name) {
            Some((_, existing)) if *existing == value => false,
            Some((_, existing)) => {
                *existing = value;
                true
            }
            None => {
                self.0.push((name.to_string(), value));
                true
            }
        }
    }

    /// Remove an attribute, returning its previous value.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let index = self.0.iter().position(|(key, _)| key == name)?;
        Some(self.0.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut attributes = Attributes::new();
        for (key, value) in iter {
            attributes.set(&key.into(), value.into());
        }
        attributes
    }
}

impl Serialize for Attributes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Attributes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(AttributesVisitor)
    }
}

struct AttributesVisitor;

impl<'de> Visitor<'de> for AttributesVisitor {
    type Value = Attributes;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of attribute names to values")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut attributes = Attributes::new();
        while let Some((key, value)) = access.next_entry::<String, serde_json::Value>()? {
            let value = match value {
                serde_json::Value::String(s) => s,
                other => {
                    // Older documents stored typed values; keep them as strings.
                    let coerced = match &other {
                        serde_json::Value::Bool(b) => b.to_attribute(),
                        serde_json::Value::Null => String::new(),
                        _ => other.to_string(),
                    };
                    tracing::warn!(
                        attribute = %key,
                        value = %other,
                        "coercing non-string attribute value to {:?}",
                        coerced
                    );
                    coerced
                }
            };
            attributes.set(&key, value);
        }
        Ok(attributes)
    }
}
