//! Shape signatures: cheap structural digests of result payloads.
//!
//! A shape signature records which top-level sections a payload has, how
//! many entries each holds, and whether value-range invariants hold
//! (correlation coefficients in [-1, 1], p-values in [0, 1], no non-finite
//! values). It lets preflight checks reject outputs that are present but
//! semantically empty without inspecting their meaning.
//!
//! The signature is a pure function of the payload. Sections live in a
//! `BTreeMap` and violations are sorted, so key order in the payload never
//! changes the digest.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;

use crate::hashing::hash_value;

/// Section name used when the payload is JSON but not an object.
pub const ROOT_SECTION: &str = "_root";
/// Section name used when the payload is not JSON.
pub const BYTES_SECTION: &str = "_bytes";

const NON_FINITE_MARKERS: [&str; 6] = ["NaN", "nan", "Infinity", "-Infinity", "inf", "-inf"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeSignature {
    pub digest: String,
    /// Top-level section name -> number of entries
    pub sections: BTreeMap<String, usize>,
    /// Count of non-finite markers anywhere in the payload
    pub non_finite: usize,
    /// JSON pointers of values outside their allowed range
    pub range_violations: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Bound {
    Correlation,
    Probability,
}

impl Bound {
    fn classify(key: &str) -> Option<Bound> {
        let key = key.to_lowercase();
        let tokens: Vec<&str> = key
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();

        let correlation = tokens.iter().any(|t| {
            matches!(
                *t,
                "r" | "rho" | "corr" | "correlation" | "correlations" | "pearson" | "spearman"
                    | "kendall"
            )
        });
        if correlation {
            return Some(Bound::Correlation);
        }
        let probability = tokens == ["p"]
            || tokens.contains(&"pvalue")
            || tokens.windows(2).any(|w| w == ["p", "value"]);
        probability.then_some(Bound::Probability)
    }

    fn allows(&self, n: f64) -> bool {
        match self {
            Bound::Correlation => (-1.0..=1.0).contains(&n),
            Bound::Probability => (0.0..=1.0).contains(&n),
        }
    }
}

#[derive(Default)]
struct Walk {
    non_finite: usize,
    violations: Vec<String>,
}

impl Walk {
    fn visit(&mut self, value: &Value, pointer: &str, bound: Option<Bound>) {
        match value {
            Value::Number(n) => {
                if let (Some(b), Some(f)) = (bound, n.as_f64())
                    && !b.allows(f)
                {
                    self.violations.push(pointer.to_string());
                }
            }
            Value::String(s) => {
                if NON_FINITE_MARKERS.contains(&s.as_str()) {
                    self.non_finite += 1;
                }
            }
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    self.visit(item, &format!("{pointer}/{i}"), bound);
                }
            }
            Value::Object(map) => {
                for (key, item) in map {
                    let child = format!("{pointer}/{}", escape_pointer(key));
                    self.visit(item, &child, Bound::classify(key).or(bound));
                }
            }
            Value::Null | Value::Bool(_) => {}
        }
    }
}

fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

fn entry_count(value: &Value) -> usize {
    match value {
        Value::Null => 0,
        Value::String(s) => usize::from(!s.is_empty()),
        Value::Bool(_) | Value::Number(_) => 1,
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
    }
}

impl ShapeSignature {
    /// Compute the signature of a payload.
    pub fn compute(bytes: &[u8]) -> Self {
        let mut sections = BTreeMap::new();
        let mut walk = Walk::default();

        match serde_json::from_slice::<Value>(bytes) {
            Ok(Value::Object(map)) => {
                for (key, value) in &map {
                    sections.insert(key.clone(), entry_count(value));
                    walk.visit(
                        value,
                        &format!("/{}", escape_pointer(key)),
                        Bound::classify(key),
                    );
                }
            }
            Ok(other) => {
                sections.insert(ROOT_SECTION.to_string(), entry_count(&other));
                walk.visit(&other, "", None);
            }
            Err(_) => {
                sections.insert(BYTES_SECTION.to_string(), bytes.len());
            }
        }

        walk.violations.sort();
        let digest = hash_value(&json!({
            "sections": sections,
            "non_finite": walk.non_finite,
            "range_violations": walk.violations,
        }));

        Self {
            digest,
            sections,
            non_finite: walk.non_finite,
            range_violations: walk.violations,
        }
    }

    /// No section holds any entries.
    pub fn is_empty(&self) -> bool {
        self.sections.values().all(|n| *n == 0)
    }

    /// No non-finite values and no range violations.
    pub fn is_well_formed(&self) -> bool {
        self.non_finite == 0 && self.range_violations.is_empty()
    }

    pub fn section_len(&self, name: &str) -> Option<usize> {
        self.sections.get(name).copied()
    }

    /// Required sections that are absent or empty.
    pub fn missing_sections(&self, required: &[String]) -> Vec<String> {
        required
            .iter()
            .filter(|name| self.section_len(name).unwrap_or(0) == 0)
            .cloned()
            .collect()
    }
}
