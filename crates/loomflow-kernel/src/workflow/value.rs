//! Workflow payload values
//!
//! Every node consumes and produces a [`WorkflowValue`]. Nodes that want a
//! concrete Rust type go through [`WorkflowValue::decode`] instead of
//! reaching into maps by hand.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Dynamically typed payload passed between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum WorkflowValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<WorkflowValue>),
    Map(HashMap<String, WorkflowValue>),
}

impl WorkflowValue {
    pub fn is_null(&self) -> bool {
        matches!(self, WorkflowValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            WorkflowValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            WorkflowValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            WorkflowValue::Float(f) => Some(*f),
            WorkflowValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            WorkflowValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[WorkflowValue]> {
        match self {
            WorkflowValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&HashMap<String, WorkflowValue>> {
        match self {
            WorkflowValue::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Look up a key when the value is a map.
    pub fn get(&self, key: &str) -> Option<&WorkflowValue> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Build a map value from `(key, value)` pairs.
    pub fn map<K, V, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<WorkflowValue>,
    {
        WorkflowValue::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Convert into a `serde_json::Value`.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Decode the payload into a concrete type.
    ///
    /// ```rust
    /// use loomflow_kernel::workflow::WorkflowValue;
    /// #[derive(serde::Deserialize)]
    /// struct Count { n: i64 }
    ///
    /// let v = WorkflowValue::map([("n", 5i64)]);
    /// assert_eq!(v.decode::<Count>().unwrap().n, 5);
    /// ```
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.to_json())
    }

    /// Encode any serializable value as a payload.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(WorkflowValue::from)
    }

    /// Short human readable rendering used in log lines and prompts.
    pub fn render(&self) -> String {
        match self {
            WorkflowValue::String(s) => s.clone(),
            WorkflowValue::Null => String::new(),
            other => other.to_json().to_string(),
        }
    }
}

impl From<bool> for WorkflowValue {
    fn from(v: bool) -> Self {
        WorkflowValue::Bool(v)
    }
}

impl From<i64> for WorkflowValue {
    fn from(v: i64) -> Self {
        WorkflowValue::Int(v)
    }
}

impl From<i32> for WorkflowValue {
    fn from(v: i32) -> Self {
        WorkflowValue::Int(v as i64)
    }
}

impl From<usize> for WorkflowValue {
    fn from(v: usize) -> Self {
        WorkflowValue::Int(v as i64)
    }
}

impl From<f64> for WorkflowValue {
    fn from(v: f64) -> Self {
        WorkflowValue::Float(v)
    }
}

impl From<String> for WorkflowValue {
    fn from(v: String) -> Self {
        WorkflowValue::String(v)
    }
}

impl From<&str> for WorkflowValue {
    fn from(v: &str) -> Self {
        WorkflowValue::String(v.to_string())
    }
}

impl<T: Into<WorkflowValue>> From<Vec<T>> for WorkflowValue {
    fn from(v: Vec<T>) -> Self {
        WorkflowValue::List(v.into_iter().map(Into::into).collect())
    }
}

impl From<serde_json::Value> for WorkflowValue {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => WorkflowValue::Null,
            serde_json::Value::Bool(b) => WorkflowValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => WorkflowValue::Int(i),
                None => WorkflowValue::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => WorkflowValue::String(s),
            serde_json::Value::Array(items) => {
                WorkflowValue::List(items.into_iter().map(WorkflowValue::from).collect())
            }
            serde_json::Value::Object(obj) => WorkflowValue::Map(
                obj.into_iter()
                    .map(|(k, v)| (k, WorkflowValue::from(v)))
                    .collect(),
            ),
        }
    }
}
