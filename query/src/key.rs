use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The identity of a query: an ordered list of JSON values.
///
/// Two keys that are structurally equal produce the same hash, whatever the
/// insertion order of the object fields they contain.
#[derive(Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct QueryKey(Vec<Value>);

/// Builds a [`QueryKey`] from a list of expressions convertible to JSON.
///
/// ```
/// use fibre_query::query_key;
/// let key = query_key!["todos", { "page": 1, "done": false }];
/// assert_eq!(key.len(), 2);
/// ```
#[macro_export]
macro_rules! query_key {
  () => {
    $crate::QueryKey::new()
  };
  ($($part:tt),+ $(,)?) => {
    $crate::QueryKey::from_values(vec![$($crate::__serde_json::json!($part)),+])
  };
}

impl QueryKey {
  pub fn new() -> Self {
    Self(Vec::new())
  }

  pub fn from_values(values: Vec<Value>) -> Self {
    Self(values)
  }

  /// Appends a part, builder style.
  pub fn with(mut self, part: impl Into<Value>) -> Self {
    self.0.push(part.into());
    self
  }

  pub fn parts(&self) -> &[Value] {
    &self.0
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// The canonical serialization used as the cache identity.
  pub fn hash_key(&self) -> String {
    let mut out = String::with_capacity(16 * self.0.len() + 2);
    out.push('[');
    for (i, part) in self.0.iter().enumerate() {
      if i > 0 {
        out.push(',');
      }
      write_canonical(part, &mut out);
    }
    out.push(']');
    out
  }

  /// Returns true when `filter` partially matches this key: every element of
  /// the filter deep-partially equals the element at the same position.
  pub fn partial_matches(&self, filter: &QueryKey) -> bool {
    filter.0.len() <= self.0.len()
      && filter
        .0
        .iter()
        .zip(self.0.iter())
        .all(|(b, a)| partial_deep_equal(a, b))
  }
}

fn write_canonical(value: &Value, out: &mut String) {
  match value {
    Value::Object(map) => {
      let mut entries: Vec<(&String, &Value)> = map.iter().collect();
      entries.sort_by(|a, b| a.0.cmp(b.0));
      out.push('{');
      for (i, (key, value)) in entries.into_iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        out.push_str(&Value::String(key.clone()).to_string());
        out.push(':');
        write_canonical(value, out);
      }
      out.push('}');
    }
    Value::Array(items) => {
      out.push('[');
      for (i, item) in items.iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        write_canonical(item, out);
      }
      out.push(']');
    }
    scalar => out.push_str(&scalar.to_string()),
  }
}

/// `b` partially equals `a` when every field of `b` is present in `a` and
/// partially equal there; arrays compare as element-wise prefixes.
pub(crate) fn partial_deep_equal(a: &Value, b: &Value) -> bool {
  match (a, b) {
    (Value::Object(a), Value::Object(b)) => b
      .iter()
      .all(|(key, bv)| a.get(key).is_some_and(|av| partial_deep_equal(av, bv))),
    (Value::Array(a), Value::Array(b)) => {
      b.len() <= a.len() && b.iter().zip(a.iter()).all(|(bv, av)| partial_deep_equal(av, bv))
    }
    _ => a == b,
  }
}

impl fmt::Debug for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "QueryKey({})", self.hash_key())
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.hash_key())
  }
}

impl From<&str> for QueryKey {
  fn from(part: &str) -> Self {
    Self(vec![Value::from(part)])
  }
}

impl From<String> for QueryKey {
  fn from(part: String) -> Self {
    Self(vec![Value::from(part)])
  }
}

impl From<Vec<Value>> for QueryKey {
  fn from(values: Vec<Value>) -> Self {
    Self(values)
  }
}

impl From<Value> for QueryKey {
  fn from(value: Value) -> Self {
    match value {
      Value::Array(values) => Self(values),
      other => Self(vec![other]),
    }
  }
}

impl From<&QueryKey> for QueryKey {
  fn from(key: &QueryKey) -> Self {
    key.clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn object_field_order_does_not_change_the_hash() {
    let a = QueryKey::from(json!(["todos", { "page": 1, "status": "done" }]));
    let b = QueryKey::from(json!(["todos", { "status": "done", "page": 1 }]));
    assert_eq!(a.hash_key(), b.hash_key());
    assert_eq!(a.hash_key(), r#"["todos",{"page":1,"status":"done"}]"#);
  }

  #[test]
  fn nested_objects_are_sorted_too() {
    let a = crate::query_key!["a", { "z": { "y": 1, "x": [2, { "b": 1, "a": 0 }] } }];
    assert_eq!(a.hash_key(), r#"["a",{"z":{"x":[2,{"a":0,"b":1}],"y":1}}]"#);
  }

  #[test]
  fn prefix_and_partial_object_matching() {
    let key = crate::query_key!["todos", { "page": 1, "status": "done" }, 7];
    assert!(key.partial_matches(&crate::query_key!["todos"]));
    assert!(key.partial_matches(&crate::query_key!["todos", { "status": "done" }]));
    assert!(!key.partial_matches(&crate::query_key!["todos", { "status": "open" }]));
    assert!(!key.partial_matches(&crate::query_key!["todos", { "owner": "me" }]));
    assert!(!key.partial_matches(&crate::query_key!["posts"]));
    assert!(key.partial_matches(&QueryKey::new()));
  }

  #[test]
  fn arrays_match_as_prefixes() {
    let key = QueryKey::from(json!([[1, 2, 3]]));
    assert!(key.partial_matches(&QueryKey::from(json!([[1, 2]]))));
    assert!(!key.partial_matches(&QueryKey::from(json!([[2]]))));
  }
}
