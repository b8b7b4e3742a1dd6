use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Immutable parameter set of a task instance.
///
/// Parameters are supplied once when the task is registered and can only be
/// read afterwards. Values are stored as JSON so that they survive the trip
/// into a [`Plan`](crate::Plan) and the audit trail unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(BTreeMap<String, Value>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parameter, replacing an earlier value under the same key.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get_raw(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Deserializes the parameter `key` into `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<T> {
        let value = self
            .get_raw(key)
            .ok_or_else(|| anyhow::anyhow!("Missing parameter '{key}'"))?;

        serde_json::from_value(value.clone())
            .map_err(|err| anyhow::anyhow!("Parameter '{key}' has an unexpected shape: {err}"))
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get_raw(key).and_then(Value::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Params
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_access() {
        let params = Params::new().with("threads", 4).with("label", "sample");

        assert_eq!(params.get::<u32>("threads").unwrap(), 4);
        assert_eq!(params.get_str("label"), Some("sample"));
        assert_eq!(params.get_raw("threads"), Some(&Value::from(4)));
        assert_eq!(params.get_raw("missing"), None);
        assert!(params.get::<u32>("label").is_err());
        assert!(params.get::<u32>("missing").is_err());
    }

    #[test]
    fn test_last_value_wins() {
        let params: Params = [("a", 1), ("a", 2)].into_iter().collect();
        assert_eq!(params.len(), 1);
        assert_eq!(params.get::<i32>("a").unwrap(), 2);
    }
}
