//! A JSON container with a path-selector API, grounded in
//! `examples/original_source/mod_md/md_json.h`'s `md_jsel` selector
//! vocabulary (get/set/clear/del at a key path, dedicated typed
//! accessors, compact/indented serialization, HTTP-body parsing).

use serde_json::{Map, Value};

use crate::error::{AcmeMdError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Compact,
    Indent,
}

/// A dotted path into a JSON tree, e.g. `Path::new(["ca", "account"])`.
#[derive(Debug, Clone)]
pub struct Path(Vec<String>);

impl Path {
    #[must_use]
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn single(segment: &str) -> Self {
        Self(vec![segment.to_string()])
    }
}

#[derive(Debug, Clone, Default)]
pub struct Json(Value);

impl Json {
    #[must_use]
    pub fn new() -> Self {
        Self(Value::Object(Map::new()))
    }

    #[must_use]
    pub fn from_value(value: Value) -> Self {
        Self(value)
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(data)?;
        Ok(Self(value))
    }

    /// Parses the body of an HTTP response, but only if it is a 2xx
    /// status that declares `application/json`.
    pub fn from_http_response(status: u16, content_type: Option<&str>, body: &[u8]) -> Result<Self> {
        if !(200..300).contains(&status) {
            return Err(AcmeMdError::General(format!(
                "cannot parse JSON from non-2xx response (status {status})"
            )));
        }
        let is_json = content_type
            .map(|ct| ct.split(';').next().unwrap_or("").trim() == "application/json")
            .unwrap_or(false);
        if !is_json {
            return Err(AcmeMdError::General(
                "response did not declare application/json".to_string(),
            ));
        }
        Self::parse(body)
    }

    fn get_mut_creating(&mut self, path: &Path) -> &mut Value {
        let mut cursor = &mut self.0;
        for segment in &path.0 {
            if !cursor.is_object() {
                *cursor = Value::Object(Map::new());
            }
            let map = cursor.as_object_mut().expect("just coerced to object");
            cursor = map.entry(segment.clone()).or_insert(Value::Null);
        }
        cursor
    }

    fn get(&self, path: &Path) -> Option<&Value> {
        let mut cursor = &self.0;
        for segment in &path.0 {
            cursor = cursor.as_object()?.get(segment)?;
        }
        Some(cursor)
    }

    pub fn set(&mut self, path: &Path, value: Value) {
        *self.get_mut_creating(path) = value;
    }

    #[must_use]
    pub fn get_raw(&self, path: &Path) -> Option<&Value> {
        self.get(path)
    }

    #[must_use]
    pub fn get_bool(&self, path: &Path) -> Option<bool> {
        self.get(path)?.as_bool()
    }

    pub fn set_bool(&mut self, path: &Path, value: bool) {
        self.set(path, Value::Bool(value));
    }

    #[must_use]
    pub fn get_number(&self, path: &Path) -> Option<f64> {
        self.get(path)?.as_f64()
    }

    pub fn set_number(&mut self, path: &Path, value: f64) {
        self.set(path, serde_json::json!(value));
    }

    #[must_use]
    pub fn get_string(&self, path: &Path) -> Option<String> {
        self.get(path)?.as_str().map(str::to_string)
    }

    pub fn set_string(&mut self, path: &Path, value: &str) {
        self.set(path, Value::String(value.to_string()));
    }

    #[must_use]
    pub fn get_string_array(&self, path: &Path) -> Vec<String> {
        self.get(path)
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_string_array(&mut self, path: &Path, values: &[String]) {
        let arr = values.iter().cloned().map(Value::String).collect();
        self.set(path, Value::Array(arr));
    }

    #[must_use]
    pub fn get_string_dict(&self, path: &Path) -> std::collections::BTreeMap<String, String> {
        self.get(path)
            .and_then(Value::as_object)
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_string_dict(&mut self, path: &Path, dict: &std::collections::BTreeMap<String, String>) {
        let mut map = Map::new();
        for (k, v) in dict {
            map.insert(k.clone(), Value::String(v.clone()));
        }
        self.set(path, Value::Object(map));
    }

    /// Clears the value at `path` to an empty object, without removing
    /// the key itself.
    pub fn clear(&mut self, path: &Path) {
        self.set(path, Value::Object(Map::new()));
    }

    /// Deletes the key at `path` entirely.
    pub fn delete(&mut self, path: &Path) {
        if path.0.is_empty() {
            return;
        }
        let (last, parents) = path.0.split_last().expect("non-empty checked above");
        let mut cursor = &mut self.0;
        for segment in parents {
            let Some(map) = cursor.as_object_mut() else {
                return;
            };
            let Some(next) = map.get_mut(segment) else {
                return;
            };
            cursor = next;
        }
        if let Some(map) = cursor.as_object_mut() {
            map.remove(last);
        }
    }

    #[must_use]
    pub fn write(&self, format: Format) -> String {
        match format {
            Format::Compact => serde_json::to_string(&self.0).unwrap_or_default(),
            Format::Indent => serde_json::to_string_pretty(&self.0).unwrap_or_default(),
        }
    }

    pub fn to_typed<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.0.clone())?)
    }

    pub fn from_typed<T: serde::Serialize>(value: &T) -> Result<Self> {
        Ok(Self(serde_json::to_value(value)?))
    }
}
