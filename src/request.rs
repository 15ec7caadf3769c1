use std::collections::BTreeMap;

use serde::Serialize;

/// Value type for a request keyword.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RequestValue {
    Str(String),
    StrList(Vec<String>),
    FloatList(Vec<f64>),
}

impl From<&str> for RequestValue {
    fn from(value: &str) -> Self {
        RequestValue::Str(value.to_string())
    }
}

impl From<String> for RequestValue {
    fn from(value: String) -> Self {
        RequestValue::Str(value)
    }
}

impl From<Vec<String>> for RequestValue {
    fn from(value: Vec<String>) -> Self {
        RequestValue::StrList(value)
    }
}

impl From<&[String]> for RequestValue {
    fn from(value: &[String]) -> Self {
        RequestValue::StrList(value.to_vec())
    }
}

impl From<Vec<&str>> for RequestValue {
    fn from(value: Vec<&str>) -> Self {
        RequestValue::StrList(value.into_iter().map(|s| s.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for RequestValue {
    fn from(value: [&str; N]) -> Self {
        RequestValue::StrList(value.into_iter().map(|s| s.to_string()).collect())
    }
}

impl<const N: usize> From<[f64; N]> for RequestValue {
    fn from(value: [f64; N]) -> Self {
        RequestValue::FloatList(value.to_vec())
    }
}

impl RequestValue {
    pub fn as_strings(&self) -> Vec<String> {
        match self {
            RequestValue::Str(s) => vec![s.clone()],
            RequestValue::StrList(xs) => xs.clone(),
            RequestValue::FloatList(xs) => xs.iter().map(|x| x.to_string()).collect(),
        }
    }
}

/// Keyword/value request body sent to the archive.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Request {
    inner: BTreeMap<String, RequestValue>,
}

impl Request {
    pub fn new() -> Self {
        Self {
            inner: BTreeMap::new(),
        }
    }

    /// Insert a keyword/value pair (value can be a scalar or list).
    pub fn kw(mut self, key: impl Into<String>, value: impl Into<RequestValue>) -> Self {
        self.inner.insert(key.into(), value.into());
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<RequestValue>) {
        self.inner.insert(key.into(), value.into());
    }

    pub fn product_type(self, v: impl Into<RequestValue>) -> Self {
        self.kw("product_type", v)
    }

    pub fn format(self, v: impl Into<RequestValue>) -> Self {
        self.kw("format", v)
    }

    pub fn variable(self, v: impl Into<RequestValue>) -> Self {
        self.kw("variable", v)
    }

    pub fn pressure_level(self, v: impl Into<RequestValue>) -> Self {
        self.kw("pressure_level", v)
    }

    pub fn year(self, v: impl Into<RequestValue>) -> Self {
        self.kw("year", v)
    }

    pub fn month(self, v: impl Into<RequestValue>) -> Self {
        self.kw("month", v)
    }

    pub fn day(self, v: impl Into<RequestValue>) -> Self {
        self.kw("day", v)
    }

    pub fn time(self, v: impl Into<RequestValue>) -> Self {
        self.kw("time", v)
    }

    pub fn area(self, v: impl Into<RequestValue>) -> Self {
        self.kw("area", v)
    }

    pub fn get(&self, key: &str) -> Option<&RequestValue> {
        self.inner.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RequestValue)> {
        self.inner.iter()
    }

    pub fn into_inner(self) -> BTreeMap<String, RequestValue> {
        self.inner
    }
}
