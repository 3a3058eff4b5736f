//! Request (R) data model — spec §3.

use rustc_hash::FxHashMap;
use serde_json::Value;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
        }
    }

    pub fn parse(s: &str) -> Option<Method> {
        match s {
            "GET" => Some(Method::Get),
            "HEAD" => Some(Method::Head),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "PATCH" => Some(Method::Patch),
            "DELETE" => Some(Method::Delete),
            "OPTIONS" => Some(Method::Options),
            _ => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Manual impl rather than `#[derive(Deserialize)]`: lets `HandlerDescriptorDto`
/// accept the same uppercase method names the wire protocol and `Method::parse`
/// already use, instead of serde's default enum-variant-name matching.
impl<'de> serde::Deserialize<'de> for Method {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Method::parse(&raw.to_uppercase())
            .ok_or_else(|| serde::de::Error::custom(format!("unknown HTTP method: {raw}")))
    }
}

/// Case-insensitive header map preserving insertion order of first-seen
/// names; later writes of the same name overwrite the value like a plain
/// HTTP header bag would for the fields this engine cares about.
#[derive(Clone, Debug, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            existing.1 = value;
        } else {
            self.entries.push((name, value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Ordered multi-map for query parameters: repeated keys keep every value
/// in arrival order.
#[derive(Clone, Debug, Default)]
pub struct QueryParams {
    entries: Vec<(String, String)>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// First value for `key`, or `None` if absent. An empty string counts
    /// as absent per spec §4.4 ("present" only if non-empty).
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, v)| k == key && !v.is_empty())
            .map(|(_, v)| v.as_str())
    }

    pub fn get_raw(&self, key: &str) -> Option<&str> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn all(&self, key: &str) -> Vec<&str> {
        self.entries.iter().filter(|(k, _)| k == key).map(|(_, v)| v.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn parse(raw_query: &str) -> Self {
        let mut q = QueryParams::new();
        for (k, v) in url::form_urlencoded::parse(raw_query.as_bytes()) {
            q.push(k.into_owned(), v.into_owned());
        }
        q
    }
}

/// An uploaded file part from a multipart body.
#[derive(Clone, Debug)]
pub struct FileField {
    pub name: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

/// The decoded body of a request, per spec §3.
#[derive(Clone, Debug)]
pub enum Body {
    Null,
    Scalar(Value),
    Object(Value),
    Array(Value),
    Raw(Vec<u8>),
}

impl Body {
    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Null) || matches!(self, Body::Raw(b) if b.is_empty())
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Body::Scalar(v) | Body::Object(v) | Body::Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn from_value(v: Value) -> Body {
        match &v {
            Value::Null => Body::Null,
            Value::Object(_) => Body::Object(v),
            Value::Array(_) => Body::Array(v),
            _ => Body::Scalar(v),
        }
    }
}

/// Request (R): constructed per incoming HTTP request, mutated only by the
/// body parser and the middleware chain.
#[derive(Clone, Debug)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub path: String,
    pub headers: Headers,
    pub path_params: FxHashMap<String, String>,
    pub query: QueryParams,
    pub body: Body,
    pub files: Vec<FileField>,
    raw_body: Vec<u8>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        let url = url.into();
        let path = url.split('?').next().unwrap_or("").to_string();
        let query = match url.split_once('?') {
            Some((_, q)) => QueryParams::parse(q),
            None => QueryParams::new(),
        };
        Request {
            method,
            url,
            path,
            headers: Headers::new(),
            path_params: FxHashMap::default(),
            query,
            body: Body::Null,
            files: Vec::new(),
            raw_body: Vec::new(),
        }
    }

    pub fn with_raw_body(mut self, raw: Vec<u8>) -> Self {
        self.raw_body = raw;
        self
    }

    pub fn raw_body(&self) -> &[u8] {
        &self.raw_body
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }

    pub fn has_body(&self) -> bool {
        !self.body.is_empty() || !self.raw_body.is_empty()
    }
}
