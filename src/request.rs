//! Inbound request access and input resolution.
//!
//! [`Request`] owns everything extracted from one inbound HTTP request: head fields, bound path
//! parameters, parsed query pairs, cookies, the buffered body bytes and the decoded body mapping.
//! The `input` family resolves a key against the decoded body first, then the query string, then
//! the path parameters; misses produce the caller's default instead of an error.

use crate::body::{BodyRef, BodyValue, DecodeError, DecodedBody, UploadedFile};
use bytes::Bytes;
use http::header::{CONTENT_TYPE, COOKIE, HOST};
use http::request::Parts;
use http::{HeaderMap, Method, Uri, Version};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Path parameters bound by the underlying router for the matched pattern.
///
/// Values are copied out of the router's borrowed match so the request can outlive the lookup.
#[derive(Debug, Clone, Default)]
pub struct PathParams {
    items: Vec<(String, String)>,
}

impl PathParams {
    pub fn empty() -> Self {
        Self { items: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn get(&self, key: impl AsRef<str>) -> Option<&str> {
        let key = key.as_ref();
        self.items.iter().find(|(name, _)| name == key).map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items.iter().map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

impl From<matchit::Params<'_, '_>> for PathParams {
    fn from(params: matchit::Params) -> Self {
        Self { items: params.iter().map(|(name, value)| (name.to_owned(), value.to_owned())).collect() }
    }
}

#[cfg(test)]
impl From<Vec<(&str, &str)>> for PathParams {
    fn from(items: Vec<(&str, &str)>) -> Self {
        Self { items: items.into_iter().map(|(name, value)| (name.to_owned(), value.to_owned())).collect() }
    }
}

/// One inbound HTTP request, fully buffered and decoded.
#[derive(Debug)]
pub struct Request {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    remote_addr: Option<SocketAddr>,
    secure: bool,
    params: PathParams,
    query: Vec<(String, String)>,
    cookies: Vec<(String, String)>,
    body: Bytes,
    decoded: DecodedBody,
}

impl Request {
    pub(crate) fn new(
        parts: Parts,
        params: PathParams,
        remote_addr: Option<SocketAddr>,
        secure: bool,
        body: Bytes,
        decoded: DecodedBody,
    ) -> Self {
        let query = parts
            .uri
            .query()
            .and_then(|raw| serde_urlencoded::from_str::<Vec<(String, String)>>(raw).ok())
            .unwrap_or_default();
        let cookies = parse_cookies(&parts.headers);

        Self {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            remote_addr,
            secure,
            params,
            query,
            cookies,
            body,
            decoded,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Path plus query string, as sent in the request line.
    pub fn url(&self) -> String {
        self.uri.path_and_query().map(|pq| pq.to_string()).unwrap_or_else(|| self.uri.path().to_owned())
    }

    /// Absolute URL derived from the TLS flag and the host; empty when no host is known.
    pub fn full_url(&self) -> String {
        let host = self.host();
        if host.is_empty() {
            return String::new();
        }

        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}{}", scheme, host, self.url())
    }

    pub fn host(&self) -> &str {
        self.headers
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .or_else(|| self.uri.authority().map(|a| a.as_str()))
            .unwrap_or("")
    }

    pub fn ip(&self) -> String {
        self.remote_addr.map(|addr| addr.ip().to_string()).unwrap_or_default()
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, key: &str) -> String {
        self.header_or(key, "")
    }

    pub fn header_or(&self, key: &str, default: &str) -> String {
        match self.headers.get(key).and_then(|value| value.to_str().ok()) {
            Some(value) if !value.is_empty() => value.to_owned(),
            _ => default.to_owned(),
        }
    }

    pub fn cookie(&self, key: &str) -> String {
        self.cookie_or(key, "")
    }

    pub fn cookie_or(&self, key: &str, default: &str) -> String {
        self.cookies
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.clone())
            .unwrap_or_else(|| default.to_owned())
    }

    /// The buffered body bytes, re-readable any number of times.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn decoded_body(&self) -> &DecodedBody {
        &self.decoded
    }

    pub fn params(&self) -> &PathParams {
        &self.params
    }

    // -- input resolution: decoded body, then query, then route parameters --

    pub fn input(&self, key: &str) -> String {
        self.input_or(key, "")
    }

    pub fn input_or(&self, key: &str, default: &str) -> String {
        if let Some(found) = self.decoded.get(key) {
            return match found {
                BodyRef::Value(value) => value_to_string(value),
                // a file resolves to the empty string and still wins over the fallbacks
                BodyRef::File(_) | BodyRef::Files(_) => String::new(),
            };
        }

        let from_query = self.query(key);
        if !from_query.is_empty() {
            return from_query;
        }

        match self.params.get(key) {
            Some(value) if !value.is_empty() => value.to_owned(),
            _ => default.to_owned(),
        }
    }

    pub fn input_i64(&self, key: &str, default: i64) -> i64 {
        let value = self.input(key);
        if value.is_empty() {
            return default;
        }
        value.parse().unwrap_or(0)
    }

    pub fn input_bool(&self, key: &str, default: bool) -> bool {
        let value = self.input(key);
        if value.is_empty() {
            return default;
        }
        string_to_bool(&value)
    }

    /// Casts the decoded-body value directly, skipping the query/route fallback.
    pub fn input_array(&self, key: &str) -> Vec<String> {
        self.input_array_or(key, Vec::new())
    }

    pub fn input_array_or(&self, key: &str, default: Vec<String>) -> Vec<String> {
        match self.decoded.get(key) {
            Some(BodyRef::Value(Value::Array(items))) => items.iter().map(scalar_form).collect(),
            Some(BodyRef::Value(Value::Null)) | None => default,
            Some(BodyRef::Value(value)) => vec![value_to_string(value)],
            Some(BodyRef::File(_)) | Some(BodyRef::Files(_)) => default,
        }
    }

    /// Casts the decoded-body value directly, skipping the query/route fallback.
    pub fn input_map(&self, key: &str) -> HashMap<String, String> {
        self.input_map_or(key, HashMap::new())
    }

    pub fn input_map_or(&self, key: &str, default: HashMap<String, String>) -> HashMap<String, String> {
        match self.decoded.get(key) {
            Some(BodyRef::Value(Value::Object(map))) => {
                map.iter().map(|(k, v)| (k.clone(), scalar_form(v))).collect()
            }
            _ => default,
        }
    }

    // -- query accessors --

    pub fn query(&self, key: &str) -> String {
        self.query_or(key, "")
    }

    pub fn query_or(&self, key: &str, default: &str) -> String {
        self.query
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.clone())
            .unwrap_or_else(|| default.to_owned())
    }

    pub fn query_i64(&self, key: &str, default: i64) -> i64 {
        let value = self.query(key);
        if value.is_empty() {
            return default;
        }
        value.parse().unwrap_or(0)
    }

    pub fn query_bool(&self, key: &str, default: bool) -> bool {
        let value = self.query(key);
        if value.is_empty() {
            return default;
        }
        string_to_bool(&value)
    }

    pub fn query_array(&self, key: &str) -> Vec<String> {
        self.query
            .iter()
            .filter(|(name, _)| name == key)
            .map(|(_, value)| value.clone())
            .collect()
    }

    /// Collects `key[sub]=value` pairs into a map keyed by `sub`.
    pub fn query_map(&self, key: &str) -> HashMap<String, String> {
        let prefix = format!("{key}[");
        let mut map: HashMap<String, String> = HashMap::new();

        for (name, value) in &self.query {
            let Some(rest) = name.strip_prefix(&prefix) else { continue };
            let Some(sub) = rest.strip_suffix(']') else { continue };
            map.entry(sub.to_owned())
                .and_modify(|existing| {
                    existing.push(',');
                    existing.push_str(value);
                })
                .or_insert_with(|| value.clone());
        }

        map
    }

    /// Every query parameter, repeated values joined with commas.
    pub fn queries(&self) -> HashMap<String, String> {
        let mut map: HashMap<String, String> = HashMap::new();
        for (name, value) in &self.query {
            map.entry(name.clone())
                .and_modify(|existing| {
                    existing.push(',');
                    existing.push_str(value);
                })
                .or_insert_with(|| value.clone());
        }
        map
    }

    // -- route parameter accessors --

    pub fn route(&self, key: &str) -> String {
        self.params.get(key).unwrap_or("").to_owned()
    }

    pub fn route_i64(&self, key: &str) -> i64 {
        self.route(key).parse().unwrap_or(0)
    }

    // -- uploaded files --

    pub fn file(&self, name: &str) -> Option<&UploadedFile> {
        match self.decoded.get(name)? {
            BodyRef::File(file) => Some(file),
            BodyRef::Files(files) => files.first(),
            BodyRef::Value(_) => None,
        }
    }

    pub fn files(&self, name: &str) -> Vec<&UploadedFile> {
        match self.decoded.get(name) {
            Some(BodyRef::File(file)) => vec![file],
            Some(BodyRef::Files(files)) => files.iter().collect(),
            _ => Vec::new(),
        }
    }

    // -- typed binds --

    /// Deserializes the buffered body, picking the format from the content type.
    pub fn bind_json<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        let content_type = self
            .headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(crate::body::media_type)
            .unwrap_or_default();

        match content_type.as_str() {
            "application/x-www-form-urlencoded" => Ok(serde_urlencoded::from_bytes(&self.body)?),
            _ => serde_json::from_slice(&self.body).map_err(|e| DecodeError::json(&self.body, e)),
        }
    }

    /// Deserializes the query string into a typed value.
    pub fn bind_query<T: DeserializeOwned>(&self) -> Result<T, serde_qs::Error> {
        serde_qs::from_str(self.uri.query().unwrap_or(""))
    }

    /// Merged view over path parameters, query parameters and the decoded body,
    /// later sources winning on key collisions.
    pub fn all(&self) -> serde_json::Map<String, Value> {
        let mut data = serde_json::Map::new();

        for (name, value) in self.params.iter() {
            data.insert(name.to_owned(), Value::String(value.to_owned()));
        }
        for (name, value) in self.queries() {
            data.insert(name, Value::String(value));
        }
        for (name, value) in self.decoded.fields() {
            let value = match value {
                BodyValue::Value(value) => value.clone(),
                BodyValue::File(file) => Value::String(file.file_name().to_owned()),
                BodyValue::Files(files) => {
                    Value::Array(files.iter().map(|f| Value::String(f.file_name().to_owned())).collect())
                }
            };
            data.insert(name.to_owned(), value);
        }

        data
    }
}

fn parse_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut cookies = Vec::new();
    for header in headers.get_all(COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for pair in raw.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            let Some(name) = parts.next() else { continue };
            if name.is_empty() {
                continue;
            }
            let value = parts.next().unwrap_or("").trim();
            cookies.push((name.trim().to_owned(), value.to_owned()));
        }
    }
    cookies
}

pub(crate) fn string_to_bool(value: &str) -> bool {
    matches!(value, "1" | "true" | "on" | "yes")
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items.iter().map(scalar_form).collect::<Vec<_>>().join(","),
        Value::Object(_) => serde_json::to_string(value).unwrap_or_default(),
    }
}

fn scalar_form(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(_) | Value::Array(_) => serde_json::to_string(value).unwrap_or_default(),
        other => value_to_string(other),
    }
}
