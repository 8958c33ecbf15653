//! Request body decoding.
//!
//! A request body is decoded once, eagerly, into a key/value mapping keyed by field name.
//! The raw bytes stay buffered on the request so later consumers can still read them.

use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use std::convert::Infallible;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("decode json [{body}] error: {source}")]
    Json { body: String, source: serde_json::Error },

    #[error("parse multipart form error: {source}")]
    Multipart {
        #[from]
        source: multer::Error,
    },

    #[error("parse form error: {source}")]
    UrlEncoded {
        #[from]
        source: serde_urlencoded::de::Error,
    },
}

impl DecodeError {
    pub fn json(body: &[u8], source: serde_json::Error) -> Self {
        Self::Json { body: String::from_utf8_lossy(body).into_owned(), source }
    }
}

/// A single entry of the decoded body mapping.
///
/// Text data is kept as a json value so nested documents and repeated form fields share one
/// representation; uploaded files keep their own shape.
#[derive(Debug, Clone)]
pub enum BodyValue {
    Value(Value),
    File(UploadedFile),
    Files(Vec<UploadedFile>),
}

/// Borrowed view into the decoded body, produced by [`DecodedBody::get`].
#[derive(Debug, Clone, Copy)]
pub enum BodyRef<'a> {
    Value(&'a Value),
    File(&'a UploadedFile),
    Files(&'a [UploadedFile]),
}

/// An uploaded multipart file part.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    file_name: String,
    content_type: Option<String>,
    data: Bytes,
}

impl UploadedFile {
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Writes the file into `dir`, named after the original upload name.
    pub async fn save_to(&self, dir: impl AsRef<Path>) -> io::Result<PathBuf> {
        let path = dir.as_ref().join(&self.file_name);
        tokio::fs::write(&path, &self.data).await?;
        Ok(path)
    }
}

/// The parsed key/value representation of a request body.
///
/// Built once per request and immutable afterwards. Form fields submitted once map to a scalar,
/// repeated fields map to an ordered list, multipart file parts map to file values.
#[derive(Debug, Default)]
pub struct DecodedBody {
    fields: HashMap<String, BodyValue>,
}

impl DecodedBody {
    pub fn empty() -> Self {
        Self { fields: HashMap::new() }
    }

    /// Decodes `bytes` according to `content_type`.
    ///
    /// A zero-length body short-circuits to the empty mapping without looking at the content
    /// type. Unknown or absent content types also decode to the empty mapping; only malformed
    /// payloads of a recognized type are errors.
    pub async fn decode(bytes: Bytes, content_type: Option<&str>) -> Result<Self, DecodeError> {
        if bytes.is_empty() {
            return Ok(Self::empty());
        }

        let content_type = match content_type {
            Some(value) => value,
            None => return Ok(Self::empty()),
        };

        match media_type(content_type).as_str() {
            "application/json" => Self::decode_json(&bytes),
            "application/x-www-form-urlencoded" => Self::decode_form(&bytes),
            "multipart/form-data" => Self::decode_multipart(bytes, content_type).await,
            _ => Ok(Self::empty()),
        }
    }

    fn decode_json(bytes: &Bytes) -> Result<Self, DecodeError> {
        let object = serde_json::from_slice::<serde_json::Map<String, Value>>(bytes)
            .map_err(|e| DecodeError::json(bytes, e))?;

        let fields = object.into_iter().map(|(key, value)| (key, BodyValue::Value(value))).collect();
        Ok(Self { fields })
    }

    fn decode_form(bytes: &Bytes) -> Result<Self, DecodeError> {
        let pairs = serde_urlencoded::from_bytes::<Vec<(String, String)>>(bytes)?;

        let mut buckets: Vec<(String, Vec<String>)> = Vec::new();
        for (key, value) in pairs {
            match buckets.iter_mut().find(|(k, _)| *k == key) {
                Some((_, values)) => values.push(value),
                None => buckets.push((key, vec![value])),
            }
        }

        let fields = buckets.into_iter().map(|(key, values)| (key, BodyValue::Value(collapse(values)))).collect();
        Ok(Self { fields })
    }

    async fn decode_multipart(bytes: Bytes, content_type: &str) -> Result<Self, DecodeError> {
        let boundary = multer::parse_boundary(content_type)?;
        let stream = futures::stream::once(async move { Ok::<Bytes, Infallible>(bytes) });
        let mut multipart = multer::Multipart::new(stream, boundary);

        let mut texts: Vec<(String, Vec<String>)> = Vec::new();
        let mut files: Vec<(String, Vec<UploadedFile>)> = Vec::new();

        while let Some(field) = multipart.next_field().await? {
            let name = match field.name() {
                Some(name) => name.to_owned(),
                None => continue,
            };

            if let Some(file_name) = field.file_name().map(str::to_owned) {
                let content_type = field.content_type().map(|m| m.to_string());
                let data = field.bytes().await?;
                let file = UploadedFile { file_name, content_type, data };
                match files.iter_mut().find(|(k, _)| *k == name) {
                    Some((_, entries)) => entries.push(file),
                    None => files.push((name, vec![file])),
                }
            } else {
                let text = field.text().await?;
                match texts.iter_mut().find(|(k, _)| *k == name) {
                    Some((_, values)) => values.push(text),
                    None => texts.push((name, vec![text])),
                }
            }
        }

        let mut fields = HashMap::new();
        for (key, values) in texts {
            fields.insert(key, BodyValue::Value(collapse(values)));
        }
        for (key, mut entries) in files {
            let value = if entries.len() == 1 { BodyValue::File(entries.remove(0)) } else { BodyValue::Files(entries) };
            fields.insert(key, value);
        }

        Ok(Self { fields })
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &BodyValue)> {
        self.fields.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Resolves a dot-separated key against the decoded mapping.
    ///
    /// At each mapping segment the exact key is tried first, then the `key[]` variant used by
    /// html array naming. List segments that parse as integers index into the list; an index
    /// out of range, or any other shape at an intermediate segment, resolves to nothing.
    pub fn get(&self, key: &str) -> Option<BodyRef<'_>> {
        let mut segments = key.split('.');
        let first = segments.next()?;

        let entry = self
            .fields
            .get(first)
            .or_else(|| self.fields.get(&format!("{first}[]")))?;

        let mut rest = segments.peekable();
        match entry {
            BodyValue::Value(value) => traverse(value, rest).map(BodyRef::Value),
            BodyValue::File(file) => {
                if rest.peek().is_none() {
                    Some(BodyRef::File(file))
                } else {
                    None
                }
            }
            BodyValue::Files(files) => match rest.next() {
                None => Some(BodyRef::Files(files)),
                Some(segment) => {
                    if rest.peek().is_some() {
                        return None;
                    }
                    let index = segment.parse::<usize>().ok()?;
                    files.get(index).map(BodyRef::File)
                }
            },
        }
    }
}

fn traverse<'a, 'k>(mut value: &'a Value, segments: impl Iterator<Item = &'k str>) -> Option<&'a Value> {
    for segment in segments {
        match value {
            Value::Object(map) => {
                value = map.get(segment).or_else(|| map.get(&format!("{segment}[]")))?;
            }
            Value::Array(items) => {
                let index = segment.parse::<usize>().ok()?;
                value = items.get(index)?;
            }
            _ => return None,
        }
    }

    Some(value)
}

/// Single submission stays scalar, repeated submissions become an ordered list.
fn collapse(mut values: Vec<String>) -> Value {
    if values.len() == 1 {
        Value::String(values.remove(0))
    } else {
        Value::Array(values.into_iter().map(Value::String).collect())
    }
}

/// Strips parameters and case from a content-type header value.
pub(crate) fn media_type(content_type: &str) -> String {
    content_type.split(';').next().unwrap_or("").trim().to_ascii_lowercase()
}
