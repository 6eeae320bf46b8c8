//! # Fetch Description
//!
//! The immutable, serializable description of one logical fetch. Its JSON form
//! is the replay wire format:
//!
//! ```json
//! {"url": "...", "action": "GET", "payload": "<base64>", "header": {"k": "v"}, "key": "k1"}
//! ```
//!
//! `key` is the cache slot identity and is distinct from the URL. Decoding
//! accepts unknown fields, a `null` payload or header, and a payload written as
//! a JSON array of bytes.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

pub const DEFAULT_METHOD: &str = "GET";

/// Description of a single fetch
///
/// Built with [`FetchDescription::new`] and the consuming `with_*` methods;
/// read-only afterwards.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchDescription {
    url: String,
    #[serde(rename = "action")]
    method: String,
    #[serde(default, with = "payload_encoding")]
    payload: Vec<u8>,
    #[serde(rename = "header", default, deserialize_with = "null_as_empty")]
    headers: BTreeMap<String, String>,
    key: String,
}

impl FetchDescription {
    /// Describe a `GET` of `url` cached under `key`
    pub fn new(key: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: DEFAULT_METHOD.to_string(),
            payload: Vec::new(),
            headers: BTreeMap::new(),
            key: key.into(),
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.headers
            .extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

// Payloads can be large or binary, keep them out of logs
impl fmt::Debug for FetchDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchDescription")
            .field("key", &self.key)
            .field("method", &self.method)
            .field("url", &self.url)
            .field("headers", &self.headers.len())
            .field("payload_bytes", &self.payload.len())
            .finish()
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<BTreeMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}

mod payload_encoding {
    use super::*;
    use serde::de::Error as _;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Encoded {
        Base64(String),
        Bytes(Vec<u8>),
    }

    pub fn serialize<S>(payload: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Encoded>::deserialize(deserializer)? {
            None => Ok(Vec::new()),
            Some(Encoded::Base64(text)) => STANDARD
                .decode(text.as_bytes())
                .map_err(|e| D::Error::custom(format!("payload is not valid base64: {e}"))),
            Some(Encoded::Bytes(bytes)) => Ok(bytes),
        }
    }
}
