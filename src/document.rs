use std::collections::HashMap;
use std::fmt;

use log::warn;
use serde_json::{Map, Value};

use crate::error::DocumentError;

/// Payload pushed in place of a collector that failed to run or
/// produced garbage. The server records the failure from it.
pub const SENTINEL: &str = "{\"error\":\"EINVAL\"}\n";

/// One collected JSON value, stored compacted and newline-terminated.
///
/// The body is consumed by a single sequential traversal
/// ([`Document::read_chunk`] / [`Document::drain_body`]). The traversal
/// cannot be restarted, and once it has begun the document can no longer
/// be altered through [`Document::set_string`]. Reading fields and
/// expanding templates stay available for the whole lifetime.
#[derive(Debug)]
pub struct Document {
    raw: String,
    cursor: usize,
}

impl Document {
    /// Validates and compacts `data`.
    ///
    /// Any JSON value is accepted; field access later assumes an object.
    /// Number literals are kept as written (`1e2`, `1.50`, integers wider
    /// than 64 bits). Of duplicate object keys only the last one survives.
    pub fn new(data: &[u8]) -> Result<Self, DocumentError> {
        let value: Value = serde_json::from_slice(data)?;
        Ok(Self::from_value(&value)?)
    }

    /// The "no data" document. It is never pushed.
    pub fn empty() -> Self {
        Self {
            raw: String::new(),
            cursor: 0,
        }
    }

    /// The failure placeholder, see [`SENTINEL`].
    pub fn sentinel() -> Self {
        Self {
            raw: SENTINEL.to_string(),
            cursor: 0,
        }
    }

    fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        let mut raw = serde_json::to_string(value)?;
        // A single linefeed keeps the payload readable when the server
        // stores it as plain text.
        raw.push('\n');
        Ok(Self { raw, cursor: 0 })
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Full stored text, including the trailing newline.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Copies the next unread bytes into `buf`.
    ///
    /// Returns the number of bytes copied and whether the end of the body
    /// has been reached. Once exhausted every call returns `(0, true)`.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> (usize, bool) {
        let rest = &self.raw.as_bytes()[self.cursor..];
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        self.cursor += n;
        (n, self.cursor == self.raw.len())
    }

    /// Consumes everything not yet read, as a request body.
    pub fn drain_body(&mut self) -> Vec<u8> {
        let body = self.raw.as_bytes()[self.cursor..].to_vec();
        self.cursor = self.raw.len();
        body
    }

    fn decode_object(&self) -> Result<Map<String, Value>, DocumentError> {
        match serde_json::from_str(&self.raw)? {
            Value::Object(fields) => Ok(fields),
            _ => Err(DocumentError::Format("not a JSON object".to_string())),
        }
    }

    /// Returns the string stored under `key`.
    ///
    /// Absent keys and non-string values both yield `""`.
    ///
    /// Document: `{"fqdn":"1.2.3.4","regid":"12345"}`, key `fqdn` → `1.2.3.4`
    pub fn get_string(&self, key: &str) -> String {
        match self.decode_object() {
            Ok(fields) => fields
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            Err(e) => {
                if !self.is_empty() {
                    warn!("document: cannot look up {key}: {e}");
                }
                String::new()
            }
        }
    }

    /// Adds or replaces the string value under `key`.
    ///
    /// All other keys keep their values, types and order.
    pub fn set_string(&mut self, key: &str, value: &str) -> Result<(), DocumentError> {
        if self.cursor != 0 {
            return Err(DocumentError::State);
        }

        let mut fields = self.decode_object()?;
        fields.insert(key.to_string(), Value::String(value.to_string()));
        *self = Self::from_value(&Value::Object(fields))?;
        Ok(())
    }

    /// Expands `{name}` placeholders in `template`.
    ///
    /// Each name resolves to `overrides[name]`, else to the document's
    /// own string field, else to nothing.
    ///
    /// Document: `{"fqdn":"1.2.3.4","regid":"12345"}`
    /// Template: `http://example.com/{regid}/{fqdn}/`
    /// Result:   `http://example.com/12345/1.2.3.4/`
    ///
    /// An opening brace without a closing one ends the expansion there;
    /// the text before it is kept.
    pub fn build_string(&self, template: &str, overrides: &HashMap<&str, &str>) -> String {
        let fields = self.decode_object().unwrap_or_default();

        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        loop {
            let Some(open) = rest.find('{') else {
                out.push_str(rest);
                break;
            };
            out.push_str(&rest[..open]);

            let Some(close) = rest[open..].find('}') else {
                warn!("document: missing trailing brace: {template}");
                break;
            };
            let close = open + close;

            let name = &rest[open + 1..close];
            match overrides.get(name) {
                Some(value) => out.push_str(value),
                None => {
                    if let Some(Value::String(value)) = fields.get(name) {
                        out.push_str(value);
                    }
                }
            }

            rest = &rest[close + 1..];
        }

        out
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
