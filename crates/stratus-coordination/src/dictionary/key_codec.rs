//! Mapping between dictionary keys and store path segments
//!
//! Segments are percent-encoded so that any key maps to exactly one valid
//! store name and back. On top of plain URL encoding a segment never
//! contains the separator, never starts with `_` (names starting with `_`
//! are reserved for index and data objects), and is never `.` or `..`.

use stratus_common::{DictionaryConfig, Result, StratusError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCodec {
    separator: String,
    max_path_len: usize,
}

impl KeyCodec {
    pub fn new(separator: impl Into<String>, max_path_len: usize) -> Self {
        Self {
            separator: separator.into(),
            max_path_len,
        }
    }

    pub fn from_config(config: &DictionaryConfig) -> Self {
        Self::new(config.separator.clone(), config.max_key_path_len)
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Encode one key segment.
    pub fn encode_segment(&self, segment: &str) -> Result<String> {
        if segment.is_empty() {
            return Err(StratusError::invalid_key(segment, "empty key segment"));
        }

        if segment.chars().all(|c| c == '.') {
            return Ok("%2E".repeat(segment.len()));
        }

        let mut encoded = String::with_capacity(segment.len());
        let mut buf = [0u8; 4];
        for c in segment.chars() {
            if self.separator.contains(c) {
                encoded.push_str(&escape(c));
            } else {
                encoded.push_str(&urlencoding::encode(c.encode_utf8(&mut buf)));
            }
        }
        if let Some(rest) = encoded.strip_prefix('_') {
            encoded = format!("%5F{}", rest);
        }
        Ok(encoded)
    }

    /// Inverse of [`encode_segment`](Self::encode_segment).
    ///
    /// Names this codec could not have produced are rejected, so foreign
    /// objects next to a dictionary's entries never decode to a key.
    pub fn decode_segment(&self, encoded: &str) -> Result<String> {
        let decoded = urlencoding::decode(encoded)
            .map_err(|e| StratusError::invalid_key(encoded, format!("not UTF-8 once decoded: {}", e)))?;
        if decoded.is_empty() || self.encode_segment(&decoded)? != encoded {
            return Err(StratusError::invalid_key(encoded, "not an encoded key segment"));
        }
        Ok(decoded.into_owned())
    }

    /// Split a key into its sub-dictionary segments and its entry name.
    ///
    /// `"a/b/c"` gives `(["a", "b"], Some("c"))`; a key ending in the
    /// separator names a sub-dictionary and gives no entry name.
    pub fn split<'k>(&self, key: &'k str) -> Result<(Vec<&'k str>, Option<&'k str>)> {
        if key.is_empty() {
            return Err(StratusError::invalid_key(key, "empty key"));
        }
        let separator = self.separator.as_str();
        let (parents, leaf) = match key.strip_suffix(separator) {
            Some(prefix) => (Some(prefix), None),
            None => match key.rfind(separator) {
                Some(pos) => (Some(&key[..pos]), Some(&key[pos + separator.len()..])),
                None => (None, Some(key)),
            },
        };

        let segments: Vec<&str> = parents
            .map(|p| p.split(separator).collect())
            .unwrap_or_default();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(StratusError::invalid_key(key, "empty key segment"));
        }
        Ok((segments, leaf))
    }

    /// Fails when `path` is longer than the store accepts.
    pub fn check_path(&self, key: &str, path: &str) -> Result<()> {
        if path.len() > self.max_path_len {
            return Err(StratusError::invalid_key(
                key,
                format!(
                    "store path is {} bytes, limit is {}",
                    path.len(),
                    self.max_path_len
                ),
            ));
        }
        Ok(())
    }

    /// Whether a listed child name is reserved for dictionary bookkeeping
    pub fn is_reserved(name: &str) -> bool {
        name.starts_with('_')
    }
}

fn escape(c: char) -> String {
    let mut buf = [0u8; 4];
    c.encode_utf8(&mut buf)
        .bytes()
        .map(|b| format!("%{:02X}", b))
        .collect()
}
