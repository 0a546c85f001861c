//! Manifest envelope framing
//!
//! A persisted manifest is two-part UTF-8 text: a signature header and a
//! YAML body, separated by `---` on its own line:
//!
//! ```text
//! signature: |
//!   0x<fpr>:<base64>
//! ---
//! object: container
//! ...
//! ```
//!
//! The header is deliberately *not* parsed with a YAML library: it is a tiny
//! ASCII subset (simple `field: "value"` fields and two-space-indented
//! `field: |` blocks) so that the body bytes covered by the signature can be
//! carved out without ever interpreting them.

use std::collections::HashMap;

use crate::crypto::Signature;

use super::ManifestError;

pub const HEADER_SEPARATOR: &[u8] = b"\n---\n";
pub const HEADER_SEPARATOR_EMPTY: &[u8] = b"---\n";

/// Split manifest bytes into header bytes and body bytes.
///
/// A manifest that starts with `---\n` has an empty header (an unsigned
/// manifest, acceptable only from trusted storages).
pub fn split_header(data: &[u8]) -> Result<(&[u8], &[u8]), ManifestError> {
    if data.starts_with(HEADER_SEPARATOR_EMPTY) {
        return Ok((&[], &data[HEADER_SEPARATOR_EMPTY.len()..]));
    }
    let pos = data
        .windows(HEADER_SEPARATOR.len())
        .position(|window| window == HEADER_SEPARATOR)
        .ok_or_else(|| ManifestError::Parse("separator not found in manifest".into()))?;
    Ok((&data[..pos], &data[pos + HEADER_SEPARATOR.len()..]))
}

/// Manifest header: the (optional) detached signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub signature: Option<Signature>,
}

impl Header {
    pub fn new(signature: Option<Signature>) -> Self {
        Header { signature }
    }

    /// Parse header bytes. Empty bytes mean an unsigned manifest.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ManifestError> {
        if data.is_empty() {
            return Ok(Header { signature: None });
        }
        let mut parser = HeaderParser::new(data)?;
        let fields = parser.parse(&["signature", "pubkey"])?;
        if fields.contains_key("pubkey") {
            tracing::warn!("deprecated pubkey field found in header, ignoring");
        }
        let signature = fields
            .get("signature")
            .map(|raw| raw.parse())
            .transpose()
            .map_err(|e| ManifestError::Parse(format!("bad signature field: {e}")))?;
        Ok(Header { signature })
    }

    /// Serialize the header. The signature value is written as a block field
    /// so multi-line signatures stay parseable.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut lines = Vec::new();
        if let Some(signature) = &self.signature {
            lines.push("signature: |".to_string());
            for sig_line in signature.to_string().lines() {
                lines.push(format!("  {sig_line}"));
            }
        }
        lines.join("\n").into_bytes()
    }
}

/// Parser for the header's YAML subset.
struct HeaderParser {
    lines: Vec<String>,
    pos: usize,
}

impl HeaderParser {
    fn new(data: &[u8]) -> Result<Self, ManifestError> {
        if !data.is_ascii() {
            return Err(ManifestError::Parse("header should be ASCII".into()));
        }
        let text = std::str::from_utf8(data)
            .map_err(|_| ManifestError::Parse("header should be ASCII".into()))?;
        Ok(HeaderParser {
            lines: text.lines().map(str::to_string).collect(),
            pos: 0,
        })
    }

    /// Parse the whole header, recognizing only the given fields.
    fn parse(&mut self, fields: &[&str]) -> Result<HashMap<String, String>, ManifestError> {
        let mut result = HashMap::new();
        while self.pos < self.lines.len() {
            let (name, value) = self.parse_field()?;
            if !fields.contains(&name.as_str()) {
                return Err(ManifestError::Parse(format!("unexpected field: {name:?}")));
            }
            if result.contains_key(&name) {
                return Err(ManifestError::Parse(format!("duplicate field: {name:?}")));
            }
            result.insert(name, value);
        }
        Ok(result)
    }

    fn parse_field(&mut self) -> Result<(String, String), ManifestError> {
        let line = self.lines[self.pos].clone();
        self.pos += 1;

        // field: "simple value"
        if let Some((name, rest)) = line.split_once(": ") {
            if name.chars().all(|c| c.is_ascii_lowercase()) {
                if let Some(value) = rest
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .filter(|v| {
                        v.chars()
                            .all(|c| c.is_ascii_alphanumeric() || " _.-".contains(c))
                    })
                {
                    return Ok((name.to_string(), value.to_string()));
                }
                // field: |
                if rest == "|" {
                    return Ok((name.to_string(), self.parse_block()?));
                }
            }
        }
        Err(ManifestError::Parse(format!("unexpected line: {line:?}")))
    }

    /// Parse a block continuation: lines indented by two spaces, or blank.
    fn parse_block(&mut self) -> Result<String, ManifestError> {
        let mut parsed = Vec::new();
        while self.pos < self.lines.len() {
            let line = &self.lines[self.pos];
            if line.trim().is_empty() && line.len() <= 2 {
                parsed.push(String::new());
            } else if let Some(content) = line.strip_prefix("  ") {
                parsed.push(content.to_string());
            } else {
                break;
            }
            self.pos += 1;
        }
        while parsed.last().is_some_and(|l| l.is_empty()) {
            parsed.pop();
        }
        if parsed.is_empty() {
            return Err(ManifestError::Parse("block literal cannot be empty".into()));
        }
        Ok(parsed.join("\n"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_split_header() {
        let data = b"signature: |\n  0xab:c2ln\n---\nobject: user\n";
        let (header, body) = split_header(data).unwrap();
        assert_eq!(header, b"signature: |\n  0xab:c2ln");
        assert_eq!(body, b"object: user\n");
    }

    #[test]
    fn test_split_empty_header() {
        let (header, body) = split_header(b"---\nobject: user\n").unwrap();
        assert!(header.is_empty());
        assert_eq!(body, b"object: user\n");
    }

    #[test]
    fn test_split_without_separator() {
        assert!(split_header(b"object: user\n").is_err());
    }

    #[test]
    fn test_header_round_trip() {
        let header = Header::from_bytes(b"signature: |\n  0xab12:c2lnbmF0dXJl").unwrap();
        let signature = header.signature.clone().unwrap();
        assert_eq!(signature.signer.as_str(), "0xab12");
        assert_eq!(signature.value, "c2lnbmF0dXJl");

        let reparsed = Header::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(reparsed, header);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(Header::from_bytes(b"evil: \"x\"").is_err());
    }

    #[test]
    fn test_duplicate_field_rejected() {
        assert!(Header::from_bytes(b"signature: |\n  0xab:x\nsignature: |\n  0xab:y").is_err());
    }

    #[test]
    fn test_non_ascii_header_rejected() {
        assert!(Header::from_bytes("signature: \"żółć\"".as_bytes()).is_err());
    }
}
