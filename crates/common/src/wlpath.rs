//! Wildland path grammar
//!
//! `wildland:<owner-prefix>?:<segment>(:<segment>)+:`
//!
//! The owner prefix selects whose namespace resolution starts in: empty for
//! the configured default, a `0x…` fingerprint, a configured `@alias`, or a
//! fingerprint with a bootstrap location hint (`<fpr>@https{host/path}`).
//! Each segment is an absolute path inside the current owner's forest and
//! may be a glob (`/forests/*`); a segment containing `@` matches the
//! synthetic category permutation paths. A non-empty trailing part after
//! the final separator addresses a file inside the resolved container.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::crypto::KeyFingerprint;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PathError {
    #[error("not a wildland path: {0}")]
    NotWildland(String),
    #[error("path has too few segments: {0}")]
    TooShort(String),
    #[error("invalid owner prefix: {0}")]
    BadOwner(String),
    #[error("segments must be absolute paths or globs: {0}")]
    BadSegment(String),
}

/// Whose namespace a path starts in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerPrefix {
    /// Empty prefix: the configured `@default`.
    Default,
    /// A configured alias, including `@default` / `@default-owner`.
    Alias(String),
    /// An explicit key fingerprint.
    Fingerprint(KeyFingerprint),
    /// A fingerprint with a bootstrap hint for fetching the user manifest.
    Hinted {
        fingerprint: KeyFingerprint,
        url: String,
    },
}

/// A parsed Wildland path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WildlandPath {
    pub owner: OwnerPrefix,
    pub segments: Vec<String>,
    pub file_path: Option<PathBuf>,
}

impl FromStr for WildlandPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, PathError> {
        let rest = s
            .strip_prefix("wildland:")
            .ok_or_else(|| PathError::NotWildland(s.to_string()))?;

        let parts: Vec<&str> = rest.split(':').collect();
        // owner, at least one segment, and the trailing part
        if parts.len() < 3 {
            return Err(PathError::TooShort(s.to_string()));
        }

        let owner = parse_owner(parts[0])?;

        let (segments, file_part) = parts[1..].split_at(parts.len() - 2);
        if segments.is_empty() {
            return Err(PathError::TooShort(s.to_string()));
        }
        for segment in segments {
            if !(segment.starts_with('/') || *segment == "*") {
                return Err(PathError::BadSegment(segment.to_string()));
            }
        }

        let file_path = match file_part[0] {
            "" => None,
            file if file.starts_with('/') => Some(PathBuf::from(file)),
            other => return Err(PathError::BadSegment(other.to_string())),
        };

        Ok(WildlandPath {
            owner,
            segments: segments.iter().map(|s| s.to_string()).collect(),
            file_path,
        })
    }
}

fn parse_owner(raw: &str) -> Result<OwnerPrefix, PathError> {
    if raw.is_empty() {
        return Ok(OwnerPrefix::Default);
    }
    if raw.starts_with('@') {
        if !crate::config::valid_alias(raw) {
            return Err(PathError::BadOwner(raw.to_string()));
        }
        return Ok(OwnerPrefix::Alias(raw.to_string()));
    }
    if let Some((fpr, hint)) = raw.split_once('@') {
        let fingerprint = fpr
            .parse()
            .map_err(|_| PathError::BadOwner(raw.to_string()))?;
        let url = hint
            .strip_prefix("https{")
            .and_then(|h| h.strip_suffix('}'))
            .ok_or_else(|| PathError::BadOwner(raw.to_string()))?;
        return Ok(OwnerPrefix::Hinted {
            fingerprint,
            url: format!("https://{url}"),
        });
    }
    raw.parse()
        .map(OwnerPrefix::Fingerprint)
        .map_err(|_| PathError::BadOwner(raw.to_string()))
}

impl WildlandPath {
    /// Whether the final segment addresses a file rather than a container.
    pub fn is_file(&self) -> bool {
        self.file_path.is_some()
    }
}

impl fmt::Display for WildlandPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let owner = match &self.owner {
            OwnerPrefix::Default => String::new(),
            OwnerPrefix::Alias(alias) => alias.clone(),
            OwnerPrefix::Fingerprint(fpr) => fpr.to_string(),
            OwnerPrefix::Hinted { fingerprint, url } => {
                let host = url.strip_prefix("https://").unwrap_or(url);
                format!("{fingerprint}@https{{{host}}}")
            }
        };
        write!(f, "wildland:{owner}:{}:", self.segments.join(":"))?;
        if let Some(file) = &self.file_path {
            write!(f, "{}", file.display())?;
        }
        Ok(())
    }
}

/// Match a path against a segment pattern where `*` matches any run of
/// characters (including separators).
pub fn glob_match(pattern: &str, path: &str) -> bool {
    fn inner(pattern: &[u8], path: &[u8]) -> bool {
        match (pattern.first(), path.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&pattern[1..], path) || (!path.is_empty() && inner(pattern, &path[1..]))
            }
            (Some(p), Some(c)) if p == c => inner(&pattern[1..], &path[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), path.as_bytes())
}

#[cfg(test)]
mod test {
    use super::*;

    const FPR: &str = "0x6f776e65726f776e65726f776e65726f776e65726f776e65726f776e65726f77";

    #[test]
    fn test_parse_default_owner() {
        let path: WildlandPath = "wildland::/forests/bob:/very/secret:".parse().unwrap();
        assert_eq!(path.owner, OwnerPrefix::Default);
        assert_eq!(path.segments, ["/forests/bob", "/very/secret"]);
        assert!(path.file_path.is_none());
    }

    #[test]
    fn test_parse_fingerprint_owner_and_file() {
        let path: WildlandPath = format!("wildland:{FPR}:/data/notes:/readme.md")
            .parse()
            .unwrap();
        assert_eq!(path.owner, OwnerPrefix::Fingerprint(FPR.parse().unwrap()));
        assert_eq!(path.file_path, Some(PathBuf::from("/readme.md")));
    }

    #[test]
    fn test_parse_alias_owner() {
        let path: WildlandPath = "wildland:@default:/x:".parse().unwrap();
        assert_eq!(path.owner, OwnerPrefix::Alias("@default".into()));
    }

    #[test]
    fn test_parse_hinted_owner() {
        let raw = format!("wildland:{FPR}@https{{example.com/alice.yaml}}:/x:");
        let path: WildlandPath = raw.parse().unwrap();
        match path.owner {
            OwnerPrefix::Hinted { url, .. } => {
                assert_eq!(url, "https://example.com/alice.yaml")
            }
            other => panic!("unexpected owner: {other:?}"),
        }
    }

    #[test]
    fn test_too_short_rejected() {
        assert_eq!(
            "wildland::".parse::<WildlandPath>(),
            Err(PathError::TooShort("wildland::".into()))
        );
    }

    #[test]
    fn test_round_trip_display() {
        for raw in [
            "wildland::/forests/bob:/very/secret:",
            &format!("wildland:{FPR}:/a:/b:/file.txt"),
        ] {
            let path: WildlandPath = raw.parse().unwrap();
            assert_eq!(path.to_string(), *raw);
        }
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("/forests/*", "/forests/bob"));
        assert!(glob_match("*", "/anything/at/all"));
        assert!(glob_match("/docs/@work/*", "/docs/@work/notes"));
        assert!(!glob_match("/forests/*", "/gardens/bob"));
    }
}
