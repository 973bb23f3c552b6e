//! Wire protocol constants and the `Content-Gulp` structured header codec.
//!
//! Everything chunk-level flows over a single URL path; requests are
//! disambiguated by method plus the `Content-Gulp` header, a `;`-separated
//! list of `key=value` pairs with percent-encoded values.

use axum::http::HeaderMap;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use thiserror::Error;

/// Structured header carrying chunk-level request metadata.
pub const CONTENT_GULP: &str = "Content-Gulp";

pub const KEY_SESSION: &str = "Session";
pub const KEY_CURVE: &str = "Curve";
pub const KEY_SALT: &str = "Salt";
pub const KEY_RANGE: &str = "Range";
pub const KEY_CHECKSUM: &str = "Checksum";
pub const KEY_FILENAME: &str = "Filename";

// Pair separators and the percent escape itself must never appear raw in a
// value; spaces are escaped so trimming on parse cannot eat them.
const VALUE_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b';')
    .add(b'=')
    .add(b'%')
    .add(b'"');

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed Content-Gulp pair {0:?}")]
    MalformedPair(String),
    #[error("Content-Gulp value is not valid UTF-8")]
    BadEncoding,
    #[error("Content-Gulp header is not visible ASCII")]
    BadHeader,
}

/// Parsed `Content-Gulp` fields. Unknown keys are ignored.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Gulp {
    pub session: Option<String>,
    pub curve: Option<String>,
    pub salt: Option<String>,
    pub range: Option<String>,
    pub checksum: Option<String>,
    pub filename: Option<String>,
}

impl Gulp {
    pub fn parse(value: &str) -> Result<Self, WireError> {
        let mut gulp = Gulp::default();
        for pair in value.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (key, raw) = pair
                .split_once('=')
                .ok_or_else(|| WireError::MalformedPair(pair.to_string()))?;
            let value = percent_decode_str(raw.trim())
                .decode_utf8()
                .map_err(|_| WireError::BadEncoding)?
                .trim()
                .to_string();
            match key.trim() {
                KEY_SESSION => gulp.session = Some(value),
                KEY_CURVE => gulp.curve = Some(value),
                KEY_SALT => gulp.salt = Some(value),
                KEY_RANGE => gulp.range = Some(value),
                KEY_CHECKSUM => gulp.checksum = Some(value),
                KEY_FILENAME => gulp.filename = Some(value),
                _ => {}
            }
        }
        Ok(gulp)
    }

    /// Reads and parses the header from a request or response header map.
    /// A missing header parses as the empty field set.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, WireError> {
        match headers.get(CONTENT_GULP) {
            None => Ok(Gulp::default()),
            Some(v) => Self::parse(v.to_str().map_err(|_| WireError::BadHeader)?),
        }
    }

    pub fn encode(&self) -> String {
        let mut pairs: Vec<String> = Vec::new();
        let mut push = |key: &str, value: &Option<String>| {
            if let Some(v) = value {
                pairs.push(format!("{key}={}", utf8_percent_encode(v, VALUE_ESCAPE)));
            }
        };
        push(KEY_SESSION, &self.session);
        push(KEY_CURVE, &self.curve);
        push(KEY_SALT, &self.salt);
        push(KEY_RANGE, &self.range);
        push(KEY_CHECKSUM, &self.checksum);
        push(KEY_FILENAME, &self.filename);
        pairs.join("; ")
    }

    pub fn session(mut self, v: impl Into<String>) -> Self {
        self.session = Some(v.into());
        self
    }

    pub fn curve(mut self, v: impl Into<String>) -> Self {
        self.curve = Some(v.into());
        self
    }

    pub fn salt(mut self, v: impl Into<String>) -> Self {
        self.salt = Some(v.into());
        self
    }

    pub fn range(mut self, v: impl Into<String>) -> Self {
        self.range = Some(v.into());
        self
    }

    pub fn checksum(mut self, v: impl Into<String>) -> Self {
        self.checksum = Some(v.into());
        self
    }

    pub fn filename(mut self, v: impl Into<String>) -> Self {
        self.filename = Some(v.into());
        self
    }
}

/// Formats `Content-Disposition: attachment; filename="…"`.
pub fn format_disposition(filename: &str) -> String {
    let escaped = filename.replace('\\', "\\\\").replace('"', "\\\"");
    format!("attachment; filename=\"{escaped}\"")
}

/// Extracts the `filename` parameter from a `Content-Disposition` value.
/// Accepts both quoted strings and bare tokens.
pub fn parse_disposition(value: &str) -> Option<String> {
    for part in value.split(';') {
        let part = part.trim();
        let Some(rest) = part.strip_prefix("filename=") else {
            continue;
        };
        let rest = rest.trim();
        if let Some(quoted) = rest.strip_prefix('"') {
            let mut out = String::new();
            let mut chars = quoted.chars();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(next) = chars.next() {
                            out.push(next);
                        }
                    }
                    '"' => break,
                    c => out.push(c),
                }
            }
            return Some(out);
        }
        return Some(rest.to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gulp_roundtrip() {
        let gulp = Gulp::default()
            .session("0011AABB22334455")
            .range("bytes 0-10000/25000")
            .checksum("abc_DEF-123")
            .filename("weird name;v=1.bin");
        let parsed = Gulp::parse(&gulp.encode()).unwrap();
        assert_eq!(parsed, gulp);
    }

    #[test]
    fn test_gulp_ignores_unknown_keys() {
        let parsed = Gulp::parse("Session=AB; Future=thing; Range=bytes%200-1/1").unwrap();
        assert_eq!(parsed.session.as_deref(), Some("AB"));
        assert_eq!(parsed.range.as_deref(), Some("bytes 0-1/1"));
    }

    #[test]
    fn test_gulp_rejects_bare_token() {
        assert!(Gulp::parse("Session").is_err());
    }

    #[test]
    fn test_missing_header_is_empty() {
        let headers = HeaderMap::new();
        assert_eq!(Gulp::from_headers(&headers).unwrap(), Gulp::default());
    }

    #[test]
    fn test_disposition_roundtrip() {
        let v = format_disposition("report \"final\".pdf");
        assert_eq!(parse_disposition(&v).as_deref(), Some("report \"final\".pdf"));
        assert_eq!(
            parse_disposition("attachment; filename=plain.txt").as_deref(),
            Some("plain.txt")
        );
        assert_eq!(parse_disposition("attachment"), None);
    }
}
