//! `Cookie` request header parsing.
//!
//! The header is a `;`-separated list of `name=value` pairs. Each segment is
//! classified on its own; segments that are not a valid pair are skipped and
//! kept in [`Cookies::malformed`] so callers can log them. Parsing never
//! fails as a whole.

use std::collections::HashMap;

/// Cookies sent with a request. Names are unique; the last occurrence wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cookies {
    values: HashMap<String, String>,
    malformed: Vec<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Empty,
    Pair(&'a str, &'a str),
    Malformed(&'a str),
}

impl Cookies {
    /// Parses one `Cookie` header value.
    pub fn parse(header: &str) -> Self {
        let mut cookies = Self::default();
        cookies.extend_from_header(header);
        cookies
    }

    /// Parses every `Cookie` header value, in order, into one jar.
    pub fn from_headers<'a>(values: impl IntoIterator<Item = &'a str>) -> Self {
        let mut cookies = Self::default();
        for value in values {
            cookies.extend_from_header(value);
        }
        cookies
    }

    fn extend_from_header(&mut self, header: &str) {
        for raw in header.split(';') {
            match classify(raw) {
                Segment::Empty => {}
                Segment::Pair(name, value) => {
                    self.values.insert(name.to_string(), value.to_string());
                }
                Segment::Malformed(seg) => self.malformed.push(seg.to_string()),
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(|v| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Segments that were skipped because they were not `name=value`.
    pub fn malformed(&self) -> &[String] {
        &self.malformed
    }

    pub fn as_map(&self) -> &HashMap<String, String> {
        &self.values
    }
}

fn classify(raw: &str) -> Segment<'_> {
    let seg = raw.trim();
    if seg.is_empty() {
        return Segment::Empty;
    }

    let Some((name, value)) = seg.split_once('=') else {
        return Segment::Malformed(seg);
    };
    let name = name.trim();
    let value = unquote(value.trim());

    if name.is_empty() || !name.bytes().all(is_token_byte) {
        return Segment::Malformed(seg);
    }
    match value {
        Some(v) if v.bytes().all(is_cookie_octet) => Segment::Pair(name, v),
        _ => Segment::Malformed(seg),
    }
}

/// Strips one pair of surrounding double quotes; a lone quote is rejected.
fn unquote(value: &str) -> Option<&str> {
    match (value.starts_with('"'), value.ends_with('"')) {
        (true, true) if value.len() >= 2 => Some(&value[1..value.len() - 1]),
        (false, false) => Some(value),
        _ => None,
    }
}

// RFC 6265 cookie-name is an RFC 7230 token.
fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

// Permissive cookie-octet: printable ASCII minus `"`, `;`, `,` and `\`, plus
// space, which browsers send in the wild.
fn is_cookie_octet(b: u8) -> bool {
    (0x20..0x7f).contains(&b) && !matches!(b, b'"' | b';' | b',' | b'\\')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_segments() {
        assert_eq!(classify("  "), Segment::Empty);
        assert_eq!(classify(" a=1 "), Segment::Pair("a", "1"));
        assert_eq!(classify("a=\"x y\""), Segment::Pair("a", "x y"));
        assert_eq!(classify("novalue"), Segment::Malformed("novalue"));
        assert_eq!(classify("=1"), Segment::Malformed("=1"));
        assert_eq!(classify("a b=1"), Segment::Malformed("a b=1"));
        assert_eq!(classify("a=\"open"), Segment::Malformed("a=\"open"));
    }

    #[test]
    fn empty_value_is_allowed() {
        let cookies = Cookies::parse("a=");
        assert_eq!(cookies.get("a"), Some(""));
    }
}
