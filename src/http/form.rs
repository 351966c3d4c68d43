//! Form bodies.
//!
//! [`FormData`] decodes `application/x-www-form-urlencoded` and
//! `multipart/form-data` request bodies into named fields. A field may
//! repeat; lookups return the first value, `get_all` every value in body
//! order. Other content types yield an empty form.

use url::form_urlencoded;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormError {
    #[error("multipart body without a boundary parameter")]
    MissingBoundary,
    #[error("malformed multipart body: {0}")]
    Malformed(&'static str),
}

/// One named value. Multipart file uploads keep their file name and type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormField {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

impl FormField {
    fn value(name: String, data: Vec<u8>) -> Self {
        Self {
            name,
            filename: None,
            content_type: None,
            data,
        }
    }

    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormData {
    fields: Vec<FormField>,
}

impl FormData {
    /// Decodes `body` according to the request's `Content-Type`.
    pub fn parse(content_type: Option<&str>, body: &[u8]) -> Result<Self, FormError> {
        let Some(content_type) = content_type else {
            return Ok(Self::default());
        };
        let essence = content_type.split(';').next().unwrap_or_default().trim();

        if essence.eq_ignore_ascii_case("application/x-www-form-urlencoded") {
            Ok(Self::parse_urlencoded(body))
        } else if essence.eq_ignore_ascii_case("multipart/form-data") {
            let boundary = boundary(content_type).ok_or(FormError::MissingBoundary)?;
            Ok(Self {
                fields: parse_multipart(body, boundary)?,
            })
        } else {
            Ok(Self::default())
        }
    }

    /// `+` decodes to a space; pairs with an empty name are dropped.
    pub fn parse_urlencoded(body: &[u8]) -> Self {
        let fields = form_urlencoded::parse(body)
            .into_owned()
            .filter(|(name, _)| !name.is_empty())
            .map(|(name, value)| FormField::value(name, value.into_bytes()))
            .collect();
        Self { fields }
    }

    /// First value of `name`, if it is valid UTF-8.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(FormField::text)
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields_named(name).filter_map(FormField::text)
    }

    pub fn get_binary(&self, name: &str) -> Option<&[u8]> {
        self.field(name).map(|f| f.data.as_slice())
    }

    pub fn get_binary_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.fields_named(name).map(|f| f.data.as_slice())
    }

    pub fn field(&self, name: &str) -> Option<&FormField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn fields(&self) -> &[FormField] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn fields_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a FormField> + 'a {
        self.fields.iter().filter(move |f| f.name == name)
    }
}

fn boundary(content_type: &str) -> Option<&str> {
    content_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim().trim_matches('"'))
        .filter(|b| !b.is_empty())
}

/// Parts are delimited by `--boundary` at the start of a line and the body
/// ends at `--boundary--`. Both CRLF and bare LF line endings are accepted.
fn parse_multipart(body: &[u8], boundary: &str) -> Result<Vec<FormField>, FormError> {
    let delimiter = format!("--{boundary}").into_bytes();
    let mut fields = Vec::new();

    let mut pos =
        find_delimiter(body, &delimiter, 0).ok_or(FormError::Malformed("no opening boundary"))?;
    loop {
        pos += delimiter.len();
        if body[pos..].starts_with(b"--") {
            return Ok(fields);
        }
        pos = skip_line_end(body, pos).ok_or(FormError::Malformed("junk after boundary"))?;

        let (head_end, data_start) =
            find_blank_line(body, pos).ok_or(FormError::Malformed("unterminated part headers"))?;
        let head = std::str::from_utf8(&body[pos..head_end])
            .map_err(|_| FormError::Malformed("part headers are not UTF-8"))?;

        let next = find_delimiter(body, &delimiter, data_start)
            .ok_or(FormError::Malformed("missing closing boundary"))?;
        let data = &body[data_start..strip_line_end(body, data_start, next)];

        fields.push(parse_part(head, data)?);
        pos = next;
    }
}

fn parse_part(head: &str, data: &[u8]) -> Result<FormField, FormError> {
    let mut name = None;
    let mut filename = None;
    let mut content_type = None;

    for line in head.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key.eq_ignore_ascii_case("Content-Disposition") {
            for param in value.split(';').skip(1) {
                match param.trim().split_once('=') {
                    Some(("name", v)) => name = Some(v.trim_matches('"').to_string()),
                    Some(("filename", v)) => filename = Some(v.trim_matches('"').to_string()),
                    _ => {}
                }
            }
        } else if key.eq_ignore_ascii_case("Content-Type") {
            content_type = Some(value.trim().to_string());
        }
    }

    Ok(FormField {
        name: name.ok_or(FormError::Malformed("part without a name"))?,
        filename,
        content_type,
        data: data.to_vec(),
    })
}

/// Next `delimiter` at or after `from` that starts a line.
fn find_delimiter(body: &[u8], delimiter: &[u8], from: usize) -> Option<usize> {
    let mut start = from;
    while start + delimiter.len() <= body.len() {
        let offset = body[start..]
            .windows(delimiter.len())
            .position(|w| w == delimiter)?;
        let at = start + offset;
        if at == 0 || body[at - 1] == b'\n' {
            return Some(at);
        }
        start = at + 1;
    }
    None
}

fn skip_line_end(body: &[u8], pos: usize) -> Option<usize> {
    let rest = &body[pos..];
    if rest.starts_with(b"\r\n") {
        Some(pos + 2)
    } else if rest.starts_with(b"\n") {
        Some(pos + 1)
    } else {
        None
    }
}

/// End of the header block and start of the data after it.
fn find_blank_line(body: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut line_start = from;
    loop {
        let rest = &body[line_start..];
        if rest.starts_with(b"\r\n") {
            return Some((line_start, line_start + 2));
        }
        if rest.starts_with(b"\n") {
            return Some((line_start, line_start + 1));
        }
        let newline = rest.iter().position(|&b| b == b'\n')?;
        line_start += newline + 1;
    }
}

/// Drops the line break that belongs to the delimiter at `end`.
fn strip_line_end(body: &[u8], start: usize, mut end: usize) -> usize {
    if end > start && body[end - 1] == b'\n' {
        end -= 1;
        if end > start && body[end - 1] == b'\r' {
            end -= 1;
        }
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_parameter() {
        assert_eq!(
            boundary("multipart/form-data; boundary=\"abc\""),
            Some("abc")
        );
        assert_eq!(
            boundary("multipart/form-data; charset=utf-8; Boundary=x-y"),
            Some("x-y")
        );
        assert_eq!(boundary("multipart/form-data"), None);
    }

    #[test]
    fn delimiter_must_start_a_line() {
        let body = b"x--b\n--b";
        assert_eq!(find_delimiter(body, b"--b", 0), Some(5));
    }
}
