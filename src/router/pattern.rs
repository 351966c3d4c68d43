//! Route patterns with typed placeholders.
//!
//! A pattern is a regular expression over the decoded request path in which
//! placeholders capture typed values:
//!
//! | placeholder       | captures                          |
//! |-------------------|-----------------------------------|
//! | `{{i}}`           | signed integer (`i64`)            |
//! | `{{d}}`           | signed decimal (`f64`)            |
//! | `{{s:<regex>}}`   | string matching `<regex>`         |
//! | `{{i?}}`, `{{d?}}`, `{{s?:<regex>}}` | optional variants |
//!
//! e.g. `/users/{{i}}/files/{{s:.+}}`. The whole path must match.

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Int,
    Double,
    Str,
    OptionalInt,
    OptionalDouble,
    OptionalStr,
}

const INT_EXPR: &str = r"[+-]?\d+";
const DOUBLE_EXPR: &str = r"[+-]?\d+(?:\.\d+)?";

impl ParamKind {
    fn is_optional(&self) -> bool {
        matches!(
            self,
            ParamKind::OptionalInt | ParamKind::OptionalDouble | ParamKind::OptionalStr
        )
    }
}

/// A captured route parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i64),
    Double(f64),
    Str(String),
    /// An optional placeholder that did not participate in the match.
    Missing,
}

/// Typed captures from the route that matched, in placeholder order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteParams {
    values: Vec<ParamValue>,
}

impl RouteParams {
    pub fn get(&self, index: usize) -> Option<&ParamValue> {
        self.values.get(index)
    }

    pub fn int(&self, index: usize) -> Option<i64> {
        match self.values.get(index)? {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn double(&self, index: usize) -> Option<f64> {
        match self.values.get(index)? {
            ParamValue::Double(v) => Some(*v),
            ParamValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn str(&self, index: usize) -> Option<&str> {
        match self.values.get(index)? {
            ParamValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("unterminated placeholder at byte {0}")]
    Unterminated(usize),
    #[error("unknown placeholder `{{{{{0}}}}}`")]
    UnknownPlaceholder(String),
    #[error(transparent)]
    Regex(#[from] regex::Error),
}

#[derive(Debug, Clone)]
pub struct RoutePattern {
    source: String,
    regex: Regex,
    kinds: Vec<ParamKind>,
}

impl RoutePattern {
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        let mut expr = String::from("^(?:");
        let mut kinds = Vec::new();
        let mut rest = pattern;
        let mut offset = 0;

        while let Some(open) = rest.find("{{") {
            expr.push_str(&rest[..open]);
            let after = &rest[open + 2..];
            let close = after
                .find("}}")
                .ok_or(PatternError::Unterminated(offset + open))?;
            let placeholder = &after[..close];

            let index = kinds.len();
            let (kind, inner) = match placeholder {
                "i" => (ParamKind::Int, INT_EXPR),
                "i?" => (ParamKind::OptionalInt, INT_EXPR),
                "d" => (ParamKind::Double, DOUBLE_EXPR),
                "d?" => (ParamKind::OptionalDouble, DOUBLE_EXPR),
                s => {
                    let (kind, re) = if let Some(re) = s.strip_prefix("s?:") {
                        (ParamKind::OptionalStr, re)
                    } else if let Some(re) = s.strip_prefix("s:") {
                        (ParamKind::Str, re)
                    } else {
                        return Err(PatternError::UnknownPlaceholder(s.to_string()));
                    };
                    // Validate on its own so errors point at the user's
                    // expression rather than the combined one.
                    Regex::new(re)?;
                    (kind, re)
                }
            };
            let optional = if kind.is_optional() { "?" } else { "" };
            expr.push_str(&format!("(?P<p{index}>{inner}){optional}"));
            kinds.push(kind);

            let consumed = open + 2 + close + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }
        expr.push_str(rest);
        expr.push_str(")$");

        Ok(Self {
            source: pattern.to_string(),
            regex: Regex::new(&expr)?,
            kinds,
        })
    }

    /// True for patterns that only match themselves: no placeholders and no
    /// regex syntax.
    pub fn is_literal(pattern: &str) -> bool {
        !pattern.contains("{{") && regex::escape(pattern) == pattern
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn param_kinds(&self) -> &[ParamKind] {
        &self.kinds
    }

    /// Captures for `path`, or `None` if the pattern does not match or a
    /// numeric capture does not fit its type.
    pub fn matches(&self, path: &str) -> Option<RouteParams> {
        let caps = self.regex.captures(path)?;
        let mut values = Vec::with_capacity(self.kinds.len());

        for (index, kind) in self.kinds.iter().enumerate() {
            let Some(m) = caps.name(&format!("p{index}")) else {
                if kind.is_optional() {
                    values.push(ParamValue::Missing);
                    continue;
                }
                return None;
            };
            let value = match kind {
                ParamKind::Int | ParamKind::OptionalInt => ParamValue::Int(m.as_str().parse().ok()?),
                ParamKind::Double | ParamKind::OptionalDouble => {
                    ParamValue::Double(m.as_str().parse().ok()?)
                }
                ParamKind::Str | ParamKind::OptionalStr => ParamValue::Str(m.as_str().to_string()),
            };
            values.push(value);
        }

        Some(RouteParams { values })
    }
}
