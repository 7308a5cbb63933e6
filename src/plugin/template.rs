//! printf-style command templates for serial devices.
//!
//! A template such as `"PWM %d %.2f\r\n"` is parsed once when the plugin is
//! initialized and rendered with values taken from the command parameters.
//! Supported conversions: `%d %i %u %f %e %g %s %x %X %c` and `%%`, each with
//! optional flags (`-`, `0`, `+`, space), width and `.precision`. Backslash
//! escapes `\r \n \t \\` in literal text are expanded, so single-quoted YAML
//! templates behave like double-quoted ones.

use serde_json::Value;
use thiserror::Error;

use crate::protocol::Params;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("invalid template at byte {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("template expects {expected} value(s), got {actual}")]
    Mismatch { expected: usize, actual: usize },

    #[error("template needs a value: supply params.value or params.text")]
    MissingValue,

    #[error("value {index} ({value}) cannot be formatted with %{conversion}")]
    BadValue {
        index: usize,
        value: String,
        conversion: char,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct Spec {
    left: bool,
    zero: bool,
    plus: bool,
    space: bool,
    width: Option<usize>,
    precision: Option<usize>,
    conversion: char,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Placeholder(Spec),
}

/// A parsed command template.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl CommandTemplate {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let chars: Vec<(usize, char)> = source.char_indices().collect();
        let mut i = 0;

        while i < chars.len() {
            let (pos, c) = chars[i];
            match c {
                '\\' if i + 1 < chars.len() => {
                    let escaped = match chars[i + 1].1 {
                        'n' => Some('\n'),
                        'r' => Some('\r'),
                        't' => Some('\t'),
                        '\\' => Some('\\'),
                        _ => None,
                    };
                    match escaped {
                        Some(e) => {
                            literal.push(e);
                            i += 2;
                        }
                        None => {
                            literal.push('\\');
                            i += 1;
                        }
                    }
                }
                '%' => {
                    if chars.get(i + 1).map(|(_, c)| *c) == Some('%') {
                        literal.push('%');
                        i += 2;
                        continue;
                    }
                    let (spec, next) = parse_spec(&chars, i + 1, pos)?;
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder(spec));
                    i = next;
                }
                _ => {
                    literal.push(c);
                    i += 1;
                }
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Number of value placeholders (`%%` excluded)
    pub fn placeholder_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Placeholder(_)))
            .count()
    }

    /// Render with values picked from `params`.
    ///
    /// No placeholders: params are ignored. One placeholder: `params.value`, then
    /// `params.text`, then a one-element `params.values`. Several placeholders:
    /// `params.values` whose length must match exactly.
    pub fn render_params(&self, params: &Params) -> Result<String, TemplateError> {
        let count = self.placeholder_count();
        let values: Vec<Value> = match count {
            0 => Vec::new(),
            1 => {
                let single = params
                    .get("value")
                    .or_else(|| params.get("text"))
                    .filter(|v| !v.is_null())
                    .cloned();
                match (single, params.get("values")) {
                    (Some(v), _) => vec![v],
                    (None, Some(Value::Array(vs))) => vs.clone(),
                    (None, _) => return Err(TemplateError::MissingValue),
                }
            }
            _ => match params.get("values") {
                Some(Value::Array(vs)) => vs.clone(),
                Some(other) => vec![other.clone()],
                None => Vec::new(),
            },
        };
        self.render(&values)
    }

    /// Render with an explicit value list.
    pub fn render(&self, values: &[Value]) -> Result<String, TemplateError> {
        let expected = self.placeholder_count();
        if values.len() != expected {
            return Err(TemplateError::Mismatch {
                expected,
                actual: values.len(),
            });
        }

        let mut out = String::new();
        let mut next = values.iter().enumerate();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(spec) => {
                    // Counts were checked above
                    if let Some((index, value)) = next.next() {
                        out.push_str(&format_value(spec, index, value)?);
                    }
                }
            }
        }
        Ok(out)
    }
}

fn parse_spec(
    chars: &[(usize, char)],
    mut i: usize,
    start: usize,
) -> Result<(Spec, usize), TemplateError> {
    let syntax = |message: &str| TemplateError::Syntax {
        position: start,
        message: message.to_string(),
    };
    let mut spec = Spec {
        left: false,
        zero: false,
        plus: false,
        space: false,
        width: None,
        precision: None,
        conversion: 'd',
    };

    while let Some((_, c)) = chars.get(i) {
        match c {
            '-' => spec.left = true,
            '0' => spec.zero = true,
            '+' => spec.plus = true,
            ' ' => spec.space = true,
            _ => break,
        }
        i += 1;
    }

    let (width, next) = parse_number(chars, i).ok_or_else(|| syntax(FIELD_TOO_WIDE))?;
    spec.width = width;
    i = next;

    if chars.get(i).map(|(_, c)| *c) == Some('.') {
        let (precision, next) =
            parse_number(chars, i + 1).ok_or_else(|| syntax(FIELD_TOO_WIDE))?;
        spec.precision = Some(precision.unwrap_or(0));
        i = next;
    }

    match chars.get(i) {
        Some((_, c)) if "diufegsxXc".contains(*c) => {
            spec.conversion = *c;
            Ok((spec, i + 1))
        }
        Some((_, c)) => Err(syntax(&format!("unsupported conversion '%{}'", c))),
        None => Err(syntax("template ends inside a placeholder")),
    }
}

/// Largest accepted width or precision in a placeholder.
const MAX_FIELD: usize = 256;
const FIELD_TOO_WIDE: &str = "width or precision exceeds 256";

/// Digits starting at `i`; `None` once the value passes [`MAX_FIELD`].
fn parse_number(chars: &[(usize, char)], mut i: usize) -> Option<(Option<usize>, usize)> {
    let mut value: Option<usize> = None;
    while let Some(d) = chars.get(i).and_then(|(_, c)| c.to_digit(10)) {
        let next = value
            .unwrap_or(0)
            .checked_mul(10)?
            .checked_add(d as usize)
            .filter(|n| *n <= MAX_FIELD)?;
        value = Some(next);
        i += 1;
    }
    Some((value, i))
}

fn format_value(spec: &Spec, index: usize, value: &Value) -> Result<String, TemplateError> {
    let bad = || TemplateError::BadValue {
        index,
        value: value.to_string(),
        conversion: spec.conversion,
    };

    let (body, numeric, negative) = match spec.conversion {
        'd' | 'i' => {
            let n = integer(value).ok_or_else(bad)?;
            (n.unsigned_abs().to_string(), true, n < 0)
        }
        'u' => {
            let n = integer(value).filter(|n| *n >= 0).ok_or_else(bad)?;
            (n.to_string(), true, false)
        }
        'x' | 'X' => {
            let n = integer(value).filter(|n| *n >= 0).ok_or_else(bad)?;
            let hex = format!("{:x}", n);
            let hex = if spec.conversion == 'X' {
                hex.to_uppercase()
            } else {
                hex
            };
            (hex, true, false)
        }
        'f' => {
            let x = float(value).ok_or_else(bad)?;
            (
                format!("{:.*}", spec.precision.unwrap_or(6), x.abs()),
                true,
                x.is_sign_negative() && x != 0.0,
            )
        }
        'e' => {
            let x = float(value).ok_or_else(bad)?;
            (
                c_exponent(x.abs(), spec.precision.unwrap_or(6)),
                true,
                x.is_sign_negative() && x != 0.0,
            )
        }
        'g' => {
            let x = float(value).ok_or_else(bad)?;
            (
                c_general(x.abs(), spec.precision.unwrap_or(6)),
                true,
                x.is_sign_negative() && x != 0.0,
            )
        }
        'c' => {
            let c = match value {
                Value::String(s) => s.chars().next().ok_or_else(bad)?,
                other => integer(other)
                    .and_then(|n| u32::try_from(n).ok())
                    .and_then(char::from_u32)
                    .ok_or_else(bad)?,
            };
            (c.to_string(), false, false)
        }
        _ => {
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                    (Some(i), _) => i.to_string(),
                    (None, Some(f)) => f.to_string(),
                    _ => n.to_string(),
                },
                Value::Bool(b) => b.to_string(),
                _ => return Err(bad()),
            };
            let text = match spec.precision {
                Some(p) => text.chars().take(p).collect(),
                None => text,
            };
            (text, false, false)
        }
    };

    let sign = if negative {
        "-"
    } else if numeric && spec.plus {
        "+"
    } else if numeric && spec.space {
        " "
    } else {
        ""
    };

    let len = sign.len() + body.chars().count();
    let width = spec.width.unwrap_or(0);
    if len >= width {
        return Ok(format!("{}{}", sign, body));
    }
    let pad = width - len;
    Ok(if spec.left {
        format!("{}{}{}", sign, body, " ".repeat(pad))
    } else if spec.zero && numeric {
        format!("{}{}{}", sign, "0".repeat(pad), body)
    } else {
        format!("{}{}{}", " ".repeat(pad), sign, body)
    })
}

fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Bool(b) => Some(i64::from(*b)),
        other => crate::protocol::document::as_integer(other),
    }
}

fn float(value: &Value) -> Option<f64> {
    match value {
        Value::Bool(b) => Some(f64::from(u8::from(*b))),
        other => other.as_f64(),
    }
}

/// `%e` rendering: mantissa with `precision` decimals and a signed, two-digit exponent.
fn c_exponent(x: f64, precision: usize) -> String {
    let rust = format!("{:.*e}", precision, x);
    match rust.split_once('e') {
        Some((mantissa, exp)) => {
            let exp: i32 = exp.parse().unwrap_or(0);
            let sign = if exp < 0 { '-' } else { '+' };
            format!("{}e{}{:02}", mantissa, sign, exp.abs())
        }
        None => rust,
    }
}

/// `%g` rendering: shortest of `%e`/`%f` with trailing zeros removed.
fn c_general(x: f64, precision: usize) -> String {
    let p = precision.max(1);
    if x == 0.0 {
        return "0".to_string();
    }
    let exp = format!("{:.*e}", p - 1, x)
        .split_once('e')
        .and_then(|(_, e)| e.parse::<i32>().ok())
        .unwrap_or(0);

    if exp < -4 || exp >= p as i32 {
        let s = c_exponent(x, p - 1);
        match s.split_once('e') {
            Some((mantissa, rest)) => format!("{}e{}", strip_zeros(mantissa), rest),
            None => s,
        }
    } else {
        let decimals = (p as i32 - 1 - exp).max(0) as usize;
        strip_zeros(&format!("{:.*}", decimals, x))
    }
}

fn strip_zeros(s: &str) -> String {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s.to_string()
    }
}
