//! Parsing of chat-completions envelopes into typed records.
//!
//! Providers disagree on the details: some wrap JSON answers in Markdown
//! fences, some return `content` as an array of parts, and numbers regularly
//! arrive as strings (`"100,000.00"`). [`parse`] and the decoders in
//! [`lenient`] absorb that variance; anything they cannot make sense of is a
//! [`ParseError`].

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("response envelope is not JSON: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("response contained no choices")]
    NoChoices,
    #[error("choice has no message content")]
    MissingContent,
    #[error("message content is not the expected JSON: {0}")]
    Content(#[source] serde_json::Error),
}

/// Extracts `choices[0].message.content` from a provider envelope.
///
/// String content is returned trimmed; array content (a list of
/// `{type: "text", text}` parts) is concatenated.
pub fn message_content(body: &str) -> Result<String, ParseError> {
    let envelope: Value = serde_json::from_str(body.trim()).map_err(ParseError::Envelope)?;

    let choice = envelope
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or(ParseError::NoChoices)?;

    let content = choice
        .get("message")
        .and_then(|m| m.get("content"))
        .ok_or(ParseError::MissingContent)?;

    match content {
        Value::String(s) => Ok(s.trim().to_string()),
        Value::Array(parts) => {
            let text: Vec<&str> = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect();
            if text.is_empty() {
                Err(ParseError::MissingContent)
            } else {
                Ok(text.join("").trim().to_string())
            }
        }
        Value::Null => Err(ParseError::MissingContent),
        other => Ok(other.to_string()),
    }
}

/// Parses the message content of an envelope as JSON into `T`.
pub fn parse<T: DeserializeOwned>(body: &str) -> Result<T, ParseError> {
    let content = message_content(body)?;
    parse_content(&content)
}

/// Parses already-extracted message content as JSON into `T`.
pub fn parse_content<T: DeserializeOwned>(content: &str) -> Result<T, ParseError> {
    let json = strip_code_fence(content);
    serde_json::from_str(json)
        .or_else(|first_err| match outermost_object(json) {
            Some(inner) if inner.len() < json.len() => serde_json::from_str(inner),
            _ => Err(first_err),
        })
        .map_err(ParseError::Content)
}

/// Removes a surrounding Markdown code fence (```json ... ```), if any.
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end().trim_end_matches("```").trim()
}

/// The slice from the first `{` to the last `}`; rescues answers that put
/// prose around the JSON object.
fn outermost_object(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    (end > start).then(|| &content[start..=end])
}

/// Tolerant field decoders for model-produced JSON.
pub mod lenient {
    use rust_decimal::prelude::FromPrimitive;
    use rust_decimal::Decimal;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;
    use std::str::FromStr;

    /// Decimal from a JSON number or a string such as `"$100,000.50"`.
    /// Unparseable or empty values become `None`.
    pub fn opt_decimal<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<Value>::deserialize(deserializer)?;
        Ok(value.as_ref().and_then(decimal_from_value))
    }

    pub fn decimal_from_value(value: &Value) -> Option<Decimal> {
        match value {
            Value::Number(n) => {
                let repr = n.to_string();
                Decimal::from_str(&repr)
                    .or_else(|_| Decimal::from_scientific(&repr))
                    .ok()
                    .or_else(|| n.as_f64().and_then(Decimal::from_f64))
            }
            Value::String(s) => decimal_from_str(s),
            _ => None,
        }
    }

    pub fn decimal_from_str(s: &str) -> Option<Decimal> {
        let token = numeric_token(s)?;
        Decimal::from_str(&token)
            .or_else(|_| Decimal::from_scientific(&token))
            .ok()
    }

    /// The first number written in `s`, normalized for parsing: thousands
    /// separators dropped, a sign kept only directly before the number, an
    /// exponent kept only between digits. `"USD 1,200.50 per month"` gives
    /// `"1200.50"`.
    fn numeric_token(s: &str) -> Option<String> {
        let chars: Vec<char> = s.chars().collect();
        let digit_at = |j: usize| chars.get(j).is_some_and(|c| c.is_ascii_digit());

        let mut begin = chars.iter().position(|c| c.is_ascii_digit())?;
        if begin > 0 && chars[begin - 1] == '.' {
            begin -= 1;
        }
        let mut out = String::new();
        if begin > 0 && chars[begin - 1] == '-' {
            out.push('-');
        }

        let (mut seen_dot, mut seen_exp) = (false, false);
        let mut i = begin;
        while i < chars.len() {
            match chars[i] {
                c @ '0'..='9' => out.push(c),
                ',' if !seen_dot && !seen_exp && digit_at(i + 1) => {}
                '.' if !seen_dot && !seen_exp && digit_at(i + 1) => {
                    seen_dot = true;
                    out.push('.');
                }
                'e' | 'E' if !seen_exp && digit_at(i.wrapping_sub(1)) => {
                    let sign = matches!(chars.get(i + 1), Some('+' | '-'));
                    if !digit_at(if sign { i + 2 } else { i + 1 }) {
                        break;
                    }
                    seen_exp = true;
                    out.push('e');
                    if sign {
                        out.push(chars[i + 1]);
                        i += 1;
                    }
                }
                _ => break,
            }
            i += 1;
        }
        Some(out)
    }

    /// f64 from a JSON number or a numeric string (`"30%"` → 30.0).
    pub fn opt_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<Value>::deserialize(deserializer)?;
        Ok(value.as_ref().and_then(f64_from_value))
    }

    /// Like [`opt_f64`] but defaults to `0.0`.
    pub fn f64_or_zero<'de, D>(deserializer: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(opt_f64(deserializer)?.unwrap_or(0.0))
    }

    pub fn f64_from_value(value: &Value) -> Option<f64> {
        match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => numeric_token(s)?.parse::<f64>().ok(),
            _ => None,
        }
    }

    /// bool from `true`, `"true"`, `"yes"`, `1`, ...
    pub fn bool_from_any<'de, D>(deserializer: D) -> Result<bool, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Ok(match value {
            Value::Bool(b) => b,
            Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
            Value::String(s) => matches!(
                s.trim().to_ascii_lowercase().as_str(),
                "true" | "yes" | "y" | "1" | "valid"
            ),
            _ => false,
        })
    }

    /// `T` parsed from a string; unknown strings and non-strings give `None`.
    pub fn opt_from_str<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: FromStr,
    {
        let value = Option::<Value>::deserialize(deserializer)?;
        Ok(match value {
            Some(Value::String(s)) => s.parse::<T>().ok(),
            _ => None,
        })
    }

    /// `T` parsed from a string, falling back to `T::default()`.
    pub fn from_str_or_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: FromStr + Default,
    {
        Ok(opt_from_str(deserializer)?.unwrap_or_default())
    }

    /// A list of strings from an array, a single string, or a
    /// comma-separated string. Non-string array items are skipped.
    pub fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<Value>::deserialize(deserializer)?;
        Ok(match value {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s),
                    _ => None,
                })
                .collect(),
            Some(Value::String(s)) => s
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            _ => Vec::new(),
        })
    }
}
