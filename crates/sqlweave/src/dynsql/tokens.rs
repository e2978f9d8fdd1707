//! Token parsing for SQL text
//!
//! - [`TokenParser`]: generic open/close token scanner with backslash escapes
//! - [`parse_parameter`]: `#{prop,jdbcType=...,mode=...}` attribute parsing
//! - [`substitute_properties`]: build-time `${name:default}` substitution

use indexmap::IndexMap;
use sqlweave_rdbc::DriverType;

use crate::convert::AppType;
use crate::error::{Error, Result};
use crate::mapping::{ParameterMapping, ParameterMode};

/// Generic token scanner. Finds `open ... close` spans, hands the content to
/// the handler, and splices the replacement into the output. `\` escapes an
/// opening token; an unclosed token is kept verbatim.
pub struct TokenParser<'a> {
    open: &'a str,
    close: &'a str,
}

impl<'a> TokenParser<'a> {
    /// Create a parser for the given token pair
    pub fn new(open: &'a str, close: &'a str) -> Self {
        Self { open, close }
    }

    /// Parse the text, replacing each token via the handler
    pub fn parse(
        &self,
        text: &str,
        handler: &mut dyn FnMut(&str) -> Result<String>,
    ) -> Result<String> {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        loop {
            let Some(start) = rest.find(self.open) else {
                out.push_str(rest);
                return Ok(out);
            };
            // Backslash escape keeps the token literal.
            if start > 0 && rest.as_bytes()[start - 1] == b'\\' {
                out.push_str(&rest[..start - 1]);
                out.push_str(self.open);
                rest = &rest[start + self.open.len()..];
                continue;
            }
            out.push_str(&rest[..start]);
            let after_open = &rest[start + self.open.len()..];
            let Some(end) = after_open.find(self.close) else {
                // Unclosed token: keep the remainder verbatim.
                out.push_str(&rest[start..]);
                return Ok(out);
            };
            let content = &after_open[..end];
            out.push_str(&handler(content)?);
            rest = &after_open[end + self.close.len()..];
        }
    }

    /// Whether the text contains an unescaped token
    pub fn contains_token(&self, text: &str) -> bool {
        let mut rest = text;
        while let Some(start) = rest.find(self.open) {
            if start > 0 && rest.as_bytes()[start - 1] == b'\\' {
                rest = &rest[start + self.open.len()..];
                continue;
            }
            return true;
        }
        false
    }
}

/// Parse the content of a `#{...}` placeholder into a parameter mapping.
///
/// The first comma-separated segment is the property path; the rest are
/// `key=value` attributes: `javaType`, `jdbcType`, `mode`, `numericScale`,
/// `typeHandler`, `resultMap`.
pub fn parse_parameter(content: &str) -> Result<ParameterMapping> {
    let mut segments = content.split(',');
    let property = segments
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::malformed(format!("empty parameter placeholder '#{{{content}}}'")))?;

    let mut mapping = ParameterMapping::of(property);
    for segment in segments {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let (key, value) = segment.split_once('=').ok_or_else(|| {
            Error::malformed(format!(
                "bad attribute '{segment}' in parameter placeholder '#{{{content}}}'"
            ))
        })?;
        let (key, value) = (key.trim(), value.trim());
        match key {
            "javaType" | "appType" => mapping.app_type = AppType::parse(value),
            "jdbcType" | "driverType" => {
                mapping.driver_type = DriverType::parse(value).ok_or_else(|| {
                    Error::malformed(format!("unknown driver type '{value}' in '#{{{content}}}'"))
                })?;
            }
            "mode" => {
                mapping.mode = match value.to_ascii_uppercase().as_str() {
                    "IN" => ParameterMode::In,
                    "OUT" => ParameterMode::Out,
                    "INOUT" => ParameterMode::InOut,
                    other => {
                        return Err(Error::malformed(format!(
                            "unknown parameter mode '{other}' in '#{{{content}}}'"
                        )))
                    }
                };
            }
            "numericScale" => {
                mapping.numeric_scale = Some(value.parse().map_err(|_| {
                    Error::malformed(format!("bad numericScale '{value}' in '#{{{content}}}'"))
                })?);
            }
            "typeHandler" | "converter" => mapping.converter = Some(value.to_string()),
            "resultMap" => mapping.result_map = Some(value.to_string()),
            other => {
                return Err(Error::malformed(format!(
                    "unknown attribute '{other}' in parameter placeholder '#{{{content}}}'"
                )))
            }
        }
    }
    Ok(mapping)
}

/// Replace `#{...}` placeholders with positional `?` markers, collecting the
/// parameter mappings in order.
pub fn apply_parameter_pass(sql: &str) -> Result<(String, Vec<ParameterMapping>)> {
    let mut mappings = Vec::new();
    let parser = TokenParser::new("#{", "}");
    let sql = parser.parse(sql, &mut |content| {
        mappings.push(parse_parameter(content)?);
        Ok("?".to_string())
    })?;
    Ok((sql, mappings))
}

/// Substitute `${name}` / `${name:default}` tokens from a property table.
/// Unknown names without a default are kept verbatim.
pub fn substitute_properties(text: &str, properties: &IndexMap<String, String>) -> String {
    let parser = TokenParser::new("${", "}");
    parser
        .parse(text, &mut |content| {
            let (name, default) = match content.split_once(':') {
                Some((name, default)) => (name.trim(), Some(default.trim())),
                None => (content.trim(), None),
            };
            Ok(match properties.get(name) {
                Some(value) => value.clone(),
                None => match default {
                    Some(default) => default.to_string(),
                    None => format!("${{{content}}}"),
                },
            })
        })
        .expect("property substitution handler is infallible")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_tokens_in_order() {
        let parser = TokenParser::new("#{", "}");
        let mut seen = Vec::new();
        let out = parser
            .parse("a = #{a} AND b = #{b}", &mut |content| {
                seen.push(content.to_string());
                Ok("?".to_string())
            })
            .unwrap();
        assert_eq!(out, "a = ? AND b = ?");
        assert_eq!(seen, vec!["a", "b"]);
    }

    #[test]
    fn escaped_tokens_stay_literal() {
        let parser = TokenParser::new("#{", "}");
        let out = parser
            .parse(r"literal \#{notatoken} and #{real}", &mut |_| {
                Ok("?".to_string())
            })
            .unwrap();
        assert_eq!(out, "literal #{notatoken} and ?");
    }

    #[test]
    fn unclosed_tokens_are_kept() {
        let parser = TokenParser::new("#{", "}");
        let out = parser
            .parse("broken #{oops", &mut |_| Ok("?".to_string()))
            .unwrap();
        assert_eq!(out, "broken #{oops");
    }

    #[test]
    fn parses_parameter_attributes() {
        let m = parse_parameter("user.id, jdbcType=BIGINT, javaType=long, mode=INOUT").unwrap();
        assert_eq!(m.property, "user.id");
        assert_eq!(m.driver_type, DriverType::BigInt);
        assert_eq!(m.app_type, AppType::I64);
        assert_eq!(m.mode, ParameterMode::InOut);

        let m = parse_parameter("amount, numericScale=2, typeHandler=MoneyHandler").unwrap();
        assert_eq!(m.numeric_scale, Some(2));
        assert_eq!(m.converter.as_deref(), Some("MoneyHandler"));
    }

    #[test]
    fn rejects_bad_parameter_content() {
        assert!(parse_parameter("").is_err());
        assert!(parse_parameter("x, jdbcType=NOPE").is_err());
        assert!(parse_parameter("x, frobnicate=1").is_err());
        assert!(parse_parameter("x, mode=SIDEWAYS").is_err());
    }

    #[test]
    fn parameter_pass_counts_match() {
        let (sql, mappings) =
            apply_parameter_pass("SELECT * FROM t WHERE a = #{a} AND b = #{b,jdbcType=INTEGER}")
                .unwrap();
        assert_eq!(sql, "SELECT * FROM t WHERE a = ? AND b = ?");
        assert_eq!(sql.matches('?').count(), mappings.len());
        assert_eq!(mappings[1].driver_type, DriverType::Integer);
    }

    #[test]
    fn substitutes_properties_with_defaults() {
        let mut props = IndexMap::new();
        props.insert("table".to_string(), "users".to_string());
        assert_eq!(
            substitute_properties("SELECT * FROM ${table}", &props),
            "SELECT * FROM users"
        );
        assert_eq!(
            substitute_properties("${missing:fallback}", &props),
            "fallback"
        );
        assert_eq!(substitute_properties("${missing}", &props), "${missing}");
    }
}
