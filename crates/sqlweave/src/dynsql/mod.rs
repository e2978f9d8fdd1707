//! Dynamic SQL
//!
//! A statement's SQL is a tree of [`SqlNode`]s. Evaluating the tree against a
//! parameter appends SQL text to a [`DynamicContext`] and may declare scoped
//! bindings; a secondary pass then replaces `#{...}` placeholders with
//! positional markers and records parameter mappings in declaration order.
//!
//! Raw (static) statements run the placeholder pass once at build time;
//! dynamic statements re-render per invocation.

pub mod expr;
pub mod tokens;

use indexmap::IndexMap;
use sqlweave_rdbc::Value;

use crate::config::Configuration;
use crate::error::{Error, Result};
use crate::mapping::{BoundSql, SqlSource};
use expr::Evaluator;
use tokens::{apply_parameter_pass, TokenParser};

/// Rendering context: the binding map and the SQL buffer.
pub struct DynamicContext {
    /// Visible bindings: `_parameter`, `_databaseId`, `bind` variables, and
    /// foreach item bindings
    pub bindings: IndexMap<String, Value>,
    sql: String,
    unique: usize,
}

/// Name of the parameter-object binding
pub const PARAMETER_BINDING: &str = "_parameter";
/// Name of the database-id binding
pub const DATABASE_ID_BINDING: &str = "_databaseId";

impl DynamicContext {
    /// Create a context for one rendering pass
    pub fn new(parameter: Value, database_id: Option<String>) -> Self {
        let mut bindings = IndexMap::new();
        bindings.insert(PARAMETER_BINDING.to_string(), parameter);
        bindings.insert(
            DATABASE_ID_BINDING.to_string(),
            database_id.map(Value::String).unwrap_or(Value::Null),
        );
        Self {
            bindings,
            sql: String::new(),
            unique: 0,
        }
    }

    /// Append a fragment, separating fragments with single spaces
    pub fn append(&mut self, fragment: &str) {
        let fragment = fragment.trim();
        if fragment.is_empty() {
            return;
        }
        if !self.sql.is_empty() {
            self.sql.push(' ');
        }
        self.sql.push_str(fragment);
    }

    /// The SQL rendered so far
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Next unique suffix for foreach item bindings
    pub fn next_unique(&mut self) -> usize {
        let n = self.unique;
        self.unique += 1;
        n
    }

    /// Render into a detached buffer, restoring the current one afterwards
    fn capture<F>(&mut self, f: F) -> Result<String>
    where
        F: FnOnce(&mut Self) -> Result<bool>,
    {
        let saved = std::mem::take(&mut self.sql);
        let result = f(self);
        let body = std::mem::replace(&mut self.sql, saved);
        result?;
        Ok(body)
    }

    /// Scoped bindings created during rendering, without the implicit ones
    pub fn into_additional(mut self) -> IndexMap<String, Value> {
        self.bindings.shift_remove(PARAMETER_BINDING);
        self.bindings.shift_remove(DATABASE_ID_BINDING);
        self.bindings
    }
}

/// One node of a dynamic SQL tree. `apply` appends to the context and
/// reports whether it contributed any text.
pub enum SqlNode {
    /// Verbatim text
    StaticText(String),
    /// Text containing `${...}` substitutions
    Text(String),
    /// Ordered children
    Mixed(Vec<SqlNode>),
    /// Conditional inclusion
    If {
        /// Condition over the binding context
        test: String,
        /// Body applied when truthy
        contents: Box<SqlNode>,
    },
    /// First-match selection
    Choose {
        /// `(test, body)` pairs tried in order
        whens: Vec<(String, SqlNode)>,
        /// Fallback body
        otherwise: Option<Box<SqlNode>>,
    },
    /// Collection iteration
    Foreach {
        /// Expression yielding the collection
        collection: String,
        /// Binding name for each element
        item: Option<String>,
        /// Binding name for each index / key
        index: Option<String>,
        /// Text before the first element
        open: String,
        /// Text after the last element
        close: String,
        /// Text between elements
        separator: String,
        /// Body applied per element
        contents: Box<SqlNode>,
    },
    /// Prefix/suffix management around a body
    Trim {
        /// Prepended when the body is non-empty
        prefix: Option<String>,
        /// Appended when the body is non-empty
        suffix: Option<String>,
        /// Leading tokens stripped from the body
        prefix_overrides: Vec<String>,
        /// Trailing tokens stripped from the body
        suffix_overrides: Vec<String>,
        /// The wrapped body
        contents: Box<SqlNode>,
    },
    /// Variable declaration
    Bind {
        /// Binding name
        name: String,
        /// Expression evaluated against the context
        expression: String,
    },
}

impl SqlNode {
    /// `<where>`: Trim with prefix `WHERE`, stripping leading `AND`/`OR`
    pub fn where_node(contents: SqlNode) -> Self {
        Self::Trim {
            prefix: Some("WHERE".to_string()),
            suffix: None,
            prefix_overrides: vec!["AND".to_string(), "OR".to_string()],
            suffix_overrides: Vec::new(),
            contents: Box::new(contents),
        }
    }

    /// `<set>`: Trim with prefix `SET`, stripping trailing commas
    pub fn set_node(contents: SqlNode) -> Self {
        Self::Trim {
            prefix: Some("SET".to_string()),
            suffix: None,
            prefix_overrides: Vec::new(),
            suffix_overrides: vec![",".to_string()],
            contents: Box::new(contents),
        }
    }

    /// Whether this node forces per-invocation rendering
    pub fn is_dynamic(&self) -> bool {
        match self {
            Self::StaticText(_) => false,
            Self::Text(_) => true,
            Self::Mixed(children) => children.iter().any(SqlNode::is_dynamic),
            _ => true,
        }
    }

    /// Apply the node against the context
    pub fn apply(&self, ctx: &mut DynamicContext) -> Result<bool> {
        match self {
            Self::StaticText(text) => {
                ctx.append(text);
                Ok(!text.trim().is_empty())
            }
            Self::Text(text) => {
                let parser = TokenParser::new("${", "}");
                let substituted = parser.parse(text, &mut |content| {
                    let value = Evaluator::new(&ctx.bindings).eval(content)?;
                    Ok(value.render())
                })?;
                ctx.append(&substituted);
                Ok(!substituted.trim().is_empty())
            }
            Self::Mixed(children) => {
                let mut contributed = false;
                for child in children {
                    contributed |= child.apply(ctx)?;
                }
                Ok(contributed)
            }
            Self::If { test, contents } => {
                if Evaluator::new(&ctx.bindings).eval_bool(test)? {
                    contents.apply(ctx)?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Self::Choose { whens, otherwise } => {
                for (test, body) in whens {
                    if Evaluator::new(&ctx.bindings).eval_bool(test)? {
                        body.apply(ctx)?;
                        return Ok(true);
                    }
                }
                if let Some(body) = otherwise {
                    body.apply(ctx)?;
                    return Ok(true);
                }
                Ok(false)
            }
            Self::Foreach {
                collection,
                item,
                index,
                open,
                close,
                separator,
                contents,
            } => self.apply_foreach(
                ctx, collection, item, index, open, close, separator, contents,
            ),
            Self::Trim {
                prefix,
                suffix,
                prefix_overrides,
                suffix_overrides,
                contents,
            } => {
                let body = ctx.capture(|c| contents.apply(c))?;
                let mut text = body.trim().to_string();
                if let Some(stripped) = strip_override(&text, prefix_overrides, true) {
                    text = stripped;
                }
                if let Some(stripped) = strip_override(&text, suffix_overrides, false) {
                    text = stripped;
                }
                if text.is_empty() {
                    return Ok(false);
                }
                let mut out = String::new();
                if let Some(prefix) = prefix {
                    out.push_str(prefix);
                    out.push(' ');
                }
                out.push_str(&text);
                if let Some(suffix) = suffix {
                    out.push(' ');
                    out.push_str(suffix);
                }
                ctx.append(&out);
                Ok(true)
            }
            Self::Bind { name, expression } => {
                let value = Evaluator::new(&ctx.bindings).eval(expression)?;
                ctx.bindings.insert(name.clone(), value);
                Ok(false)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_foreach(
        &self,
        ctx: &mut DynamicContext,
        collection: &str,
        item: &Option<String>,
        index: &Option<String>,
        open: &str,
        close: &str,
        separator: &str,
        contents: &SqlNode,
    ) -> Result<bool> {
        let value = Evaluator::new(&ctx.bindings).eval(collection)?;
        let entries: Vec<(Value, Value)> = match value {
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, v)| (Value::Int64(i as i64), v))
                .collect(),
            Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| (Value::String(k), v))
                .collect(),
            Value::Null => Vec::new(),
            other => {
                return Err(Error::conversion(format!(
                    "foreach collection '{collection}' evaluated to non-iterable {}",
                    other.sql_type()
                )))
            }
        };

        let mut pieces = Vec::with_capacity(entries.len());
        for (index_value, item_value) in entries {
            let n = ctx.next_unique();
            if let Some(item) = item {
                ctx.bindings.insert(item.clone(), item_value.clone());
                ctx.bindings
                    .insert(itemized(item, n), item_value.clone());
            }
            if let Some(index) = index {
                ctx.bindings.insert(index.clone(), index_value.clone());
                ctx.bindings.insert(itemized(index, n), index_value);
            }
            let body = ctx.capture(|c| contents.apply(c))?;
            let body = rewrite_iteration_tokens(&body, item.as_deref(), index.as_deref(), n)?;
            let body = body.trim().to_string();
            if !body.is_empty() {
                pieces.push(body);
            }
        }

        let rendered = format!("{}{}{}", open, pieces.join(separator), close);
        if rendered.is_empty() {
            return Ok(false);
        }
        ctx.append(&rendered);
        Ok(true)
    }
}

fn itemized(name: &str, n: usize) -> String {
    format!("__frch_{name}_{n}")
}

/// Rewrite `#{item...}` placeholders of one iteration to the unique binding
/// recorded for it, so the later parameter pass resolves per-iteration
/// values.
fn rewrite_iteration_tokens(
    body: &str,
    item: Option<&str>,
    index: Option<&str>,
    n: usize,
) -> Result<String> {
    let parser = TokenParser::new("#{", "}");
    parser.parse(body, &mut |content| {
        let (head, rest) = match content.find(|c| c == '.' || c == '[' || c == ',') {
            Some(pos) => (&content[..pos], &content[pos..]),
            None => (content, ""),
        };
        let head = head.trim();
        let replaced = if Some(head) == item {
            itemized(head, n)
        } else if Some(head) == index {
            itemized(head, n)
        } else {
            head.to_string()
        };
        Ok(format!("#{{{replaced}{rest}}}"))
    })
}

fn strip_override(text: &str, overrides: &[String], prefix: bool) -> Option<String> {
    let upper = text.to_uppercase();
    for token in overrides {
        let token_upper = token.to_uppercase();
        let matches = if prefix {
            upper.starts_with(&token_upper)
        } else {
            upper.ends_with(&token_upper)
        };
        if !matches {
            continue;
        }
        // Alphabetic tokens need a word boundary so `AND` does not eat
        // a column named ANDERSON.
        let boundary_ok = if prefix {
            let rest = &text[token.len()..];
            !token_upper.ends_with(|c: char| c.is_alphanumeric())
                || rest.is_empty()
                || rest.starts_with(char::is_whitespace)
        } else {
            let rest = &text[..text.len() - token.len()];
            !token_upper.starts_with(|c: char| c.is_alphanumeric())
                || rest.is_empty()
                || rest.ends_with(char::is_whitespace)
        };
        if !boundary_ok {
            continue;
        }
        let stripped = if prefix {
            text[token.len()..].trim_start()
        } else {
            text[..text.len() - token.len()].trim_end()
        };
        return Some(stripped.to_string());
    }
    None
}

// ==================== SQL sources ====================

/// Re-renders the node tree per invocation.
pub struct DynamicSqlSource {
    root: SqlNode,
}

impl DynamicSqlSource {
    /// Create a source over a dynamic node tree
    pub fn new(root: SqlNode) -> Self {
        Self { root }
    }
}

impl SqlSource for DynamicSqlSource {
    fn bound_sql(&self, config: &Configuration, parameter: &Value) -> Result<BoundSql> {
        let mut ctx = DynamicContext::new(parameter.clone(), config.database_id.clone());
        self.root.apply(&mut ctx)?;
        let (sql, parameter_mappings) = apply_parameter_pass(ctx.sql())?;
        Ok(BoundSql {
            sql,
            parameter_mappings,
            additional: ctx.into_additional(),
        })
    }
}

/// Static SQL: the placeholder pass ran once at build time.
pub struct RawSqlSource {
    sql: String,
    parameter_mappings: Vec<crate::mapping::ParameterMapping>,
}

impl RawSqlSource {
    /// Render a static node tree once and cache the result
    pub fn new(root: &SqlNode) -> Result<Self> {
        let mut ctx = DynamicContext::new(Value::Null, None);
        root.apply(&mut ctx)?;
        let (sql, parameter_mappings) = apply_parameter_pass(ctx.sql())?;
        Ok(Self {
            sql,
            parameter_mappings,
        })
    }
}

impl SqlSource for RawSqlSource {
    fn bound_sql(&self, _config: &Configuration, _parameter: &Value) -> Result<BoundSql> {
        Ok(BoundSql {
            sql: self.sql.clone(),
            parameter_mappings: self.parameter_mappings.clone(),
            additional: IndexMap::new(),
        })
    }
}

/// Pre-built SQL and mappings, used for companion key statements.
pub struct StaticSqlSource {
    sql: String,
    parameter_mappings: Vec<crate::mapping::ParameterMapping>,
}

impl StaticSqlSource {
    /// Wrap already-processed SQL
    pub fn new(sql: impl Into<String>, parameter_mappings: Vec<crate::mapping::ParameterMapping>) -> Self {
        Self {
            sql: sql.into(),
            parameter_mappings,
        }
    }
}

impl SqlSource for StaticSqlSource {
    fn bound_sql(&self, _config: &Configuration, _parameter: &Value) -> Result<BoundSql> {
        Ok(BoundSql {
            sql: self.sql.clone(),
            parameter_mappings: self.parameter_mappings.clone(),
            additional: IndexMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(entries: Vec<(&str, Value)>) -> Value {
        Value::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    fn render(node: &SqlNode, parameter: Value) -> (String, Vec<String>) {
        let mut ctx = DynamicContext::new(parameter, None);
        node.apply(&mut ctx).unwrap();
        let (sql, mappings) = apply_parameter_pass(ctx.sql()).unwrap();
        (sql, mappings.into_iter().map(|m| m.property).collect())
    }

    #[test]
    fn static_text_renders_verbatim() {
        let node = SqlNode::StaticText("SELECT 1".to_string());
        let (sql, _) = render(&node, Value::Null);
        assert_eq!(sql, "SELECT 1");
    }

    #[test]
    fn if_includes_on_truthy_test() {
        let node = SqlNode::Mixed(vec![
            SqlNode::StaticText("SELECT * FROM orders".to_string()),
            SqlNode::where_node(SqlNode::Mixed(vec![
                SqlNode::If {
                    test: "uid != null".to_string(),
                    contents: Box::new(SqlNode::StaticText("AND user_id=#{uid}".to_string())),
                },
                SqlNode::If {
                    test: "min != null".to_string(),
                    contents: Box::new(SqlNode::StaticText("AND amount >= #{min}".to_string())),
                },
            ])),
        ]);

        let (sql, params) = render(
            &node,
            obj(vec![("uid", Value::from(3_i64)), ("min", Value::Null)]),
        );
        assert_eq!(sql, "SELECT * FROM orders WHERE user_id=?");
        assert_eq!(params, vec!["uid"]);

        let (sql, params) = render(&node, obj(vec![("uid", Value::Null), ("min", Value::Null)]));
        assert_eq!(sql, "SELECT * FROM orders");
        assert!(params.is_empty());
    }

    #[test]
    fn choose_picks_first_truthy_when() {
        let node = SqlNode::Choose {
            whens: vec![
                (
                    "kind == 'a'".to_string(),
                    SqlNode::StaticText("A".to_string()),
                ),
                (
                    "kind == 'b'".to_string(),
                    SqlNode::StaticText("B".to_string()),
                ),
            ],
            otherwise: Some(Box::new(SqlNode::StaticText("Z".to_string()))),
        };

        let (sql, _) = render(&node, obj(vec![("kind", Value::from("b"))]));
        assert_eq!(sql, "B");
        let (sql, _) = render(&node, obj(vec![("kind", Value::from("x"))]));
        assert_eq!(sql, "Z");
    }

    #[test]
    fn foreach_generates_unique_bindings() {
        let node = SqlNode::Mixed(vec![
            SqlNode::StaticText("SELECT * FROM t WHERE k IN".to_string()),
            SqlNode::Foreach {
                collection: "list".to_string(),
                item: Some("k".to_string()),
                index: None,
                open: "(".to_string(),
                close: ")".to_string(),
                separator: ",".to_string(),
                contents: Box::new(SqlNode::StaticText("#{k}".to_string())),
            },
        ]);

        let param = obj(vec![(
            "list",
            Value::Array(vec![
                Value::from(1_i64),
                Value::from(2_i64),
                Value::from(3_i64),
            ]),
        )]);
        let mut ctx = DynamicContext::new(param, None);
        node.apply(&mut ctx).unwrap();
        let (sql, mappings) = apply_parameter_pass(ctx.sql()).unwrap();
        assert_eq!(sql, "SELECT * FROM t WHERE k IN (?,?,?)");
        assert_eq!(mappings.len(), 3);

        let additional = ctx.into_additional();
        assert_eq!(additional.get("__frch_k_0"), Some(&Value::from(1_i64)));
        assert_eq!(additional.get("__frch_k_2"), Some(&Value::from(3_i64)));
    }

    #[test]
    fn foreach_over_empty_collection() {
        let plain = SqlNode::Foreach {
            collection: "list".to_string(),
            item: Some("k".to_string()),
            index: None,
            open: String::new(),
            close: String::new(),
            separator: ",".to_string(),
            contents: Box::new(SqlNode::StaticText("#{k}".to_string())),
        };
        let (sql, _) = render(&plain, obj(vec![("list", Value::Array(vec![]))]));
        assert_eq!(sql, "");

        let wrapped = SqlNode::Foreach {
            collection: "list".to_string(),
            item: Some("k".to_string()),
            index: None,
            open: "(".to_string(),
            close: ")".to_string(),
            separator: ",".to_string(),
            contents: Box::new(SqlNode::StaticText("#{k}".to_string())),
        };
        let (sql, _) = render(&wrapped, obj(vec![("list", Value::Array(vec![]))]));
        assert_eq!(sql, "()");
    }

    #[test]
    fn set_node_strips_trailing_comma() {
        let node = SqlNode::Mixed(vec![
            SqlNode::StaticText("UPDATE users".to_string()),
            SqlNode::set_node(SqlNode::Mixed(vec![
                SqlNode::If {
                    test: "name != null".to_string(),
                    contents: Box::new(SqlNode::StaticText("name=#{name},".to_string())),
                },
                SqlNode::If {
                    test: "age != null".to_string(),
                    contents: Box::new(SqlNode::StaticText("age=#{age},".to_string())),
                },
            ])),
            SqlNode::StaticText("WHERE id=#{id}".to_string()),
        ]);

        let (sql, params) = render(
            &node,
            obj(vec![
                ("name", Value::from("Ann")),
                ("age", Value::Null),
                ("id", Value::from(1_i64)),
            ]),
        );
        assert_eq!(sql, "UPDATE users SET name=? WHERE id=?");
        assert_eq!(params, vec!["name", "id"]);
    }

    #[test]
    fn trim_respects_word_boundaries() {
        let node = SqlNode::where_node(SqlNode::StaticText(
            "ANDERSON = #{name}".to_string(),
        ));
        let (sql, _) = render(&node, obj(vec![("name", Value::from("x"))]));
        assert_eq!(sql, "WHERE ANDERSON = ?");
    }

    #[test]
    fn bind_declares_a_variable() {
        let node = SqlNode::Mixed(vec![
            SqlNode::Bind {
                name: "pattern".to_string(),
                expression: "'%' + name + '%'".to_string(),
            },
            SqlNode::StaticText("SELECT * FROM u WHERE name LIKE #{pattern}".to_string()),
        ]);

        let param = obj(vec![("name", Value::from("ann"))]);
        let mut ctx = DynamicContext::new(param, None);
        node.apply(&mut ctx).unwrap();
        assert_eq!(
            ctx.bindings.get("pattern"),
            Some(&Value::from("%ann%"))
        );
    }

    #[test]
    fn text_node_substitutes_expressions_verbatim() {
        let node = SqlNode::Text("SELECT * FROM ${table} WHERE id = #{id}".to_string());
        let (sql, params) = render(&node, obj(vec![("table", Value::from("users"))]));
        assert_eq!(sql, "SELECT * FROM users WHERE id = ?");
        assert_eq!(params, vec!["id"]);
    }

    #[test]
    fn dynamic_detection() {
        assert!(!SqlNode::StaticText("x".into()).is_dynamic());
        assert!(SqlNode::Text("${x}".into()).is_dynamic());
        assert!(SqlNode::Mixed(vec![
            SqlNode::StaticText("a".into()),
            SqlNode::If {
                test: "x".into(),
                contents: Box::new(SqlNode::StaticText("b".into()))
            }
        ])
        .is_dynamic());
        assert!(!SqlNode::Mixed(vec![SqlNode::StaticText("a".into())]).is_dynamic());
    }

    #[test]
    fn marker_count_equals_mapping_count() {
        // Invariant: positional markers match the mapping list length.
        let node = SqlNode::Mixed(vec![
            SqlNode::StaticText("INSERT INTO t (a, b) VALUES (#{a}, #{b})".to_string()),
        ]);
        let (sql, params) = render(
            &node,
            obj(vec![("a", Value::from(1_i64)), ("b", Value::from(2_i64))]),
        );
        assert_eq!(sql.matches('?').count(), params.len());
    }
}
