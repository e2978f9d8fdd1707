//! Script builder
//!
//! Turns a statement element's body into a dynamic SQL node tree, expanding
//! `<include>` references (with scoped `<property>` substitution) first.

use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;

use crate::dynsql::tokens::{substitute_properties, TokenParser};
use crate::dynsql::{DynamicSqlSource, RawSqlSource, SqlNode};
use crate::error::{Error, Result};
use crate::mapping::SqlSource;

use super::xml::{XmlChild, XmlElement};

/// Replace every `<include refid="..."/>` in the element with the referenced
/// `<sql>` fragment's children, applying the include's `<property>` values
/// to the fragment's text and attributes. Fragment ids resolve first within
/// the namespace, then fully qualified.
pub fn expand_includes(
    element: &XmlElement,
    namespace: &str,
    fragments: &HashMap<String, XmlElement>,
) -> Result<XmlElement> {
    expand_with(element, namespace, fragments, &IndexMap::new())
}

fn expand_with(
    element: &XmlElement,
    namespace: &str,
    fragments: &HashMap<String, XmlElement>,
    properties: &IndexMap<String, String>,
) -> Result<XmlElement> {
    let mut out = XmlElement {
        name: element.name.clone(),
        attrs: element
            .attrs
            .iter()
            .map(|(k, v)| (k.clone(), substitute_properties(v, properties)))
            .collect(),
        children: Vec::new(),
    };
    for child in &element.children {
        match child {
            XmlChild::Text(text) => {
                out.children
                    .push(XmlChild::Text(substitute_properties(text, properties)));
            }
            XmlChild::Element(e) if e.name == "include" => {
                let refid = e.required_attr("refid")?;
                let refid = substitute_properties(refid, properties);
                let fragment = fragments
                    .get(&format!("{namespace}.{refid}"))
                    .or_else(|| fragments.get(refid.as_str()))
                    .ok_or_else(|| {
                        Error::incomplete(format!("sql fragment '{refid}' is not defined"))
                    })?;
                // Include-scoped properties shadow outer ones.
                let mut scoped = properties.clone();
                for prop in e.elements("property") {
                    scoped.insert(
                        prop.required_attr("name")?.to_string(),
                        substitute_properties(prop.required_attr("value")?, properties),
                    );
                }
                let expanded = expand_with(fragment, namespace, fragments, &scoped)?;
                out.children.extend(expanded.children);
            }
            XmlChild::Element(e) => {
                out.children.push(XmlChild::Element(expand_with(
                    e, namespace, fragments, properties,
                )?));
            }
        }
    }
    Ok(out)
}

fn split_overrides(attr: Option<&str>) -> Vec<String> {
    attr.map(|s| s.split('|').map(|t| t.trim().to_string()).collect())
        .unwrap_or_default()
}

/// Build the node tree for a statement body
pub fn build_script(element: &XmlElement) -> Result<SqlNode> {
    Ok(SqlNode::Mixed(parse_children(element)?))
}

fn parse_children(element: &XmlElement) -> Result<Vec<SqlNode>> {
    let dollar = TokenParser::new("${", "}");
    let mut nodes = Vec::new();
    for child in &element.children {
        match child {
            XmlChild::Text(text) => {
                if dollar.contains_token(text) {
                    nodes.push(SqlNode::Text(text.clone()));
                } else {
                    nodes.push(SqlNode::StaticText(text.clone()));
                }
            }
            XmlChild::Element(e) => nodes.push(parse_dynamic_element(e)?),
        }
    }
    Ok(nodes)
}

fn parse_dynamic_element(e: &XmlElement) -> Result<SqlNode> {
    Ok(match e.name.as_str() {
        "if" => SqlNode::If {
            test: e.required_attr("test")?.to_string(),
            contents: Box::new(SqlNode::Mixed(parse_children(e)?)),
        },
        "choose" => {
            let mut whens = Vec::new();
            for when in e.elements("when") {
                whens.push((
                    when.required_attr("test")?.to_string(),
                    SqlNode::Mixed(parse_children(when)?),
                ));
            }
            let otherwise = match e.first("otherwise") {
                Some(o) => Some(Box::new(SqlNode::Mixed(parse_children(o)?))),
                None => None,
            };
            SqlNode::Choose { whens, otherwise }
        }
        "where" => SqlNode::where_node(SqlNode::Mixed(parse_children(e)?)),
        "set" => SqlNode::set_node(SqlNode::Mixed(parse_children(e)?)),
        "trim" => SqlNode::Trim {
            prefix: e.attr("prefix").map(str::to_string),
            suffix: e.attr("suffix").map(str::to_string),
            prefix_overrides: split_overrides(e.attr("prefixOverrides")),
            suffix_overrides: split_overrides(e.attr("suffixOverrides")),
            contents: Box::new(SqlNode::Mixed(parse_children(e)?)),
        },
        "foreach" => SqlNode::Foreach {
            collection: e.required_attr("collection")?.to_string(),
            item: e.attr("item").map(str::to_string),
            index: e.attr("index").map(str::to_string),
            open: e.attr("open").unwrap_or_default().to_string(),
            close: e.attr("close").unwrap_or_default().to_string(),
            separator: e.attr("separator").unwrap_or_default().to_string(),
            contents: Box::new(SqlNode::Mixed(parse_children(e)?)),
        },
        "bind" => SqlNode::Bind {
            name: e.required_attr("name")?.to_string(),
            expression: e.required_attr("value")?.to_string(),
        },
        other => {
            return Err(Error::malformed(format!(
                "unknown dynamic SQL element <{other}>"
            )))
        }
    })
}

/// Build the SQL source for a statement body: raw sources for fully static
/// scripts, dynamic sources otherwise.
pub fn build_sql_source(element: &XmlElement) -> Result<Arc<dyn SqlSource>> {
    let root = build_script(element)?;
    if root.is_dynamic() {
        Ok(Arc::new(DynamicSqlSource::new(root)))
    } else {
        Ok(Arc::new(RawSqlSource::new(&root)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn includes_splice_fragment_children() {
        let fragment = XmlElement::parse("<sql id=\"cols\">id, ${extra}</sql>").unwrap();
        let mut fragments = HashMap::new();
        fragments.insert("u.cols".to_string(), fragment);

        let select = XmlElement::parse(
            r#"<select id="find">SELECT <include refid="cols"><property name="extra" value="name"/></include> FROM users</select>"#,
        )
        .unwrap();

        let expanded = expand_includes(&select, "u", &fragments).unwrap();
        let text: Vec<String> = expanded
            .children
            .iter()
            .filter_map(|c| match c {
                XmlChild::Text(t) => Some(t.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(text, vec!["SELECT", "id, name", "FROM users"]);
    }

    #[test]
    fn missing_fragment_defers() {
        let select =
            XmlElement::parse(r#"<select id="x"><include refid="ghost"/></select>"#).unwrap();
        let err = expand_includes(&select, "u", &HashMap::new()).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ConfigIncomplete);
    }

    #[test]
    fn static_scripts_build_raw_sources() {
        let el = XmlElement::parse("<select>SELECT * FROM t WHERE a = #{a}</select>").unwrap();
        let node = build_script(&el).unwrap();
        assert!(!node.is_dynamic());
    }

    #[test]
    fn tags_make_scripts_dynamic() {
        let el = XmlElement::parse(
            r#"<select>SELECT * FROM t <if test="a != null">WHERE a = #{a}</if></select>"#,
        )
        .unwrap();
        assert!(build_script(&el).unwrap().is_dynamic());

        let el = XmlElement::parse("<select>SELECT * FROM ${table}</select>").unwrap();
        assert!(build_script(&el).unwrap().is_dynamic());
    }

    #[test]
    fn unknown_elements_are_rejected() {
        let el = XmlElement::parse("<select><frobnicate/></select>").unwrap();
        assert!(build_script(&el).is_err());
    }
}
