//! Property path tokenizer and value-graph navigation
//!
//! Paths are dotted and index-bracketed: `order[0].item[key].name`. Reads
//! through a missing link yield `None`; writes auto-create intermediate
//! objects and extend arrays as needed.

use sqlweave_rdbc::Value;

/// One parsed path segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSegment<'a> {
    /// Base property name
    pub name: &'a str,
    /// Bracket contents, if present; a numeric string or a map key
    pub index: Option<&'a str>,
}

impl PathSegment<'_> {
    /// Base name plus bracketed index, e.g. `item[key]`
    pub fn indexed_name(&self) -> String {
        match self.index {
            Some(idx) => format!("{}[{}]", self.name, idx),
            None => self.name.to_string(),
        }
    }
}

/// Lazy iterator over the segments of a property path
pub struct PropertyPath<'a> {
    rest: &'a str,
}

impl<'a> PropertyPath<'a> {
    /// Parse a path into its segment iterator
    pub fn parse(path: &'a str) -> Self {
        Self { rest: path }
    }

    /// The first segment's base name, without consuming the iterator
    pub fn first_name(path: &str) -> &str {
        let end = path
            .find(|c| c == '.' || c == '[')
            .unwrap_or(path.len());
        &path[..end]
    }
}

impl<'a> Iterator for PropertyPath<'a> {
    type Item = PathSegment<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        let (head, tail) = match self.rest.find('.') {
            Some(pos) => (&self.rest[..pos], &self.rest[pos + 1..]),
            None => (self.rest, ""),
        };
        self.rest = tail;

        match head.find('[') {
            Some(open) => {
                let name = &head[..open];
                let index = head[open + 1..].strip_suffix(']').unwrap_or(&head[open + 1..]);
                Some(PathSegment {
                    name,
                    index: Some(index),
                })
            }
            None => Some(PathSegment {
                name: head,
                index: None,
            }),
        }
    }
}

fn get_segment<'v>(value: &'v Value, segment: &PathSegment<'_>) -> Option<&'v Value> {
    let base = if segment.name.is_empty() {
        value
    } else {
        value.as_object()?.get(segment.name)?
    };
    match segment.index {
        None => Some(base),
        Some(idx) => match base {
            Value::Array(items) => items.get(idx.parse::<usize>().ok()?),
            Value::Object(map) => map.get(idx),
            _ => None,
        },
    }
}

/// Read a value through a property path. Missing links yield `None`.
pub fn get_path<'v>(root: &'v Value, path: &str) -> Option<&'v Value> {
    let mut current = root;
    for segment in PropertyPath::parse(path) {
        current = get_segment(current, &segment)?;
    }
    Some(current)
}

fn ensure_object(value: &mut Value) -> &mut indexmap::IndexMap<String, Value> {
    if !matches!(value, Value::Object(_)) {
        *value = Value::Object(indexmap::IndexMap::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

fn slot_for<'v>(value: &'v mut Value, segment: &PathSegment<'_>) -> &'v mut Value {
    let base = if segment.name.is_empty() {
        value
    } else {
        ensure_object(value)
            .entry(segment.name.to_string())
            .or_insert(Value::Null)
    };
    match segment.index {
        None => base,
        Some(idx) => {
            if let Ok(n) = idx.parse::<usize>() {
                if !matches!(base, Value::Array(_)) {
                    *base = Value::Array(Vec::new());
                }
                if let Value::Array(items) = base {
                    while items.len() <= n {
                        items.push(Value::Null);
                    }
                    &mut items[n]
                } else {
                    unreachable!()
                }
            } else {
                ensure_object(base)
                    .entry(idx.to_string())
                    .or_insert(Value::Null)
            }
        }
    }
}

/// Write a value through a property path, auto-creating intermediates.
pub fn set_path(root: &mut Value, path: &str, value: Value) {
    let segments: Vec<PathSegment<'_>> = PropertyPath::parse(path).collect();
    let mut current = root;
    for segment in &segments {
        current = slot_for(current, segment);
    }
    *current = value;
}
