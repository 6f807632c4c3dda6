//! `${path}` expression resolution against a workflow scope.
//!
//! An expression is literal text with zero or more placeholders. A path is a
//! root name followed by `.key`, `[index]` or `['quoted key']` segments:
//!
//! ```text
//! ${inputs.text}
//! ${steps.analyze.topics[0].title}
//! ${steps['fetch-page'].body}
//! ```
//!
//! Resolution is attribute and index traversal only. A template that is
//! exactly one placeholder yields the referenced value unchanged; anything
//! else is rendered to a string. `$${` escapes a literal `${`.

use dagent_types::error::ResolutionError;
use serde_json::Value;

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// One traversal step within a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Segment::Key(k) => f.write_str(k),
            Segment::Index(i) => write!(f, "[{i}]"),
        }
    }
}

/// A parsed reference such as `steps.load.items[2]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    raw: String,
    segments: Vec<Segment>,
}

impl Path {
    /// Parse the text between `${` and `}`.
    pub fn parse(raw: &str) -> Result<Self, ResolutionError> {
        let text = raw.trim();
        let syntax = |reason: &str| ResolutionError::Syntax {
            expression: raw.to_string(),
            reason: reason.to_string(),
        };

        if text.is_empty() {
            return Err(syntax("empty path"));
        }

        let chars: Vec<char> = text.chars().collect();
        let mut segments = Vec::new();
        let mut i = 0;
        let mut expect_key = true;

        while i < chars.len() {
            match chars[i] {
                '.' => {
                    if expect_key {
                        return Err(syntax("empty segment"));
                    }
                    expect_key = true;
                    i += 1;
                }
                '[' => {
                    if expect_key && !segments.is_empty() {
                        return Err(syntax("'[' cannot follow '.'"));
                    }
                    if segments.is_empty() {
                        return Err(syntax("path must start with a name"));
                    }
                    let (segment, next) = parse_bracket(&chars, i + 1).map_err(|r| syntax(r))?;
                    segments.push(segment);
                    expect_key = false;
                    i = next;
                }
                ']' => return Err(syntax("unmatched ']'")),
                c if c.is_whitespace() => return Err(syntax("whitespace inside path")),
                _ => {
                    if !expect_key {
                        return Err(syntax("expected '.' or '[' between segments"));
                    }
                    let start = i;
                    while i < chars.len() && !matches!(chars[i], '.' | '[' | ']') && !chars[i].is_whitespace() {
                        i += 1;
                    }
                    let key: String = chars[start..i].iter().collect();
                    segments.push(Segment::Key(key));
                    expect_key = false;
                }
            }
        }

        if expect_key {
            return Err(syntax("path ends with '.'"));
        }

        Ok(Self {
            raw: text.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// The first segment, which names a scope root.
    pub fn root(&self) -> &str {
        match self.segments.first() {
            Some(Segment::Key(k)) => k,
            _ => "",
        }
    }

    /// Walk `value` along every segment after the root.
    pub fn traverse<'v>(&self, value: &'v Value) -> Result<&'v Value, ResolutionError> {
        self.traverse_from(value, 1)
    }

    /// Walk `value` along the whole path, root included.
    pub fn lookup<'v>(&self, value: &'v Value) -> Result<&'v Value, ResolutionError> {
        self.traverse_from(value, 0)
    }

    fn traverse_from<'v>(&self, value: &'v Value, skip: usize) -> Result<&'v Value, ResolutionError> {
        let mut current = value;
        for segment in self.segments.iter().skip(skip) {
            current = self.step_into(current, segment)?;
        }
        Ok(current)
    }

    fn step_into<'v>(&self, current: &'v Value, segment: &Segment) -> Result<&'v Value, ResolutionError> {
        match (current, segment) {
            (Value::Object(map), Segment::Key(key)) => {
                map.get(key).ok_or_else(|| ResolutionError::MissingKey {
                    path: self.raw.clone(),
                    segment: key.clone(),
                })
            }
            (Value::Array(items), Segment::Index(index)) => {
                self.index_into(items, *index, segment.to_string())
            }
            // `items.0` reads the same as `items[0]`
            (Value::Array(items), Segment::Key(key)) if is_index(key) => {
                let index = key.parse::<usize>().map_err(|_| ResolutionError::NotTraversable {
                    path: self.raw.clone(),
                    segment: key.clone(),
                    found: "array".to_string(),
                })?;
                self.index_into(items, index, key.clone())
            }
            (other, segment) => Err(ResolutionError::NotTraversable {
                path: self.raw.clone(),
                segment: segment.to_string(),
                found: type_name(other).to_string(),
            }),
        }
    }

    fn index_into<'v>(
        &self,
        items: &'v [Value],
        index: usize,
        segment: String,
    ) -> Result<&'v Value, ResolutionError> {
        items.get(index).ok_or_else(|| ResolutionError::IndexOutOfRange {
            path: self.raw.clone(),
            segment,
            index,
            len: items.len(),
        })
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Parse `0]`, `'key']` or `"key"]` starting just after `[`.
fn parse_bracket(chars: &[char], mut i: usize) -> Result<(Segment, usize), &'static str> {
    match chars.get(i) {
        Some(&quote @ ('\'' | '"')) => {
            i += 1;
            let start = i;
            while i < chars.len() && chars[i] != quote {
                i += 1;
            }
            if i >= chars.len() {
                return Err("unterminated quoted key");
            }
            let key: String = chars[start..i].iter().collect();
            i += 1;
            if chars.get(i) != Some(&']') {
                return Err("expected ']' after quoted key");
            }
            Ok((Segment::Key(key), i + 1))
        }
        Some(_) => {
            let start = i;
            while i < chars.len() && chars[i] != ']' {
                i += 1;
            }
            if i >= chars.len() {
                return Err("unterminated '['");
            }
            let digits: String = chars[start..i].iter().collect();
            let index = digits
                .trim()
                .parse::<usize>()
                .map_err(|_| "index must be a non-negative integer")?;
            Ok((Segment::Index(index), i + 1))
        }
        None => Err("unterminated '['"),
    }
}

fn is_index(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(|b| b.is_ascii_digit())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Named roots an expression may reference (`inputs`, `steps`, `input`, ...).
///
/// Borrowed, so layering a step's local `input` over a context snapshot
/// costs nothing.
#[derive(Debug, Clone, Default)]
pub struct Scope<'a> {
    roots: Vec<(&'a str, &'a Value)>,
}

impl<'a> Scope<'a> {
    pub fn new() -> Self {
        Self { roots: Vec::new() }
    }

    /// Add or shadow a root.
    pub fn with(mut self, name: &'a str, value: &'a Value) -> Self {
        self.roots.retain(|(n, _)| *n != name);
        self.roots.push((name, value));
        self
    }

    pub fn get(&self, name: &str) -> Option<&'a Value> {
        self.roots.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
    }

    pub fn lookup(&self, path: &Path) -> Result<&'a Value, ResolutionError> {
        let root = path.root();
        let value = self.get(root).ok_or_else(|| ResolutionError::MissingKey {
            path: path.as_str().to_string(),
            segment: root.to_string(),
        })?;
        path.traverse(value)
    }
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Placeholder(Path),
}

/// A parsed expression string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    parts: Vec<Part>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, ResolutionError> {
        let syntax = |reason: &str| ResolutionError::Syntax {
            expression: source.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut rest = source;

        while let Some(pos) = rest.find('$') {
            literal.push_str(&rest[..pos]);
            let after = &rest[pos..];

            if after.starts_with("$${") {
                literal.push_str("${");
                rest = &after[3..];
            } else if let Some(body) = after.strip_prefix("${") {
                let end = closing_brace(body).ok_or_else(|| syntax("unterminated '${'"))?;
                if !literal.is_empty() {
                    parts.push(Part::Literal(std::mem::take(&mut literal)));
                }
                let path = Path::parse(&body[..end]).map_err(|e| match e {
                    ResolutionError::Syntax { reason, .. } => syntax(&reason),
                    other => other,
                })?;
                parts.push(Part::Placeholder(path));
                rest = &body[end + 1..];
            } else {
                literal.push('$');
                rest = &after[1..];
            }
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            parts,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when the whole template is one placeholder with no literal text.
    pub fn is_single_placeholder(&self) -> bool {
        matches!(self.parts.as_slice(), [Part::Placeholder(_)])
    }

    /// Every path this template references, in order.
    pub fn references(&self) -> impl Iterator<Item = &Path> {
        self.parts.iter().filter_map(|p| match p {
            Part::Placeholder(path) => Some(path),
            Part::Literal(_) => None,
        })
    }

    /// Whether any placeholder reads from the given root.
    pub fn references_root(&self, root: &str) -> bool {
        self.references().any(|p| p.root() == root)
    }

    /// Resolve against `scope`.
    ///
    /// A single placeholder keeps the value's native type; mixed templates
    /// become strings. Templates without placeholders resolve to their
    /// literal text.
    pub fn resolve(&self, scope: &Scope<'_>) -> Result<Value, ResolutionError> {
        if let [Part::Placeholder(path)] = self.parts.as_slice() {
            return scope.lookup(path).cloned();
        }

        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Placeholder(path) => out.push_str(&value_to_string(scope.lookup(path)?)),
            }
        }
        Ok(Value::String(out))
    }
}

/// Index of the `}` closing a placeholder body, skipping quoted keys.
fn closing_brace(body: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in body.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '}') => return Some(i),
            (None, _) => {}
        }
    }
    None
}

/// Parse and resolve in one call.
pub fn resolve_expression(expression: &str, scope: &Scope<'_>) -> Result<Value, ResolutionError> {
    Template::parse(expression)?.resolve(scope)
}

/// Convert a JSON value to its interpolated string form.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // Objects and arrays render as compact JSON
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
