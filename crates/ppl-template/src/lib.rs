// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! ppl-template
#![deny(unsafe_code)]
#![warn(missing_docs)]

use ppl_core::EngineError;
use ppl_core::text::canonical_string;
use serde_json::Value;

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// The typed variable scope a template renders against.
///
/// Only the active unit's namespace is bound: a chunk step sees `chunk.*`
/// but no `row.*`, and vice versa. `all.<output>` lists hold prior step
/// outputs across units, populated from successfully-emitted units only.
#[derive(Debug, Clone)]
pub struct Scope {
    root: serde_json::Map<String, Value>,
    join_max_chars: usize,
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope {
    /// An empty scope with no join cap.
    pub fn new() -> Self {
        Self {
            root: serde_json::Map::new(),
            join_max_chars: usize::MAX,
        }
    }

    /// Cap the length of any rendered `join(...)` result, in characters.
    #[must_use]
    pub fn with_join_cap(mut self, max_chars: usize) -> Self {
        self.join_max_chars = max_chars;
        self
    }

    /// Bind a top-level name (`run_id`, `row_index`, a user binding).
    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.root.insert(name.into(), value);
    }

    /// Bind a unit namespace (`document`, `chunk`, `row`) to a whole value.
    pub fn bind_namespace(&mut self, namespace: impl Into<String>, value: Value) {
        self.root.insert(namespace.into(), value);
    }

    /// Append prior step outputs under `all.<output_name>`.
    pub fn set_all(&mut self, output_name: &str, values: Vec<Value>) {
        let all = self
            .root
            .entry("all".to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if let Value::Object(map) = all {
            map.insert(output_name.to_string(), Value::Array(values));
        }
    }

    /// Walk a dot-path against the scope.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.root.get(first)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => {
                    let idx: usize = segment.parse().ok()?;
                    items.get(idx)?
                }
                _ => return None,
            };
        }
        Some(current)
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Render a template against a scope in a single pass.
///
/// # Errors
///
/// - [`EngineError::Processing`] for a missing path without a default.
/// - [`EngineError::Config`] for malformed expressions or unknown functions.
pub fn render(template: &str, scope: &Scope) -> Result<String, EngineError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            EngineError::Config(format!("unterminated ${{...}} expression in: {template}"))
        })?;
        let expr = &after[..end];
        out.push_str(&evaluate(expr.trim(), scope)?);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn evaluate(expr: &str, scope: &Scope) -> Result<String, EngineError> {
    if let Some((name, args)) = split_call(expr) {
        if name != "join" {
            return Err(EngineError::Config(format!(
                "unknown template function: {name}"
            )));
        }
        return evaluate_join(args, scope);
    }

    let (path, default) = split_default(expr)?;
    match scope.lookup(path) {
        Some(value) => Ok(canonical_string(value)),
        None => match default {
            Some(text) => Ok(text),
            None => Err(EngineError::processing(format!(
                "unresolved template path: {path}"
            ))),
        },
    }
}

/// Recognise `name(args)` call syntax. Returns `None` for plain paths.
fn split_call(expr: &str) -> Option<(&str, &str)> {
    let open = expr.find('(')?;
    let name = &expr[..open];
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    let rest = &expr[open + 1..];
    let close = rest.rfind(')')?;
    Some((name, &rest[..close]))
}

fn evaluate_join(args: &str, scope: &Scope) -> Result<String, EngineError> {
    let (path_part, sep_part) = split_top_level_comma(args).ok_or_else(|| {
        EngineError::Config(format!("join expects (list, \"sep\"), got: join({args})"))
    })?;
    let path = path_part.trim();
    let sep = unquote(sep_part.trim()).ok_or_else(|| {
        EngineError::Config(format!("join separator must be a quoted string: {sep_part}"))
    })?;

    let value = scope.lookup(path).ok_or_else(|| {
        EngineError::processing(format!("unresolved template path: {path}"))
    })?;
    let items = match value {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    };

    let mut joined = items
        .iter()
        .map(canonical_string)
        .collect::<Vec<_>>()
        .join(&sep);
    if joined.chars().count() > scope.join_max_chars {
        joined = joined.chars().take(scope.join_max_chars).collect();
    }
    Ok(joined)
}

/// Split `path | "default"` at the first pipe outside quotes.
fn split_default(expr: &str) -> Result<(&str, Option<String>), EngineError> {
    let mut in_quotes = false;
    for (i, c) in expr.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '|' if !in_quotes => {
                let path = expr[..i].trim();
                let raw = expr[i + 1..].trim();
                let default = unquote(raw).ok_or_else(|| {
                    EngineError::Config(format!(
                        "template default must be a quoted string: {raw}"
                    ))
                })?;
                return Ok((path, Some(default)));
            }
            _ => {}
        }
    }
    Ok((expr.trim(), None))
}

fn split_top_level_comma(args: &str) -> Option<(&str, &str)> {
    let mut in_quotes = false;
    for (i, c) in args.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => return Some((&args[..i], &args[i + 1..])),
            _ => {}
        }
    }
    None
}

fn unquote(raw: &str) -> Option<String> {
    let inner = raw.strip_prefix('"')?.strip_suffix('"')?;
    Some(inner.replace("\\n", "\n").replace("\\\"", "\""))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row_scope() -> Scope {
        let mut scope = Scope::new();
        scope.bind_namespace(
            "row",
            json!({"text": "ok", "values": {"id": "1"}, "row_index": 0}),
        );
        scope.bind("row_index", json!(0));
        scope.bind("run_id", json!("20260101T000000Z"));
        scope
    }

    // -- Path resolution --

    #[test]
    fn plain_path_renders() {
        let scope = row_scope();
        assert_eq!(render("Echo: ${row.text}", &scope).unwrap(), "Echo: ok");
    }

    #[test]
    fn nested_path_renders() {
        let scope = row_scope();
        assert_eq!(render("${row.values.id}", &scope).unwrap(), "1");
    }

    #[test]
    fn top_level_bindings_render() {
        let scope = row_scope();
        assert_eq!(
            render("run ${run_id} row ${row_index}", &scope).unwrap(),
            "run 20260101T000000Z row 0"
        );
    }

    #[test]
    fn literal_text_passes_through() {
        let scope = row_scope();
        assert_eq!(render("no vars, $5 cost", &scope).unwrap(), "no vars, $5 cost");
    }

    #[test]
    fn multiple_expressions_in_one_template() {
        let scope = row_scope();
        assert_eq!(
            render("${row.text}-${row.text}", &scope).unwrap(),
            "ok-ok"
        );
    }

    // -- Missing paths and defaults --

    #[test]
    fn missing_path_is_processing_error() {
        let scope = row_scope();
        let err = render("${chunk.text}", &scope).unwrap_err();
        assert!(matches!(err, EngineError::Processing { .. }));
        assert!(err.to_string().contains("chunk.text"));
    }

    #[test]
    fn default_rescues_missing_path() {
        let scope = row_scope();
        assert_eq!(
            render("${chunk.text | \"n/a\"}", &scope).unwrap(),
            "n/a"
        );
    }

    #[test]
    fn default_ignored_when_path_resolves() {
        let scope = row_scope();
        assert_eq!(render("${row.text | \"n/a\"}", &scope).unwrap(), "ok");
    }

    #[test]
    fn unquoted_default_is_config_error() {
        let scope = row_scope();
        let err = render("${chunk.text | n/a}", &scope).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    // -- join --

    #[test]
    fn join_flattens_all_list() {
        let mut scope = Scope::new();
        scope.set_all("summary", vec![json!("a"), json!("b"), json!("c")]);
        assert_eq!(
            render("${join(all.summary, \", \")}", &scope).unwrap(),
            "a, b, c"
        );
    }

    #[test]
    fn join_with_newline_separator() {
        let mut scope = Scope::new();
        scope.set_all("summary", vec![json!("a"), json!("b")]);
        assert_eq!(
            render("${join(all.summary, \"\\n\")}", &scope).unwrap(),
            "a\nb"
        );
    }

    #[test]
    fn join_respects_cap() {
        let mut scope = Scope::new().with_join_cap(3);
        scope.set_all("x", vec![json!("abcdef")]);
        assert_eq!(render("${join(all.x, \",\")}", &scope).unwrap(), "abc");
    }

    #[test]
    fn join_stringifies_objects_compactly() {
        let mut scope = Scope::new();
        scope.set_all("x", vec![json!({"tag": "a"}), json!({"tag": "b"})]);
        assert_eq!(
            render("${join(all.x, \";\")}", &scope).unwrap(),
            r#"{"tag":"a"};{"tag":"b"}"#
        );
    }

    #[test]
    fn unknown_function_is_config_error() {
        let scope = row_scope();
        let err = render("${upper(row.text)}", &scope).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        assert!(err.to_string().contains("upper"));
    }

    #[test]
    fn join_missing_list_is_processing_error() {
        let scope = Scope::new();
        let err = render("${join(all.absent, \",\")}", &scope).unwrap_err();
        assert!(matches!(err, EngineError::Processing { .. }));
    }

    // -- Malformed templates --

    #[test]
    fn unterminated_expression_is_config_error() {
        let scope = row_scope();
        let err = render("${row.text", &scope).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    // -- Single pass --

    #[test]
    fn interpolation_is_single_pass() {
        let mut scope = Scope::new();
        scope.bind("a", json!("${b}"));
        scope.bind("b", json!("secret"));
        // The value of `a` is emitted verbatim, never re-interpolated.
        assert_eq!(render("${a}", &scope).unwrap(), "${b}");
    }

    // -- Canonical stringification --

    #[test]
    fn containers_render_as_compact_json() {
        let mut scope = Scope::new();
        scope.bind("list", json!([1, 2]));
        scope.bind("map", json!({"k": true}));
        assert_eq!(render("${list} ${map}", &scope).unwrap(), r#"[1,2] {"k":true}"#);
    }
}
