//! `${{ ... }}` templates for sources whose path depends on other sources.
//!
//! An expression names a dependency followed by a dot path into its payload,
//! for example `${{ user.id }}` or `${{ user.teams[0].slug }}`. The first
//! segment selects the dependency, the rest is walked with [`select_path`].

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template expression '{0}' has no closing '}}}}'")]
    Unterminated(String),

    #[error("template expression '{0}' refers to an unknown dependency")]
    UnknownDependency(String),

    #[error("template expression '{0}' did not resolve to a value")]
    Missing(String),
}

/// Extracts template expressions from a string value.
///
/// Returned expressions do not include `${{` or `}}` delimiters.
pub fn extract_template_expressions(value: &str) -> Vec<String> {
    let mut expressions = Vec::new();
    let mut remainder = value;

    while let Some(start) = remainder.find("${{") {
        let after_start = &remainder[start + 3..];
        let Some(end) = after_start.find("}}") else {
            break;
        };
        let expression = after_start[..end].trim();
        if !expression.is_empty() {
            expressions.push(expression.to_string());
        }
        remainder = &after_start[end + 2..];
    }

    expressions
}

/// Returns `true` when `value` contains at least one template marker.
pub fn is_template(value: &str) -> bool {
    value.contains("${{")
}

/// Split an expression into the dependency name and the remaining path.
///
/// ```rust
/// use sluice_engine::templates::split_dependency;
///
/// assert_eq!(split_dependency("user.teams[0].slug"), ("user", Some("teams[0].slug")));
/// assert_eq!(split_dependency("user"), ("user", None));
/// assert_eq!(split_dependency("items[1]"), ("items", Some("[1]")));
/// ```
pub fn split_dependency(expression: &str) -> (&str, Option<&str>) {
    let expression = expression.trim();
    match expression.find(['.', '[']) {
        Some(index) if expression.as_bytes()[index] == b'.' => (&expression[..index], Some(&expression[index + 1..])),
        Some(index) => (&expression[..index], Some(&expression[index..])),
        None => (expression, None),
    }
}

/// Render a template, resolving each expression through `lookup`.
///
/// `lookup` receives the dependency name and returns its payload. Unlike
/// workflow interpolation, a missing value is an error: a source path with a
/// hole in it would silently hit the wrong endpoint.
pub fn render_template(template: &str, lookup: &dyn Fn(&str) -> Option<Value>) -> Result<String, TemplateError> {
    let mut output = String::with_capacity(template.len());
    let mut remaining = template;

    while let Some(start) = remaining.find("${{") {
        let (before, after) = remaining.split_at(start);
        output.push_str(before);

        let Some(end) = after.find("}}") else {
            return Err(TemplateError::Unterminated(after.to_string()));
        };
        let expression = after[3..end].trim();
        let (dependency, path) = split_dependency(expression);
        let payload = lookup(dependency).ok_or_else(|| TemplateError::UnknownDependency(expression.to_string()))?;
        let value = select_path(&payload, path).ok_or_else(|| TemplateError::Missing(expression.to_string()))?;
        if value.is_null() {
            return Err(TemplateError::Missing(expression.to_string()));
        }
        output.push_str(&format_json_value(&value));
        remaining = &after[end + 2..];
    }

    output.push_str(remaining);
    Ok(output)
}

/// Select a nested JSON value by a minimal dot path with optional numeric indices.
///
/// Supports segments like `a`, `a.b`, and array indices `a[0].b[1]`. Returns `None`
/// when any segment is missing or applied to the wrong JSON type. When `path` is
/// `None`, the input `value` is cloned and returned as-is.
pub fn select_path(value: &Value, path: Option<&str>) -> Option<Value> {
    let Some(path) = path else {
        return Some(value.clone());
    };
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Some(value.clone());
    }

    let mut current = value;
    for segment in trimmed.split('.') {
        if segment.is_empty() {
            continue;
        }
        let (key, indices) = split_indices(segment);
        if !key.is_empty() {
            current = current.get(key)?;
        }
        for idx in indices {
            current = current.get(idx)?;
        }
    }
    Some(current.clone())
}

fn split_indices(segment: &str) -> (&str, Vec<usize>) {
    let key_end = segment.find('[').unwrap_or(segment.len());
    let key = &segment[..key_end];
    let indices = segment[key_end..]
        .split('[')
        .filter_map(|part| part.strip_suffix(']'))
        .filter_map(|index| index.trim().parse::<usize>().ok())
        .collect();
    (key, indices)
}

fn format_json_value(value: &Value) -> String {
    match value {
        Value::String(string_value) => string_value.clone(),
        Value::Number(number_value) => number_value.to_string(),
        Value::Bool(boolean_value) => boolean_value.to_string(),
        Value::Null => String::new(),
        other_value => other_value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lookup(name: &str) -> Option<Value> {
        match name {
            "user" => Some(json!({ "id": 7, "teams": [{ "slug": "core" }], "name": "Ada" })),
            "default" => Some(json!({ "values": [10, 20] })),
            _ => None,
        }
    }

    #[test]
    fn extracts_expressions() {
        assert_eq!(
            extract_template_expressions("/u/${{ user.id }}/t/${{user.teams[0].slug}}"),
            vec!["user.id".to_string(), "user.teams[0].slug".to_string()]
        );
        assert!(extract_template_expressions("/plain/path").is_empty());
        assert!(extract_template_expressions("/broken/${{ user.id").is_empty());
    }

    #[test]
    fn renders_nested_paths() {
        assert_eq!(render_template("/api/user/${{ user.id }}/posts", &lookup).unwrap(), "/api/user/7/posts");
        assert_eq!(render_template("/teams/${{ user.teams[0].slug }}", &lookup).unwrap(), "/teams/core");
        assert_eq!(render_template("/n/${{ default.values[1] }}", &lookup).unwrap(), "/n/20");
        assert_eq!(render_template("/static", &lookup).unwrap(), "/static");
    }

    #[test]
    fn missing_values_are_errors() {
        assert_eq!(
            render_template("/x/${{ team.id }}", &lookup),
            Err(TemplateError::UnknownDependency("team.id".into()))
        );
        assert_eq!(
            render_template("/x/${{ user.missing }}", &lookup),
            Err(TemplateError::Missing("user.missing".into()))
        );
        assert!(matches!(render_template("/x/${{ user.id", &lookup), Err(TemplateError::Unterminated(_))));
    }

    #[test]
    fn select_path_handles_indices() {
        let value = json!({ "a": [{ "b": [1, 2, 3] }] });
        assert_eq!(select_path(&value, Some("a[0].b[2]")), Some(json!(3)));
        assert_eq!(select_path(&value, Some("a[1]")), None);
        assert_eq!(select_path(&value, None), Some(value.clone()));
    }
}
