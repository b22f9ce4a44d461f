// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Document URI translation between the client's workspace namespace and the
//! session's on-disk cache namespace.
//!
//! Payload bodies stay untyped (`serde_json::Value`); the walker is driven by
//! the closed set of URI-bearing field names in the LSP schema rather than by
//! per-method knowledge, so new methods that reuse the standard field names
//! need no code changes here.

use serde_json::Value;

/// Field names whose string values are document URIs in the LSP schema.
///
/// `changes` is special-cased in the walker: it is a map whose *keys* are
/// URIs.
const URI_KEYS: &[&str] = &["uri", "rootUri", "targetUri", "newUri", "oldUri", "scopeUri"];

/// A pure prefix mapping over `file://` URIs.
///
/// URIs with another scheme, and file URIs whose path does not lie under the
/// source prefix, pass through untranslated. The suffix below the prefix is
/// preserved byte-for-byte, so translating there and back is the identity.
#[derive(Debug, Clone)]
pub struct UriTranslator {
    from: String,
    to: String,
}

impl UriTranslator {
    /// Creates a translator mapping paths under `from` to paths under `to`.
    ///
    /// Both prefixes are absolute paths without a trailing slash, except the
    /// filesystem root `/` itself.
    #[must_use]
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: normalize_prefix(from.into()),
            to: normalize_prefix(to.into()),
        }
    }

    /// The inverse mapping.
    #[must_use]
    pub fn inverse(&self) -> Self {
        Self {
            from: self.to.clone(),
            to: self.from.clone(),
        }
    }

    /// Translates one URI, or returns `None` when it is not a file URI under
    /// the source prefix.
    #[must_use]
    pub fn apply(&self, uri: &str) -> Option<String> {
        let path = uri.strip_prefix("file://")?;
        let rest = strip_path_prefix(path, &self.from)?;

        let new_path = if rest.is_empty() {
            self.to.clone()
        } else if self.to == "/" {
            rest.to_string()
        } else {
            format!("{}{}", self.to, rest)
        };

        Some(format!("file://{new_path}"))
    }
}

/// Strips a path prefix along component boundaries. The remainder is empty
/// or starts with `/`.
fn strip_path_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix == "/" {
        return path.starts_with('/').then_some(path);
    }
    let rest = path.strip_prefix(prefix)?;
    (rest.is_empty() || rest.starts_with('/')).then_some(rest)
}

fn normalize_prefix(mut prefix: String) -> String {
    while prefix.len() > 1 && prefix.ends_with('/') {
        prefix.pop();
    }
    if prefix.is_empty() {
        prefix.push('/');
    }
    prefix
}

/// Rewrites every URI-positioned string in `value` in place and returns the
/// translated values.
///
/// Walks nested maps and arrays; array elements inherit the key context of
/// their parent, and the keys of `changes` maps are themselves translated.
/// Strings the translator declines are left untouched and not reported.
pub fn rewrite_tree(value: &mut Value, translator: &UriTranslator) -> Vec<String> {
    let mut translated = Vec::new();
    walk(value, translator, &mut translated);
    translated
}

fn walk(value: &mut Value, translator: &UriTranslator, translated: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, slot) in map.iter_mut() {
                if URI_KEYS.contains(&key.as_str()) {
                    rewrite_slot(slot, translator, translated);
                } else if key == "changes" && slot.is_object() {
                    rewrite_changes_map(slot, translator, translated);
                } else {
                    walk(slot, translator, translated);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                walk(item, translator, translated);
            }
        }
        _ => {}
    }
}

/// Rewrites a value sitting in URI position: a string, or an array whose
/// elements inherit the URI context.
fn rewrite_slot(slot: &mut Value, translator: &UriTranslator, translated: &mut Vec<String>) {
    match slot {
        Value::String(s) => {
            if let Some(new) = translator.apply(s) {
                translated.push(new.clone());
                *s = new;
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite_slot(item, translator, translated);
            }
        }
        other => walk(other, translator, translated),
    }
}

/// `WorkspaceEdit.changes` maps URIs to edit lists: the keys are translated,
/// the values walked normally.
fn rewrite_changes_map(slot: &mut Value, translator: &UriTranslator, translated: &mut Vec<String>) {
    let Value::Object(map) = slot else { return };

    let entries: Vec<(String, Value)> = std::mem::take(map).into_iter().collect();
    for (key, mut val) in entries {
        walk(&mut val, translator, translated);
        let key = match translator.apply(&key) {
            Some(new) => {
                translated.push(new.clone());
                new
            }
            None => key,
        };
        map.insert(key, val);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client_to_server() -> UriTranslator {
        UriTranslator::new("/ws", "/tmp/cache/sid")
    }

    #[test]
    fn test_prefix_substitution_preserves_suffix() {
        let tr = client_to_server();
        assert_eq!(
            tr.apply("file:///ws/src/a.py").as_deref(),
            Some("file:///tmp/cache/sid/src/a.py")
        );
    }

    #[test]
    fn test_workspace_root_itself_translates() {
        let tr = client_to_server();
        assert_eq!(
            tr.apply("file:///ws").as_deref(),
            Some("file:///tmp/cache/sid")
        );
    }

    #[test]
    fn test_sibling_prefix_does_not_match() {
        let tr = client_to_server();
        assert_eq!(tr.apply("file:///wsx/a.py"), None);
    }

    #[test]
    fn test_non_file_scheme_passes_through() {
        let tr = client_to_server();
        assert_eq!(tr.apply("untitled:Untitled-1"), None);
        assert_eq!(tr.apply("https://example.com/ws/a.py"), None);
    }

    #[test]
    fn test_root_workspace_prefix() {
        // A client rooted at "/" maps everything under the cache dir and back.
        let tr = UriTranslator::new("/", "/tmp/cache/sid");
        assert_eq!(
            tr.apply("file:///a.py").as_deref(),
            Some("file:///tmp/cache/sid/a.py")
        );
        assert_eq!(
            tr.inverse().apply("file:///tmp/cache/sid/a.py").as_deref(),
            Some("file:///a.py")
        );
    }

    #[test]
    fn test_round_trip_is_identity() {
        let out = client_to_server();
        let back = out.inverse();
        for uri in [
            "file:///ws",
            "file:///ws/a.py",
            "file:///ws/deep/ly/nested/file.rs",
        ] {
            let there = out.apply(uri).expect("should translate");
            assert_eq!(back.apply(&there).as_deref(), Some(uri));
        }
    }

    #[test]
    fn test_walker_rewrites_nested_uri_fields() {
        let tr = client_to_server();
        let mut params = json!({
            "textDocument": {"uri": "file:///ws/a.py"},
            "position": {"line": 0, "character": 0}
        });
        let touched = rewrite_tree(&mut params, &tr);
        assert_eq!(
            params["textDocument"]["uri"],
            "file:///tmp/cache/sid/a.py"
        );
        assert_eq!(touched, vec!["file:///tmp/cache/sid/a.py".to_string()]);
    }

    #[test]
    fn test_walker_rewrites_link_fields() {
        let tr = client_to_server().inverse();
        let mut result = json!([{
            "originSelectionRange": {},
            "targetUri": "file:///tmp/cache/sid/b.py",
            "targetRange": {}
        }]);
        rewrite_tree(&mut result, &tr);
        assert_eq!(result[0]["targetUri"], "file:///ws/b.py");
    }

    #[test]
    fn test_walker_rewrites_changes_map_keys() {
        let tr = client_to_server();
        let mut edit = json!({
            "changes": {
                "file:///ws/a.py": [{"range": {}, "newText": "x"}],
                "file:///elsewhere/b.py": []
            }
        });
        rewrite_tree(&mut edit, &tr);
        let changes = edit["changes"].as_object().expect("changes object");
        assert!(changes.contains_key("file:///tmp/cache/sid/a.py"));
        assert!(changes.contains_key("file:///elsewhere/b.py"));
        assert!(!changes.contains_key("file:///ws/a.py"));
    }

    #[test]
    fn test_walker_leaves_non_uri_strings_alone() {
        let tr = client_to_server();
        let mut params = json!({
            "query": "file:///ws/a.py",
            "name": "/ws/a.py"
        });
        let touched = rewrite_tree(&mut params, &tr);
        assert!(touched.is_empty());
        assert_eq!(params["query"], "file:///ws/a.py");
    }

    #[test]
    fn test_walker_handles_array_in_uri_position() {
        let tr = client_to_server();
        let mut params = json!({"uri": ["file:///ws/a.py", "file:///ws/b.py"]});
        let touched = rewrite_tree(&mut params, &tr);
        assert_eq!(touched.len(), 2);
        assert_eq!(params["uri"][1], "file:///tmp/cache/sid/b.py");
    }

    #[test]
    fn test_trailing_slash_prefixes_are_normalized() {
        let tr = UriTranslator::new("/ws/", "/tmp/cache/sid/");
        assert_eq!(
            tr.apply("file:///ws/a.py").as_deref(),
            Some("file:///tmp/cache/sid/a.py")
        );
    }
}
