use std::collections::HashMap;

use serde_json::Value;

/// Render a rich-text message template to plain text.
///
/// The template is an editor document: a root object whose `content` holds
/// `paragraph` blocks, each containing `text` and `templateVariable` nodes.
/// Variables are replaced from `vars`; unknown ones render as `{{name}}`.
/// Paragraphs are joined with newlines and other block types are ignored.
pub fn resolve_template(doc: &Value, vars: &HashMap<String, String>) -> String {
    let Some(blocks) = doc.get("content").and_then(Value::as_array) else {
        return String::new();
    };

    blocks
        .iter()
        .filter(|block| node_type(block) == Some("paragraph"))
        .map(|block| resolve_paragraph(block, vars))
        .collect::<Vec<_>>()
        .join("\n")
}

fn node_type(node: &Value) -> Option<&str> {
    node.get("type").and_then(Value::as_str)
}

fn resolve_paragraph(paragraph: &Value, vars: &HashMap<String, String>) -> String {
    let Some(children) = paragraph.get("content").and_then(Value::as_array) else {
        return String::new();
    };

    let mut out = String::new();
    for child in children {
        match node_type(child) {
            Some("text") => {
                out.push_str(child.get("text").and_then(Value::as_str).unwrap_or_default())
            }
            Some("templateVariable") => {
                let name = child
                    .pointer("/attrs/varName")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                match vars.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push_str("{{");
                        out.push_str(name);
                        out.push_str("}}");
                    }
                }
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_resolves_text_and_variables() {
        let doc = json!({
            "type": "doc",
            "content": [
                {"type": "paragraph", "content": [
                    {"type": "text", "text": "New rows: "},
                    {"type": "templateVariable", "attrs": {"varName": "count"}}
                ]},
                {"type": "heading", "content": [{"type": "text", "text": "ignored"}]},
                {"type": "paragraph", "content": [
                    {"type": "text", "text": "in "},
                    {"type": "templateVariable", "attrs": {"varName": "table_name"}}
                ]}
            ]
        });

        assert_eq!(
            resolve_template(&doc, &vars(&[("count", "3"), ("table_name", "orders")])),
            "New rows: 3\nin orders"
        );
    }

    #[test]
    fn test_unknown_variable_is_left_as_placeholder() {
        let doc = json!({"content": [{"type": "paragraph", "content": [
            {"type": "templateVariable", "attrs": {"varName": "missing"}}
        ]}]});
        assert_eq!(resolve_template(&doc, &HashMap::new()), "{{missing}}");
    }

    #[test]
    fn test_empty_documents() {
        assert_eq!(resolve_template(&json!({}), &HashMap::new()), "");
        assert_eq!(
            resolve_template(&json!({"content": [{"type": "paragraph"}]}), &HashMap::new()),
            ""
        );
    }
}
