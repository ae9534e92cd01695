//! Binder: raw tool result → display tree.
//!
//! Classify first, then process the fields of the chosen shape.

use serde_json::{Map, Value};

use super::classifier::{classify, Shape, Subject};
use super::display::{
    BannerNode, BannerTone, CardNode, CardVariant, DisplayNode, Field, FieldKind, Icon, ListNode,
};
use super::fields::{self, MAX_TEXT_CHARS};
use crate::mcp_client::ToolCallFailure;

/// List shapes show at most this many elements.
pub const MAX_LIST_ITEMS: usize = 20;

/// Secondary fields on a metadata card.
pub const MAX_CARD_FIELDS: usize = 10;

/// Values previewed by a primitive-array banner.
pub const MAX_BANNER_VALUES: usize = 5;

/// Characters per previewed banner value.
pub const MAX_BANNER_VALUE_CHARS: usize = 50;

/// Keys tried, in order, for a card title.
const TITLE_KEYS: &[&str] = &["title", "name", "full_name", "label", "display_name"];

// ─── Entry Points ────────────────────────────────────────────────────────────

/// Bind any JSON value to a display tree. Never fails.
pub fn bind(value: &Value) -> DisplayNode {
    let classification = classify(value);
    match (classification.shape(), classification.subject) {
        (_, Subject::Collection { key, items, parent }) => bind_list(items, key, parent),
        (_, Subject::Values(items)) => bind_values(items),
        (Shape::MetadataCard, Subject::Object(object)) => DisplayNode::Card(metadata_card(object)),
        (_, Subject::Object(object)) => DisplayNode::Card(key_value_card(object)),
        (_, Subject::Scalar(scalar)) => bind_scalar(scalar),
    }
}

/// Bind a raw `tools/call` result, unwrapping its content blocks first.
pub fn bind_tool_result(result: &Value) -> DisplayNode {
    bind(&unwrap_tool_content(result))
}

/// Error banner for a failed call, so the caller always has something to show.
pub fn bind_failure(failure: &ToolCallFailure) -> DisplayNode {
    let (message, _) = fields::truncate(&failure.message, MAX_TEXT_CHARS);
    DisplayNode::Banner(BannerNode {
        tone: BannerTone::Error,
        icon: Icon::Warning,
        title: Some(format!("{} failed ({})", failure.tool_name, failure.kind)),
        values: vec![message],
        total: 1,
    })
}

// ─── Tool Result Unwrapping ──────────────────────────────────────────────────

/// Extract the payload of a `tools/call` result.
///
/// `structuredContent` wins when present. Otherwise text blocks are decoded as
/// JSON where possible; one block yields its value, several an array. Values
/// that are not tool results are returned unchanged.
pub fn unwrap_tool_content(result: &Value) -> Value {
    let Some(object) = result.as_object() else {
        return result.clone();
    };

    if let Some(structured) = object.get("structuredContent").filter(|v| !v.is_null()) {
        return structured.clone();
    }

    let Some(blocks) = object.get("content").and_then(Value::as_array) else {
        return result.clone();
    };
    if !blocks.iter().all(is_content_block) {
        return result.clone();
    }

    let mut values: Vec<Value> = blocks.iter().map(unwrap_block).collect();
    match values.len() {
        0 => Value::Null,
        1 => values.remove(0),
        _ => Value::Array(values),
    }
}

fn is_content_block(block: &Value) -> bool {
    block.get("type").and_then(Value::as_str).is_some()
}

fn unwrap_block(block: &Value) -> Value {
    let kind = block.get("type").and_then(Value::as_str).unwrap_or_default();
    match kind {
        "text" => {
            let text = block.get("text").and_then(Value::as_str).unwrap_or_default();
            serde_json::from_str(text.trim()).unwrap_or_else(|_| Value::String(text.to_string()))
        }
        "image" | "audio" => serde_json::json!({
            "type": kind,
            "mimeType": block.get("mimeType").cloned().unwrap_or(Value::Null),
        }),
        "resource_link" => serde_json::json!({
            "type": kind,
            "name": block.get("name").cloned().unwrap_or(Value::Null),
            "uri": block.get("uri").cloned().unwrap_or(Value::Null),
        }),
        "resource" => serde_json::json!({
            "type": kind,
            "uri": block
                .get("resource")
                .and_then(|r| r.get("uri"))
                .cloned()
                .unwrap_or(Value::Null),
        }),
        _ => block.clone(),
    }
}

// ─── Shapes ──────────────────────────────────────────────────────────────────

fn bind_list(items: &[Value], key: Option<&str>, parent: Option<&Map<String, Value>>) -> DisplayNode {
    let nodes: Vec<DisplayNode> = items
        .iter()
        .take(MAX_LIST_ITEMS)
        .map(|item| match item {
            Value::Object(object) => DisplayNode::Card(metadata_card(object)),
            other => bind(other),
        })
        .collect();

    let icon = parent
        .map(fields::infer_icon)
        .filter(|icon| *icon != Icon::Generic)
        .or_else(|| nodes.first().map(DisplayNode::icon))
        .unwrap_or(Icon::Generic);

    DisplayNode::List(ListNode {
        icon,
        items: nodes,
        total: items.len(),
        source_key: key.map(String::from),
    })
}

fn bind_values(items: &[Value]) -> DisplayNode {
    let values = items
        .iter()
        .take(MAX_BANNER_VALUES)
        .map(|item| {
            let text = match item {
                Value::String(text) => fields::sanitize_text(text),
                Value::Null => "null".to_string(),
                other => fields::render_value(other).unwrap_or_default(),
            };
            fields::truncate(&text, MAX_BANNER_VALUE_CHARS).0
        })
        .collect();

    DisplayNode::Banner(BannerNode {
        tone: BannerTone::Info,
        icon: Icon::Generic,
        title: items.is_empty().then(|| "No results".to_string()),
        values,
        total: items.len(),
    })
}

fn bind_scalar(value: &Value) -> DisplayNode {
    let (icon, title, values) = match value {
        Value::Null => (Icon::Generic, Some("No data".to_string()), Vec::new()),
        Value::String(text) => {
            let (text, _) = fields::truncate(&fields::sanitize_text(text), MAX_TEXT_CHARS);
            (Icon::File, None, vec![text])
        }
        other => (
            Icon::Generic,
            None,
            vec![fields::render_value(other).unwrap_or_default()],
        ),
    };

    let total = values.len();
    DisplayNode::Banner(BannerNode {
        tone: BannerTone::Info,
        icon,
        title,
        values,
        total,
    })
}

/// Title plus up to [`MAX_CARD_FIELDS`] secondary fields.
fn metadata_card(object: &Map<String, Value>) -> CardNode {
    let mut fields = fields::surviving_fields(object);

    let title_index = TITLE_KEYS
        .iter()
        .find_map(|wanted| fields.iter().position(|f| f.key.eq_ignore_ascii_case(wanted)))
        .or_else(|| fields.iter().position(looks_like_title))
        .or_else(|| fields.iter().position(|f| f.kind == FieldKind::Text));
    let title = title_index.map(|index| fields.remove(index));

    fields.truncate(MAX_CARD_FIELDS);

    CardNode {
        variant: CardVariant::Metadata,
        icon: fields::infer_icon(object),
        title,
        fields,
    }
}

fn looks_like_title(field: &Field) -> bool {
    let len = field.value.chars().count();
    field.kind == FieldKind::Text && (3..=100).contains(&len)
}

/// Every surviving field as a label/value row.
fn key_value_card(object: &Map<String, Value>) -> CardNode {
    CardNode {
        variant: CardVariant::KeyValue,
        icon: fields::infer_icon(object),
        title: None,
        fields: fields::surviving_fields(object),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
