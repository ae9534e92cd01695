//! Shape classification for arbitrary JSON results.
//!
//! Rules live in [`RULES`] and are evaluated in priority order; the first one
//! that selects a subject wins. The last rule matches everything, so
//! classification is total and deterministic.

use serde::Serialize;
use serde_json::{Map, Value};

use super::fields;

/// Field names that mark an array as the payload of a wrapper object.
/// The first array-valued match in document order wins.
pub const COLLECTION_KEYS: &[&str] = &["items", "results", "entries", "data", "records", "hits", "rows"];

/// Objects with at least this many surviving fields get a metadata card.
pub const METADATA_CARD_MIN_FIELDS: usize = 5;

/// Display category chosen for a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    List,
    MetadataCard,
    KeyValueCard,
    Banner,
}

/// The part of the value a shape renders.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Subject<'a> {
    /// Elements of a list, with the wrapper field they came from.
    Collection {
        key: Option<&'a str>,
        items: &'a [Value],
        parent: Option<&'a Map<String, Value>>,
    },
    /// Primitive array elements.
    Values(&'a [Value]),
    Object(&'a Map<String, Value>),
    Scalar(&'a Value),
}

/// One classification rule.
pub struct Rule {
    pub priority: u8,
    pub name: &'static str,
    pub shape: Shape,
    select: for<'a> fn(&'a Value) -> Option<Subject<'a>>,
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("priority", &self.priority)
            .field("name", &self.name)
            .field("shape", &self.shape)
            .finish()
    }
}

/// The rule table, in evaluation order.
pub static RULES: [Rule; 6] = [
    Rule {
        priority: 1,
        name: "collection_field",
        shape: Shape::List,
        select: select_collection_field,
    },
    Rule {
        priority: 2,
        name: "primitive_array",
        shape: Shape::Banner,
        select: select_primitive_array,
    },
    Rule {
        priority: 3,
        name: "object_array",
        shape: Shape::List,
        select: select_object_array,
    },
    Rule {
        priority: 4,
        name: "rich_object",
        shape: Shape::MetadataCard,
        select: select_rich_object,
    },
    Rule {
        priority: 5,
        name: "small_object",
        shape: Shape::KeyValueCard,
        select: select_small_object,
    },
    Rule {
        priority: 6,
        name: "scalar",
        shape: Shape::Banner,
        select: select_any,
    },
];

/// Outcome of [`classify`].
#[derive(Debug, Clone, Copy)]
pub struct Classification<'a> {
    pub rule: &'static Rule,
    pub subject: Subject<'a>,
}

impl Classification<'_> {
    pub fn shape(&self) -> Shape {
        self.rule.shape
    }
}

/// Classify a value with the first matching rule.
pub fn classify(value: &Value) -> Classification<'_> {
    RULES
        .iter()
        .find_map(|rule| (rule.select)(value).map(|subject| Classification { rule, subject }))
        .unwrap_or(Classification {
            rule: &RULES[RULES.len() - 1],
            subject: Subject::Scalar(value),
        })
}

// ─── Predicates ──────────────────────────────────────────────────────────────

fn select_collection_field(value: &Value) -> Option<Subject<'_>> {
    let object = value.as_object()?;
    object.iter().find_map(|(key, member)| {
        let items = member.as_array()?;
        is_collection_key(key).then_some(Subject::Collection {
            key: Some(key.as_str()),
            items,
            parent: Some(object),
        })
    })
}

fn is_collection_key(key: &str) -> bool {
    COLLECTION_KEYS.iter().any(|wanted| key.eq_ignore_ascii_case(wanted))
}

fn select_primitive_array(value: &Value) -> Option<Subject<'_>> {
    let items = value.as_array()?;
    (!items.iter().any(Value::is_object)).then_some(Subject::Values(items))
}

fn select_object_array(value: &Value) -> Option<Subject<'_>> {
    let items = value.as_array()?;
    items.iter().any(Value::is_object).then_some(Subject::Collection {
        key: None,
        items,
        parent: None,
    })
}

fn select_rich_object(value: &Value) -> Option<Subject<'_>> {
    let object = value.as_object()?;
    (surviving_count(object) >= METADATA_CARD_MIN_FIELDS).then_some(Subject::Object(object))
}

fn select_small_object(value: &Value) -> Option<Subject<'_>> {
    value.as_object().map(Subject::Object)
}

fn select_any(value: &Value) -> Option<Subject<'_>> {
    Some(Subject::Scalar(value))
}

fn surviving_count(object: &Map<String, Value>) -> usize {
    object
        .iter()
        .filter(|(key, value)| fields::process_field(key, value).is_some())
        .count()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
