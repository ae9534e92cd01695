//! Display tree handed to the rendering layer.
//!
//! Every string in a node is already sanitized and truncated; renderers only
//! lay things out.

use serde::{Serialize, Serializer};

// ─── Icons ───────────────────────────────────────────────────────────────────

/// Icon attached to a shape, serialized as its glyph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Icon {
    Package,
    Search,
    File,
    User,
    Warning,
    Generic,
}

impl Icon {
    pub fn code_point(self) -> &'static str {
        match self {
            Self::Package => "\u{1F4E6}",
            Self::Search => "\u{1F50D}",
            Self::File => "\u{1F4C4}",
            Self::User => "\u{1F464}",
            Self::Warning => "\u{26A0}\u{FE0F}",
            Self::Generic => "\u{1F4CB}",
        }
    }
}

impl Serialize for Icon {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code_point())
    }
}

// ─── Fields ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    /// Actionable URL.
    Link,
    /// URL pointing at an image.
    Image,
}

/// One cleaned label/value pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Field {
    /// Original JSON key.
    pub key: String,
    pub label: String,
    pub value: String,
    pub kind: FieldKind,
    pub truncated: bool,
}

impl Field {
    /// Whether the renderer should make this value actionable.
    pub fn is_link(&self) -> bool {
        matches!(self.kind, FieldKind::Link | FieldKind::Image)
    }
}

// ─── Nodes ───────────────────────────────────────────────────────────────────

/// A renderable shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum DisplayNode {
    List(ListNode),
    Card(CardNode),
    Banner(BannerNode),
}

impl DisplayNode {
    pub fn icon(&self) -> Icon {
        match self {
            Self::List(list) => list.icon,
            Self::Card(card) => card.icon,
            Self::Banner(banner) => banner.icon,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListNode {
    pub icon: Icon,
    /// At most the list cap; see `total` for the full length.
    pub items: Vec<DisplayNode>,
    pub total: usize,
    /// Collection field the list came from, if it was wrapped in an object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CardVariant {
    /// Title plus a bounded set of secondary fields.
    Metadata,
    /// Every surviving field as a label/value row.
    KeyValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CardNode {
    pub variant: CardVariant,
    pub icon: Icon,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<Field>,
    pub fields: Vec<Field>,
}

impl CardNode {
    /// Keys of every field shown on the card, title first.
    pub fn surviving_keys(&self) -> Vec<&str> {
        self.title
            .iter()
            .chain(&self.fields)
            .map(|field| field.key.as_str())
            .collect()
    }

    pub fn field(&self, key: &str) -> Option<&Field> {
        self.title
            .iter()
            .chain(&self.fields)
            .find(|field| field.key == key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BannerTone {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BannerNode {
    pub tone: BannerTone,
    pub icon: Icon,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Previewed values.
    pub values: Vec<String>,
    /// Number of values before the preview cap.
    pub total: usize,
}
