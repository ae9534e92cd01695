//! Data binding: turns schema-less tool results into display shapes.
//!
//! - [`classifier`] picks a shape (list, card, banner) with an ordered rule table
//! - [`fields`] cleans field values (suppression, sanitization, truncation, links)
//! - [`binder`] composes the two into a [`DisplayNode`] tree
//!
//! No tool-specific code: any well-formed JSON value binds to exactly one shape.

pub mod binder;
pub mod classifier;
pub mod display;
pub mod fields;

pub use binder::{bind, bind_failure, bind_tool_result, unwrap_tool_content};
pub use classifier::{classify, Classification, Shape};
pub use display::{
    BannerNode, BannerTone, CardNode, CardVariant, DisplayNode, Field, FieldKind, Icon, ListNode,
};
