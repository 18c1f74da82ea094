//! Persisted resource DTOs.
//!
//! These are the shapes that travel to and from the server: no transient
//! UI fields, no derived data. Each resource carries a stable string id
//! which is the key of its collection map.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::geometry::{Bounds, Point};

/// What a canvas element renders as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Box,
    Label,
    Image,
    Video,
    Shape,
}

/// Where a media element's content comes from.
///
/// `Local` references a blob that only exists in this session and still
/// needs to be uploaded; the sync layer replaces it with `Remote` once the
/// asset is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MediaSource {
    Local { asset_key: String },
    Remote { url: String },
}

impl MediaSource {
    pub fn is_local(&self) -> bool {
        matches!(self, MediaSource::Local { .. })
    }
}

/// A positioned visual element on the canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: String,
    pub name: String,
    pub kind: ElementKind,
    pub bounds: Bounds,
    /// Stacking order within the canvas.
    pub z: i32,
    /// Style properties (color, border, font, ...), free-form.
    pub style: BTreeMap<String, String>,
    /// Back-reference to the group this element belongs to, if any.
    pub group: Option<String>,
    /// Media content, for `Image`/`Video` elements.
    pub source: Option<MediaSource>,
}

impl Element {
    pub fn new(id: impl Into<String>, kind: ElementKind, bounds: Bounds) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            bounds,
            z: 0,
            style: BTreeMap::new(),
            group: None,
            source: None,
        }
    }
}

/// A connector (edge) between two elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connector {
    pub id: String,
    /// Source element id.
    pub from: String,
    /// Target element id.
    pub to: String,
    /// Intermediate routing points, if the connector is not a straight line.
    pub points: Vec<Point>,
    pub label: Option<String>,
    pub style: BTreeMap<String, String>,
}

impl Connector {
    pub fn new(id: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            from: from.into(),
            to: to.into(),
            points: Vec::new(),
            label: None,
            style: BTreeMap::new(),
        }
    }
}

/// A named grouping of elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    /// Member element ids, in insertion order.
    pub members: Vec<String>,
}

impl Group {
    pub fn new(id: impl Into<String>, members: Vec<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            members,
        }
    }
}

/// One ordered presentation step.
///
/// A step points at an element and/or a group by id; either reference may
/// be absent (a pause step references nothing).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    /// Position in the presentation order, 0-based and dense.
    pub order: u32,
    pub item: Option<String>,
    pub group: Option<String>,
    pub note: Option<String>,
}

impl Step {
    pub fn new(id: impl Into<String>, order: u32) -> Self {
        Self {
            id: id.into(),
            order,
            item: None,
            group: None,
            note: None,
        }
    }
}

/// Top-level document fields.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub id: String,
    pub title: String,
    pub theme: String,
    pub background: String,
}
