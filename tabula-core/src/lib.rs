//! # tabula-core — shared board object model
//!
//! The data types every other tabula crate agrees on: the polymorphic
//! [`BoardObject`] (sticky, shape, frame, connector, line, text), the
//! per-field [`ObjectPatch`] used for last-writer-wins merges, and the
//! [`CachedBoardState`] working copy that the sync engine mutates.
//!
//! Objects carry a shared structural base (id, position, frame relation,
//! actor stamps) plus a type-specific payload. Handlers match on
//! [`ObjectKind`] exhaustively — there is no inheritance-style dispatch.

use serde::{Deserialize, Serialize};

/// Shape figure for [`ObjectKind::Shape`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeFigure {
    Rectangle,
    Ellipse,
    Diamond,
    Triangle,
}

/// Type-specific payload of a drawable object.
///
/// Serialized with a `"type"` tag next to the shared base fields, so the
/// wire form reads `{ "id": "...", "type": "sticky", "text": "...", ... }`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ObjectKind {
    Sticky {
        text: String,
        color: String,
        width: f64,
        height: f64,
    },
    Shape {
        figure: ShapeFigure,
        color: String,
        width: f64,
        height: f64,
    },
    Frame {
        title: String,
        width: f64,
        height: f64,
    },
    Connector {
        /// Object id the connector starts at.
        #[serde(rename = "fromId")]
        from_id: String,
        /// Object id the connector ends at.
        #[serde(rename = "toId")]
        to_id: String,
        stroke: String,
    },
    Line {
        x2: f64,
        y2: f64,
        stroke: String,
        #[serde(rename = "strokeWidth")]
        stroke_width: f64,
    },
    Text {
        text: String,
        color: String,
        #[serde(rename = "fontSize")]
        font_size: f64,
        width: f64,
    },
}

impl ObjectKind {
    /// Wire name of the variant, matching the serde tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            ObjectKind::Sticky { .. } => "sticky",
            ObjectKind::Shape { .. } => "shape",
            ObjectKind::Frame { .. } => "frame",
            ObjectKind::Connector { .. } => "connector",
            ObjectKind::Line { .. } => "line",
            ObjectKind::Text { .. } => "text",
        }
    }

    /// Whether this variant carries an editable text field.
    pub fn has_text(&self) -> bool {
        matches!(
            self,
            ObjectKind::Sticky { .. } | ObjectKind::Text { .. }
        )
    }
}

/// A single drawable entity on a board.
///
/// `id` is an opaque unique string, client- or server-generated; the sync
/// engine enforces uniqueness within a board. `frame_id` is a back-reference
/// to a containing frame — a relation, not ownership.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardObject {
    pub id: String,
    #[serde(flatten)]
    pub kind: ObjectKind,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub rotation: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<String>,
    pub created_by: String,
    pub last_edited_by: String,
    /// Epoch milliseconds.
    pub created_at: u64,
    /// Epoch milliseconds.
    pub updated_at: u64,
}

impl BoardObject {
    /// Merge a patch into this object, field by field.
    ///
    /// Only fields present in the patch are written; everything else keeps
    /// its current value. This is what makes two successive updates with
    /// disjoint field sets both stick (per-field last-writer-wins). Patch
    /// fields that do not apply to this object's kind are ignored.
    pub fn apply_patch(&mut self, patch: &ObjectPatch) {
        if let Some(x) = patch.x {
            self.x = x;
        }
        if let Some(y) = patch.y {
            self.y = y;
        }
        if let Some(rotation) = patch.rotation {
            self.rotation = rotation;
        }
        if let Some(ref frame_id) = patch.frame_id {
            self.frame_id = frame_id.clone();
        }
        if let Some(ref editor) = patch.last_edited_by {
            self.last_edited_by = editor.clone();
        }
        if let Some(updated_at) = patch.updated_at {
            self.updated_at = updated_at;
        }

        match &mut self.kind {
            ObjectKind::Sticky { text, color, width, height } => {
                merge(text, &patch.text);
                merge(color, &patch.color);
                merge_num(width, patch.width);
                merge_num(height, patch.height);
            }
            ObjectKind::Shape { color, width, height, .. } => {
                merge(color, &patch.color);
                merge_num(width, patch.width);
                merge_num(height, patch.height);
            }
            ObjectKind::Frame { title, width, height } => {
                merge(title, &patch.title);
                merge_num(width, patch.width);
                merge_num(height, patch.height);
            }
            ObjectKind::Connector { stroke, .. } => {
                merge(stroke, &patch.color);
            }
            ObjectKind::Line { x2, y2, stroke, stroke_width } => {
                merge_num(x2, patch.x2);
                merge_num(y2, patch.y2);
                merge(stroke, &patch.color);
                merge_num(stroke_width, patch.stroke_width);
            }
            ObjectKind::Text { text, color, font_size, width } => {
                merge(text, &patch.text);
                merge(color, &patch.color);
                merge_num(font_size, patch.font_size);
                merge_num(width, patch.width);
            }
        }
    }
}

fn merge(slot: &mut String, patch: &Option<String>) {
    if let Some(value) = patch {
        *slot = value.clone();
    }
}

fn merge_num(slot: &mut f64, patch: Option<f64>) {
    if let Some(value) = patch {
        *slot = value;
    }
}

/// Deserialize helper distinguishing an absent field from an explicit null.
///
/// `{ "frameId": null }` detaches an object from its frame, while a patch
/// without `frameId` leaves the relation alone.
fn double_option<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    Deserialize::deserialize(de).map(Some)
}

/// A partial update against a single [`BoardObject`].
///
/// All fields are optional; [`BoardObject::apply_patch`] merges the present
/// ones. `last_edited_by` and `updated_at` are server-stamped by the
/// broadcast layer — client-supplied values are overwritten before the
/// patch reaches the engine.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f64>,
    /// `Some(None)` detaches from the containing frame.
    #[serde(
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub frame_id: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x2: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y2: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stroke_width: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_edited_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<u64>,
}

impl ObjectPatch {
    /// A patch that only moves an object.
    pub fn move_to(x: f64, y: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Self::default()
        }
    }

    /// True when the patch touches an editable text field — the broadcast
    /// layer uses this to extend the sender's edit lock while typing.
    pub fn touches_text(&self) -> bool {
        self.text.is_some()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// The authoritative cached working copy of one board.
///
/// `objects` keeps insertion order, which is the board's z-order. Object
/// ids are unique within the vector — the mutation engine rejects
/// duplicates on add. `store_version` is the durable store's version as of
/// the last load or flush; `last_synced_at` is epoch milliseconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedBoardState {
    pub board_id: String,
    pub objects: Vec<BoardObject>,
    pub store_version: u64,
    pub last_synced_at: u64,
}

impl CachedBoardState {
    pub fn new(board_id: impl Into<String>, store_version: u64, last_synced_at: u64) -> Self {
        Self {
            board_id: board_id.into(),
            objects: Vec::new(),
            store_version,
            last_synced_at,
        }
    }

    pub fn contains(&self, object_id: &str) -> bool {
        self.objects.iter().any(|o| o.id == object_id)
    }

    pub fn find(&self, object_id: &str) -> Option<&BoardObject> {
        self.objects.iter().find(|o| o.id == object_id)
    }

    pub fn find_mut(&mut self, object_id: &str) -> Option<&mut BoardObject> {
        self.objects.iter_mut().find(|o| o.id == object_id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
