//! Board data model.
//!
//! `CanvasElement` is the canvas-native record as the canvas host serializes
//! it. `Element` is the neutral representation the sync core reasons about:
//! a closed set of variants, so every reaction matches exhaustively.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Canvas `type` tag for embeddable viewers.
pub const EMBEDDABLE_TYPE: &str = "embeddable";
/// Canvas `type` tag for frames.
pub const FRAME_TYPE: &str = "frame";
/// File name of the board snapshot inside each board directory.
pub const BOARD_FILE: &str = "board.json";

/// Element record as stored by the canvas host.
///
/// Properties the sync core does not interpret (position, size, styling) are
/// carried in `extra` so they survive round trips and take part in
/// content comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasElement {
    pub id: String,
    #[serde(rename = "type")]
    pub element_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub is_deleted: bool,
    /// Last-updated logical timestamp.
    #[serde(default)]
    pub updated: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CanvasElement {
    pub fn new(id: impl Into<String>, element_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            element_type: element_type.into(),
            link: None,
            name: None,
            is_deleted: false,
            updated: 0,
            extra: Map::new(),
        }
    }

    /// Whether the sync core models this element (ignores deletion).
    pub fn is_supported(&self) -> bool {
        self.element_type == EMBEDDABLE_TYPE || self.element_type == FRAME_TYPE
    }
}

/// Variant-specific data of an element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ElementKind {
    /// Viewer for a remote file (markdown, text or PDF).
    Embeddable { link: String },
    /// Named grouping, mirrored as a directory on the remote store.
    Frame { name: Option<String> },
}

/// Neutral representation of a placeable board object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub id: String,
    #[serde(flatten)]
    pub kind: ElementKind,
    pub updated: u64,
}

impl Element {
    pub fn embeddable(id: impl Into<String>, link: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ElementKind::Embeddable { link: link.into() },
            updated: 0,
        }
    }

    pub fn frame(id: impl Into<String>, name: Option<&str>) -> Self {
        Self {
            id: id.into(),
            kind: ElementKind::Frame {
                name: name.map(str::to_string),
            },
            updated: 0,
        }
    }

    pub fn with_updated(mut self, updated: u64) -> Self {
        self.updated = updated;
        self
    }

    /// Convert a canvas record. Returns `None` for unsupported or deleted records.
    pub fn from_canvas(record: &CanvasElement) -> Option<Self> {
        if record.is_deleted {
            return None;
        }
        let kind = match record.element_type.as_str() {
            EMBEDDABLE_TYPE => ElementKind::Embeddable {
                link: record.link.clone().unwrap_or_default(),
            },
            FRAME_TYPE => ElementKind::Frame {
                name: record.name.clone(),
            },
            _ => return None,
        };
        Some(Self {
            id: record.id.clone(),
            kind,
            updated: record.updated,
        })
    }

    /// Build a fresh canvas record for this element.
    pub fn to_canvas(&self) -> CanvasElement {
        let mut record = CanvasElement::new(self.id.clone(), self.type_tag());
        self.apply_to(&mut record);
        record
    }

    /// Write this element's fields onto an existing canvas record, keeping
    /// everything the neutral model does not know about.
    pub fn apply_to(&self, record: &mut CanvasElement) {
        record.element_type = self.type_tag().to_string();
        record.is_deleted = false;
        record.updated = record.updated.max(self.updated);
        match &self.kind {
            ElementKind::Embeddable { link } => {
                record.link = Some(link.clone());
            }
            ElementKind::Frame { name } => {
                record.name = name.clone();
            }
        }
    }

    pub fn type_tag(&self) -> &'static str {
        match self.kind {
            ElementKind::Embeddable { .. } => EMBEDDABLE_TYPE,
            ElementKind::Frame { .. } => FRAME_TYPE,
        }
    }

    pub fn is_frame(&self) -> bool {
        matches!(self.kind, ElementKind::Frame { .. })
    }

    /// Frame name, falling back to a name derived from the id.
    pub fn display_name(&self) -> String {
        match &self.kind {
            ElementKind::Frame { name: Some(name) } if !name.trim().is_empty() => {
                name.trim().to_string()
            }
            _ => {
                let prefix: String = self.id.chars().take(8).collect();
                format!("frame-{}", prefix)
            }
        }
    }
}

/// The set of elements describing one board's content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Structure {
    elements: BTreeMap<String, Element>,
}

impl Structure {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a structure from canvas records, skipping unsupported and deleted ones.
    pub fn from_canvas(records: &[CanvasElement]) -> Self {
        records.iter().filter_map(Element::from_canvas).collect()
    }

    /// Insert or replace by id.
    pub fn insert(&mut self, element: Element) -> Option<Element> {
        self.elements.insert(element.id.clone(), element)
    }

    pub fn get(&self, id: &str) -> Option<&Element> {
        self.elements.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.elements.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Element> {
        self.elements.values()
    }

    pub fn frames(&self) -> impl Iterator<Item = &Element> {
        self.iter().filter(|e| e.is_frame())
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

impl FromIterator<Element> for Structure {
    fn from_iter<I: IntoIterator<Item = Element>>(iter: I) -> Self {
        let mut structure = Structure::new();
        for element in iter {
            structure.insert(element);
        }
        structure
    }
}

/// Whole-board state, as broadcast on the full-state channel and stored in `board.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardSnapshot {
    #[serde(default)]
    pub elements: Vec<CanvasElement>,
    #[serde(default)]
    pub app_state: Value,
    #[serde(default)]
    pub files: Value,
}

impl BoardSnapshot {
    pub fn new(elements: Vec<CanvasElement>) -> Self {
        Self {
            elements,
            ..Default::default()
        }
    }

    pub fn structure(&self) -> Structure {
        Structure::from_canvas(&self.elements)
    }
}

/// Kind of file a board can hold, resolved from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Markdown,
    Text,
    Pdf,
}

impl FileKind {
    pub fn from_path(path: &str) -> Option<Self> {
        let extension = path.rsplit_once('.')?.1.to_ascii_lowercase();
        match extension.as_str() {
            "md" | "markdown" => Some(Self::Markdown),
            "txt" => Some(Self::Text),
            "pdf" => Some(Self::Pdf),
            _ => None,
        }
    }

    /// Whether file contents are text and can travel inside `file-changed`.
    pub fn is_text(&self) -> bool {
        !matches!(self, Self::Pdf)
    }
}

/// Path of the snapshot file for `board`.
pub fn board_file_path(board: &str) -> String {
    format!("{}/{}", board, BOARD_FILE)
}
