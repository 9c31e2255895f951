//! The projection entity

use serde::Serialize;
use serde_json::value::RawValue;

/// One projection: a reference to a piece of content to display.
///
/// The serialised form is what the meta slide renders; `options`
/// passes through as raw JSON.
#[derive(Debug, Serialize)]
pub struct Projection {
    pub id: i32,
    /// Slide name override; the content object's collection is used
    /// when empty
    #[serde(rename = "type")]
    pub kind: String,
    pub content_object_id: String,
    pub meeting_id: i32,
    pub options: Option<Box<RawValue>>,
}

impl Projection {
    /// The slide this projection renders with: its `type` when set,
    /// otherwise the collection of its content object.
    pub fn slide_name(&self) -> Option<&str> {
        if !self.kind.is_empty() {
            return Some(&self.kind);
        }
        plenum_key::parse_fqid(&self.content_object_id).map(|(collection, _)| collection)
    }
}
