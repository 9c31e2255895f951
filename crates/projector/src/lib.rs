//! Plenum - Projector
//!
//! The canonical computed field: `projection/*/content` is not stored
//! anywhere; it is rendered from the projection's metadata by a
//! registered slide, cached by the datastore, and re-rendered when
//! anything the slide read changes.
//!
//! # Rendering
//!
//! 1. Read the projection's metadata. A projection without an `id`
//!    in the datastore renders as absent.
//! 2. Pick the slide: the projection's `type` when set, otherwise
//!    the collection of `content_object_id`.
//! 3. No such slide: the content is a JSON object with an `error`
//!    member - a successful value the clients surface.
//! 4. Otherwise the slide's output is returned with the slide name
//!    spliced in as a leading `collection` member.
//!
//! ```ignore
//! projector::register(&datastore, SlideStore::with_defaults());
//! ```

mod projection;
mod slides;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use plenum_datastore::{BoxError, ComputedField, Datastore, Fetcher, Value};
use plenum_key::Key;
use tracing::debug;

pub use projection::Projection;
pub use slides::{ProjectionSlide, Slide, SlideStore};

/// Install the `projection/*/content` computed field on `ds`,
/// dispatching to `slides`.
pub fn register(ds: &Datastore, slides: SlideStore) {
    debug!(slides = slides.names().len(), "registering projector");
    ds.register_computed(
        "projection",
        "content",
        Arc::new(ContentField {
            slides: Arc::new(slides),
        }),
    );
}

struct ContentField {
    slides: Arc<SlideStore>,
}

#[async_trait]
impl ComputedField for ContentField {
    async fn produce(&self, fetch: &mut Fetcher, id: i32) -> Result<Value, BoxError> {
        let exists = fetch.lazy::<i32>(Key::new("projection", id, "id"));
        let kind = fetch.lazy::<String>(Key::new("projection", id, "type"));
        let content_object_id =
            fetch.lazy::<String>(Key::new("projection", id, "content_object_id"));
        let meeting_id = fetch.lazy::<i32>(Key::new("projection", id, "meeting_id"));
        let options = fetch.lazy::<Box<serde_json::value::RawValue>>(Key::new(
            "projection",
            id,
            "options",
        ));
        fetch.execute().await?;

        if !exists.exists() {
            return Ok(None);
        }

        let projection = Projection {
            id,
            kind: kind.value().cloned().unwrap_or_default(),
            content_object_id: content_object_id.value().cloned().unwrap_or_default(),
            meeting_id: meeting_id.value().copied().unwrap_or_default(),
            options: options.value().map(|raw| raw.to_owned()),
        };

        let Some(slide_name) = projection.slide_name().map(str::to_string) else {
            return Ok(Some(error_content(&format!(
                "projection {id} has no type and no content object"
            ))));
        };

        let Some(slide) = self.slides.get(&slide_name) else {
            return Ok(Some(error_content(&format!(
                "slide {slide_name} does not exist"
            ))));
        };

        let rendered = slide.render(fetch, &projection).await?;
        Ok(Some(wrap_collection(&slide_name, &rendered)?))
    }
}

/// A renderable error value: the clients surface it as the slide.
fn error_content(msg: &str) -> Bytes {
    let mut object = serde_json::Map::with_capacity(1);
    object.insert(
        "error".to_string(),
        serde_json::Value::String(msg.to_string()),
    );
    Bytes::from(serde_json::Value::Object(object).to_string())
}

/// Splice the slide name into the rendered object as its first
/// member: `{"value":1}` becomes `{"collection":"name","value":1}`.
fn wrap_collection(name: &str, rendered: &[u8]) -> Result<Bytes, BoxError> {
    let inner = rendered.trim_ascii();
    if inner.first() != Some(&b'{') || inner.last() != Some(&b'}') {
        return Err(format!("slide {name} returned no JSON object").into());
    }
    let body = &inner[1..];

    let mut out = Vec::with_capacity(inner.len() + name.len() + 16);
    out.extend_from_slice(b"{\"collection\":");
    out.extend_from_slice(serde_json::Value::String(name.to_string()).to_string().as_bytes());
    if body.trim_ascii_start().first() != Some(&b'}') {
        out.push(b',');
    }
    out.extend_from_slice(body);
    Ok(Bytes::from(out))
}

#[cfg(test)]
#[path = "projector_test.rs"]
mod tests;
