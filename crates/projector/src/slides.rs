//! Slide registry
//!
//! A slide turns one projection into the JSON content the clients
//! display. Slides are registered by name; the projector dispatches
//! on the projection's `type`, falling back to the collection of the
//! content object. The wider slide catalog plugs in here.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use plenum_datastore::{BoxError, Fetcher};

use crate::projection::Projection;

/// Renders the content of one projection.
///
/// Everything a slide reads goes through the fetcher it is handed;
/// those reads become the dependency set that triggers re-rendering.
#[async_trait]
pub trait Slide: Send + Sync {
    /// The content bytes, a JSON object.
    async fn render(
        &self,
        fetch: &mut Fetcher,
        projection: &Projection,
    ) -> Result<Vec<u8>, BoxError>;
}

/// The meta slide: renders the projection entity itself.
pub struct ProjectionSlide;

#[async_trait]
impl Slide for ProjectionSlide {
    async fn render(
        &self,
        _fetch: &mut Fetcher,
        projection: &Projection,
    ) -> Result<Vec<u8>, BoxError> {
        Ok(serde_json::to_vec(projection)?)
    }
}

/// Name to slide registry.
#[derive(Default)]
pub struct SlideStore {
    slides: HashMap<String, Arc<dyn Slide>>,
}

impl SlideStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store with the built-in slides: the `projection` meta slide.
    pub fn with_defaults() -> Self {
        let mut store = Self::new();
        store.register("projection", Arc::new(ProjectionSlide));
        store
    }

    /// Register a slide under `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, slide: Arc<dyn Slide>) {
        self.slides.insert(name.into(), slide);
    }

    /// Look up a slide.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Slide>> {
        self.slides.get(name)
    }

    /// Registered slide names, for diagnostics.
    pub fn names(&self) -> Vec<&str> {
        self.slides.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for SlideStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlideStore")
            .field("slides", &self.slides.len())
            .finish()
    }
}
