//! Adapter around the external face embedding network.
//!
//! The network itself is opaque: it maps a [`FaceImage`] to an
//! [`EmbeddingVector`].  The adapter caches embeddings per image and turns
//! pairs of embeddings into a similarity in `[0, 1]`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::err::Error;
use crate::pheno::case::{EmbeddingVector, Face, FaceImage};

/// Interface of the external embedding network.
pub trait EmbeddingNetwork: Send + Sync {
    /// Run the forward pass for one image.
    fn embed(&self, image: &FaceImage) -> Result<EmbeddingVector, anyhow::Error>;
}

/// Embedding network backed by a table of precomputed embeddings, keyed by
/// image ID.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(transparent)]
pub struct EmbeddingTable {
    vectors: HashMap<String, EmbeddingVector>,
}

impl EmbeddingTable {
    pub fn new(vectors: HashMap<String, EmbeddingVector>) -> Self {
        Self { vectors }
    }

    /// Load the table from a JSON object `{image_id: [f32, ...]}`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        crate::common::read_json(path)
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }
}

impl EmbeddingNetwork for EmbeddingTable {
    fn embed(&self, image: &FaceImage) -> Result<EmbeddingVector, anyhow::Error> {
        self.vectors
            .get(&image.image_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no embedding for image {}", image.image_id))
    }
}

/// Metric to turn two embeddings into a similarity.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    clap::ValueEnum,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum DistanceMetric {
    /// Cosine similarity rescaled from `[-1, 1]` to `[0, 1]`.
    #[default]
    Cosine,
    /// `1 / (1 + d)` for the Euclidean distance `d`.
    Euclidean,
}

impl DistanceMetric {
    /// Similarity of two embeddings in `[0, 1]`.
    ///
    /// A zero vector has cosine `0` to everything.  Vectors with NaN or
    /// infinite components are rejected.
    pub fn similarity(&self, a: &EmbeddingVector, b: &EmbeddingVector) -> Result<f64, Error> {
        if a.len() != b.len() {
            return Err(Error::DimensionMismatch(a.len(), b.len()));
        }
        if !a.is_finite() || !b.is_finite() {
            return Err(Error::InvalidEmbedding("compared vector".into()));
        }
        let pairs = a
            .values()
            .iter()
            .zip(b.values())
            .map(|(&x, &y)| (x as f64, y as f64));

        let result = match self {
            DistanceMetric::Cosine => {
                let (dot, norm_a, norm_b) = pairs.fold((0.0, 0.0, 0.0), |(dot, na, nb), (x, y)| {
                    (dot + x * y, na + x * x, nb + y * y)
                });
                let norm = norm_a.sqrt() * norm_b.sqrt();
                let cos = if norm == 0.0 { 0.0 } else { dot / norm };
                (1.0 + cos) / 2.0
            }
            DistanceMetric::Euclidean => {
                let sq_dist: f64 = pairs.map(|(x, y)| (x - y) * (x - y)).sum();
                1.0 / (1.0 + sq_dist.sqrt())
            }
        };
        Ok(result.clamp(0.0, 1.0))
    }
}

/// Caching wrapper around an [`EmbeddingNetwork`].
pub struct EmbeddingAdapter {
    network: Arc<dyn EmbeddingNetwork>,
    metric: DistanceMetric,
    /// Write-once cache of embeddings by image ID.
    cache: DashMap<String, Arc<EmbeddingVector>>,
}

impl std::fmt::Debug for EmbeddingAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingAdapter")
            .field("metric", &self.metric)
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl EmbeddingAdapter {
    pub fn new(network: Arc<dyn EmbeddingNetwork>, metric: DistanceMetric) -> Self {
        Self {
            network,
            metric,
            cache: DashMap::new(),
        }
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    /// Number of cached embeddings.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Embed an image, using the cache if possible.
    ///
    /// Failures of the network are reported as
    /// [`Error::EmbeddingUnavailable`], non-finite outputs as
    /// [`Error::InvalidEmbedding`]; neither is cached.  If two threads
    /// embed the same image concurrently, the first stored vector wins.
    pub fn embed(&self, image: &FaceImage) -> Result<Arc<EmbeddingVector>, Error> {
        if let Some(vector) = self.cache.get(&image.image_id) {
            return Ok(Arc::clone(vector.value()));
        }
        let vector = self
            .network
            .embed(image)
            .map_err(|e| Error::EmbeddingUnavailable {
                key: image.image_id.clone(),
                reason: format!("{:#}", e),
            })?;
        if !vector.is_finite() {
            return Err(Error::InvalidEmbedding(image.image_id.clone()));
        }
        let entry = self
            .cache
            .entry(image.image_id.clone())
            .or_insert_with(|| Arc::new(vector));
        Ok(Arc::clone(entry.value()))
    }

    /// Embedding of a face, embedding images on demand.
    pub fn vector_of(&self, face: &Face) -> Result<Arc<EmbeddingVector>, Error> {
        match face {
            Face::Image(image) => self.embed(image),
            Face::Embedding(vector) if !vector.is_finite() => {
                Err(Error::InvalidEmbedding("precomputed embedding".into()))
            }
            Face::Embedding(vector) => Ok(Arc::new(vector.clone())),
        }
    }

    /// Similarity of two embeddings with the configured metric.
    pub fn distance_similarity(
        &self,
        a: &EmbeddingVector,
        b: &EmbeddingVector,
    ) -> Result<f64, Error> {
        self.metric.similarity(a, b)
    }

    /// Facial similarity of two cases; `None` unless both have a face.
    pub fn face_similarity(
        &self,
        a: Option<&Face>,
        b: Option<&Face>,
    ) -> Result<Option<f64>, Error> {
        match (a, b) {
            (Some(a), Some(b)) => {
                let a = self.vector_of(a)?;
                let b = self.vector_of(b)?;
                Ok(Some(self.distance_similarity(&a, &b)?))
            }
            _ => Ok(None),
        }
    }
}
