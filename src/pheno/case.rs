//! Cases (individuals) with their phenotype terms and facial data.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::err::Error;
use crate::pheno::ontology::{OntologyGraph, TermId};

/// Set of ontology terms describing one case; order is irrelevant.
///
/// Terms are kept sorted so that iteration order, and with it any
/// floating point summation over the set, is independent of insertion order.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct PhenotypeSet(BTreeSet<TermId>);

impl PhenotypeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, term_id: TermId) -> bool {
        self.0.insert(term_id)
    }

    pub fn contains(&self, term_id: &TermId) -> bool {
        self.0.contains(term_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TermId> {
        self.0.iter()
    }

    /// Map every term to its primary ID, resolving alternative IDs and names.
    pub fn normalized(&self, ontology: &OntologyGraph) -> Result<Self, Error> {
        self.iter()
            .map(|term_id| -> Result<TermId, Error> {
                Ok(ontology.resolve(term_id.as_str())?.id().clone())
            })
            .collect()
    }

    /// Drop all terms whose position is contained in `excluded`.
    ///
    /// `excluded` is usually the union of the sub-DAGs below a few
    /// uninformative terms; see [`excluded_positions`].
    pub fn without(
        &self,
        ontology: &OntologyGraph,
        excluded: &HashSet<usize>,
    ) -> Result<Self, Error> {
        let mut result = Self::new();
        for term_id in self.iter() {
            let term = ontology.resolve(term_id.as_str())?;
            if !excluded.contains(&term.idx()) {
                result.insert(term.id().clone());
            }
        }
        Ok(result)
    }

    /// Keep only the most specific terms.
    pub fn without_parents(&self, ontology: &OntologyGraph) -> Result<Self, Error> {
        Ok(ontology
            .remove_parents(&self.iter().cloned().collect::<Vec<_>>())?
            .into_iter()
            .collect())
    }
}

impl FromIterator<TermId> for PhenotypeSet {
    fn from_iter<T: IntoIterator<Item = TermId>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> FromIterator<&'a str> for PhenotypeSet {
    fn from_iter<T: IntoIterator<Item = &'a str>>(iter: T) -> Self {
        iter.into_iter().map(TermId::from).collect()
    }
}

impl<'a> IntoIterator for &'a PhenotypeSet {
    type Item = &'a TermId;
    type IntoIter = std::collections::btree_set::Iter<'a, TermId>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Positions of the given terms and all of their descendants.
pub fn excluded_positions(
    ontology: &OntologyGraph,
    roots: &[TermId],
) -> Result<HashSet<usize>, Error> {
    let mut result = HashSet::new();
    for root in roots {
        let root = ontology.resolve(root.as_str())?;
        result.extend(
            ontology
                .descendants_of(root.id())?
                .into_iter()
                .map(|term| term.idx()),
        );
    }
    Ok(result)
}

/// Fixed-length embedding of a face image.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(transparent)]
pub struct EmbeddingVector(Vec<f32>);

impl EmbeddingVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether all components are finite numbers.
    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|x| x.is_finite())
    }
}

impl From<Vec<f32>> for EmbeddingVector {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

/// Reference to a face image to be run through the embedding network.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct FaceImage {
    /// Identifier of the image, also used as the embedding cache key.
    pub image_id: String,
    /// Optional location of the image data.
    #[serde(default = "Option::default")]
    pub path: Option<String>,
}

/// Facial information of a case.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Face {
    /// Image still to be embedded.
    Image(FaceImage),
    /// Precomputed embedding.
    Embedding(EmbeddingVector),
}

/// One individual to compare.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Case {
    /// Identifier of the case.
    pub case_id: String,
    /// Observed phenotype terms.
    #[serde(default)]
    pub terms: PhenotypeSet,
    /// Facial image or embedding, if available.
    #[serde(default = "Option::default")]
    pub face: Option<Face>,
    /// Whether the case is affected by the syndrome of interest; `None`
    /// for unlabeled cases.
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub affected: Option<bool>,
}

impl Case {
    pub fn new(case_id: &str, terms: PhenotypeSet, face: Option<Face>) -> Self {
        Self {
            case_id: case_id.to_string(),
            terms,
            face,
            affected: None,
        }
    }
}

/// Load a list of cases from a JSON file (optionally gzip-compressed).
pub fn load_cases<P: AsRef<Path>>(path: P) -> Result<Vec<Case>, anyhow::Error> {
    crate::common::read_json(path)
}

/// Find a case by its identifier.
pub fn find_case<'a>(cases: &'a [Case], case_id: &str) -> Result<&'a Case, anyhow::Error> {
    cases
        .iter()
        .find(|case| case.case_id == case_id)
        .ok_or_else(|| anyhow::anyhow!("case {} not found", case_id))
}
