//! Fusion of phenotype and facial similarity into one composite score.

use serde::{Deserialize, Serialize};

use crate::err::Error;
use crate::pheno::algos::phenomizer::SetSimilarity;

/// Relative weights of the two similarity components.
///
/// The weights need not sum to one; they are normalized over the components
/// that are actually available for a comparison.  Deserialization goes
/// through the same checks as [`Weights::new`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(try_from = "RawWeights")]
pub struct Weights {
    /// Weight of the phenotype (ontology term) similarity.
    phenotype: f64,
    /// Weight of the facial (embedding) similarity.
    face: f64,
}

/// Unchecked weights as found in configuration files.
#[derive(Deserialize)]
struct RawWeights {
    phenotype: f64,
    face: f64,
}

impl TryFrom<RawWeights> for Weights {
    type Error = Error;

    fn try_from(value: RawWeights) -> Result<Self, Self::Error> {
        Weights::new(value.phenotype, value.face)
    }
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            phenotype: 1.0,
            face: 1.0,
        }
    }
}

impl Weights {
    pub fn new(phenotype: f64, face: f64) -> Result<Self, Error> {
        for (name, value) in [("phenotype", phenotype), ("face", face)] {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::InvalidWeights(format!(
                    "{} weight must be a non-negative number, got {}",
                    name, value
                )));
            }
        }
        if phenotype + face == 0.0 {
            return Err(Error::InvalidWeights(
                "at least one weight must be positive".into(),
            ));
        }
        Ok(Self { phenotype, face })
    }

    /// Weight of the phenotype similarity.
    pub fn phenotype(&self) -> f64 {
        self.phenotype
    }

    /// Weight of the face similarity.
    pub fn face(&self) -> f64 {
        self.face
    }
}

/// How to combine the weighted components.
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
pub enum FusionMethod {
    /// Weighted arithmetic mean.
    #[default]
    WeightedMean,
    /// Weighted geometric mean; any zero component yields zero.
    WeightedGeometric,
}

/// Fused score together with its components.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct CompositeScore {
    /// The fused score in `[0, 1]`.
    pub score: f64,
    /// The phenotype similarity component.
    pub phenotype: f64,
    /// Whether the phenotype comparison was degenerate (empty term set).
    pub phenotype_degenerate: bool,
    /// The facial similarity component, if both cases had a face.
    pub face: Option<f64>,
    /// Normalized weight applied to the phenotype component.
    pub phenotype_weight: f64,
    /// Normalized weight applied to the face component.
    pub face_weight: f64,
}

impl FusionMethod {
    /// Combine the components with the given weights.
    ///
    /// Degenerate phenotype comparisons and missing face similarities do not
    /// take part in the combination.  If no component is usable, the score
    /// is `0.0` and both applied weights are `0.0`.
    pub fn fuse(
        &self,
        phenotype: &SetSimilarity,
        face: Option<f64>,
        weights: &Weights,
    ) -> CompositeScore {
        let w_pheno = if phenotype.degenerate {
            0.0
        } else {
            weights.phenotype()
        };
        let w_face = if face.is_some() { weights.face() } else { 0.0 };
        let total = w_pheno + w_face;

        let (phenotype_weight, face_weight) = if total > 0.0 {
            (w_pheno / total, w_face / total)
        } else {
            (0.0, 0.0)
        };
        let components = [
            (phenotype.score, phenotype_weight),
            (face.unwrap_or_default(), face_weight),
        ];

        let score = if total > 0.0 {
            match self {
                FusionMethod::WeightedMean => components.iter().map(|(x, w)| w * x).sum::<f64>(),
                FusionMethod::WeightedGeometric => {
                    if components.iter().any(|&(x, w)| w > 0.0 && x <= 0.0) {
                        0.0
                    } else {
                        components
                            .iter()
                            .filter(|(_, w)| *w > 0.0)
                            .map(|(x, w)| w * x.ln())
                            .sum::<f64>()
                            .exp()
                    }
                }
            }
        } else {
            0.0
        };

        CompositeScore {
            score: score.clamp(0.0, 1.0),
            phenotype: phenotype.score,
            phenotype_degenerate: phenotype.degenerate,
            face,
            phenotype_weight,
            face_weight,
        }
    }
}

/// Fuse with the weighted arithmetic mean.
pub fn fuse(phenotype: &SetSimilarity, face: Option<f64>, weights: &Weights) -> CompositeScore {
    FusionMethod::WeightedMean.fuse(phenotype, face, weights)
}
