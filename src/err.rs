//! Error types for phenotype scoring.

use std::process::{ExitCode, Termination};

/// Problems detected while building the ontology graph.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("term {0} is defined more than once")]
    DuplicateTerm(String),
    #[error("term {term} references unknown parent {parent}")]
    DanglingParent { term: String, parent: String },
    #[error("cycle detected involving term {0}")]
    Cycle(String),
    #[error("term {term} has invalid information content {value}")]
    InvalidInformationContent { term: String, value: f64 },
    #[error("term {0} has neither information content nor annotation count")]
    MissingInformationContent(String),
}

/// Errors raised by the scoring core.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("unknown ontology term: {0}")]
    UnknownTerm(String),
    #[error("malformed ontology graph: {0}")]
    MalformedGraph(#[from] GraphError),
    #[error("embedding unavailable for {key}: {reason}")]
    EmbeddingUnavailable { key: String, reason: String },
    #[error("invalid fusion weights: {0}")]
    InvalidWeights(String),
    #[error("embedding dimensions differ ({0} vs. {1})")]
    DimensionMismatch(usize, usize),
    #[error("embedding for {0} contains non-finite values")]
    InvalidEmbedding(String),
}

impl Error {
    /// Whether a resampling draw failing with this error may be excluded
    /// from the null distribution instead of aborting the batch.
    pub fn is_isolated(&self) -> bool {
        matches!(
            self,
            Error::EmbeddingUnavailable { .. } | Error::InvalidEmbedding(_)
        )
    }
}

impl Termination for Error {
    fn report(self) -> ExitCode {
        match self {
            Error::UnknownTerm(_) => ExitCode::from(2),
            Error::MalformedGraph(_) => ExitCode::from(3),
            Error::EmbeddingUnavailable { .. } | Error::InvalidEmbedding(_) => ExitCode::from(4),
            Error::InvalidWeights(_) | Error::DimensionMismatch(..) => ExitCode::from(1),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[rstest::rstest]
    #[case(Error::UnknownTerm("HP:1".into()), false)]
    #[case(Error::MalformedGraph(GraphError::Cycle("HP:1".into())), false)]
    #[case(Error::EmbeddingUnavailable { key: "img".into(), reason: "boom".into() }, true)]
    #[case(Error::InvalidWeights("negative".into()), false)]
    #[case(Error::DimensionMismatch(2, 3), false)]
    #[case(Error::InvalidEmbedding("img".into()), true)]
    fn is_isolated(#[case] err: Error, #[case] expected: bool) {
        assert_eq!(err.is_isolated(), expected);
    }

    #[test]
    fn display_graph_error() {
        let err: Error = GraphError::DanglingParent {
            term: "HP:2".into(),
            parent: "HP:9".into(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "malformed ontology graph: term HP:2 references unknown parent HP:9"
        );
    }
}
