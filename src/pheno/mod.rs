//! Phenotypic and facial similarity of cases.

pub mod algos;
pub mod case;
pub mod compare;
pub mod conf;
pub mod embed;
pub mod fusion;
pub mod matrix;
pub mod ontology;
pub mod prepare;
pub mod prune;
pub mod query;
pub mod significance;
