//! Phenotype ontology graph with information content annotation.
//!
//! The graph is built once from a list of [`TermRecord`]s and is immutable
//! afterwards.  Terms are addressed internally by their position in the
//! term vector; the ancestor closure of every term is precomputed during
//! construction as a sorted list of such positions so that common ancestors
//! can be found by a linear merge.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::err::{Error, GraphError};

/// Identifier of an ontology term, e.g., `HP:0000118`.
#[derive(
    Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
#[serde(transparent)]
pub struct TermId(String);

impl TermId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TermId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TermId {
    fn from(value: &str) -> Self {
        TermId(value.to_string())
    }
}

impl From<String> for TermId {
    fn from(value: String) -> Self {
        TermId(value)
    }
}

/// Input record for one term as provided by the ontology source.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TermRecord {
    /// The term ID.
    pub term_id: TermId,
    /// The term name (optional).
    #[serde(default = "Option::default")]
    pub name: Option<String>,
    /// IDs of the direct parents.
    #[serde(default)]
    pub parents: Vec<TermId>,
    /// Alternative (obsolete/merged) IDs of the term.
    #[serde(default)]
    pub alt_ids: Vec<TermId>,
    /// Synonymous labels of the term.
    #[serde(default)]
    pub synonyms: Vec<String>,
    /// Precomputed information content.
    #[serde(default = "Option::default")]
    pub information_content: Option<f64>,
    /// Number of annotations (including those inherited from descendants),
    /// used to derive the information content if not given explicitly.
    #[serde(default = "Option::default")]
    pub count: Option<u64>,
}

/// Serialized form of an ontology as provided by the data loading layer.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct OntologySource {
    /// Version of the ontology release.
    #[serde(default = "Option::default")]
    pub version: Option<String>,
    /// The term records.
    pub terms: Vec<TermRecord>,
}

/// One term of the built ontology graph.
#[derive(Debug, Clone)]
pub struct OntologyTerm {
    idx: usize,
    id: TermId,
    name: Option<String>,
    parents: Vec<usize>,
    /// Sorted positions of all ancestors, including the term itself.
    ancestors: Vec<usize>,
    information_content: f64,
    /// Largest information content among the leaves below the term.
    leaf_information_content: f64,
}

impl OntologyTerm {
    pub fn id(&self) -> &TermId {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn information_content(&self) -> f64 {
        self.information_content
    }

    /// Information content of the most informative leaf descendant; the
    /// term's own information content for leaves.
    pub fn leaf_information_content(&self) -> f64 {
        self.leaf_information_content
    }

    /// Position of the term in the owning graph.
    pub fn idx(&self) -> usize {
        self.idx
    }

    /// Whether `other` is an ancestor of `self` (or `self` itself).
    pub fn has_ancestor(&self, other: &OntologyTerm) -> bool {
        self.ancestors.binary_search(&other.idx).is_ok()
    }
}

/// Immutable DAG of ontology terms.
#[derive(Debug, Clone)]
pub struct OntologyGraph {
    version: Option<String>,
    terms: Vec<OntologyTerm>,
    /// Mapping from primary term ID to position.
    index: IndexMap<TermId, usize>,
    /// Mapping from alternative IDs, names, and synonyms to position.
    aliases: HashMap<String, usize>,
}

impl OntologyGraph {
    /// Build the graph from term records.
    ///
    /// Fails on duplicate IDs, dangling parent references, cycles, and
    /// missing or invalid information content.
    pub fn build(version: Option<String>, records: Vec<TermRecord>) -> Result<Self, Error> {
        let mut index = IndexMap::with_capacity(records.len());
        for (idx, record) in records.iter().enumerate() {
            if index.insert(record.term_id.clone(), idx).is_some() {
                return Err(GraphError::DuplicateTerm(record.term_id.to_string()).into());
            }
        }

        let max_count = records.iter().filter_map(|r| r.count).max().unwrap_or(0);

        let mut terms = Vec::with_capacity(records.len());
        for (idx, record) in records.into_iter().enumerate() {
            let mut parents = Vec::with_capacity(record.parents.len());
            for parent in &record.parents {
                let parent_idx =
                    *index
                        .get(parent)
                        .ok_or_else(|| GraphError::DanglingParent {
                            term: record.term_id.to_string(),
                            parent: parent.to_string(),
                        })?;
                parents.push(parent_idx);
            }
            parents.sort_unstable();
            parents.dedup();

            let information_content = information_content(&record, max_count)?;
            terms.push(OntologyTerm {
                idx,
                id: record.term_id,
                name: record.name,
                parents,
                ancestors: Vec::new(),
                information_content,
                leaf_information_content: information_content,
            });
        }

        let order = topological_order(&terms)?;
        for &idx in &order {
            let mut ancestors = vec![idx];
            for &parent in &terms[idx].parents {
                ancestors.extend_from_slice(&terms[parent].ancestors);
            }
            ancestors.sort_unstable();
            ancestors.dedup();
            terms[idx].ancestors = ancestors;
        }

        // Children come after their parents in `order`, so walking it
        // backwards sees every leaf value of a term before the term itself.
        let mut leaf_ic = vec![None::<f64>; terms.len()];
        for &idx in order.iter().rev() {
            let value = leaf_ic[idx].unwrap_or(terms[idx].information_content);
            terms[idx].leaf_information_content = value;
            for &parent in &terms[idx].parents {
                let entry = leaf_ic[parent].get_or_insert(value);
                *entry = entry.max(value);
            }
        }

        Ok(Self {
            version,
            terms,
            index,
            aliases: HashMap::new(),
        })
    }

    /// Build the graph from a source document, registering alternative IDs,
    /// names, and synonyms for [`Self::resolve`].
    pub fn from_source(source: OntologySource) -> Result<Self, Error> {
        let aliases = source
            .terms
            .iter()
            .flat_map(|record| {
                let names = record.name.iter().cloned();
                let alt_ids = record.alt_ids.iter().map(|alt_id| alt_id.to_string());
                let synonyms = record.synonyms.iter().cloned();
                names
                    .chain(alt_ids)
                    .chain(synonyms)
                    .map(|alias| (alias, record.term_id.clone()))
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        let mut graph = Self::build(source.version, source.terms)?;
        for (alias, term_id) in aliases {
            if let Some(&idx) = graph.index.get(&term_id) {
                graph.aliases.entry(alias).or_insert(idx);
            }
        }
        Ok(graph)
    }

    /// Load the graph from a JSON file (optionally gzip-compressed).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let source: OntologySource = crate::common::read_json(path)?;
        Ok(Self::from_source(source)?)
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Iterate over all terms in input order.
    pub fn terms(&self) -> impl Iterator<Item = &OntologyTerm> {
        self.terms.iter()
    }

    /// Look up a term by its primary ID.
    pub fn term(&self, id: &TermId) -> Result<&OntologyTerm, Error> {
        self.index
            .get(id)
            .map(|&idx| &self.terms[idx])
            .ok_or_else(|| Error::UnknownTerm(id.to_string()))
    }

    /// Look up a term by primary ID, alternative ID, name, or synonym.
    pub fn resolve(&self, key: &str) -> Result<&OntologyTerm, Error> {
        self.index
            .get(&TermId::from(key))
            .or_else(|| self.aliases.get(key))
            .map(|&idx| &self.terms[idx])
            .ok_or_else(|| Error::UnknownTerm(key.to_string()))
    }

    /// All ancestors of the term, including the term itself.
    pub fn ancestors_of(&self, id: &TermId) -> Result<Vec<&OntologyTerm>, Error> {
        Ok(self
            .term(id)?
            .ancestors
            .iter()
            .map(|&idx| &self.terms[idx])
            .collect())
    }

    /// All descendants of the term, including the term itself.
    pub fn descendants_of(&self, id: &TermId) -> Result<Vec<&OntologyTerm>, Error> {
        let term = self.term(id)?;
        Ok(self.terms.iter().filter(|t| t.has_ancestor(term)).collect())
    }

    pub fn information_content(&self, id: &TermId) -> Result<f64, Error> {
        Ok(self.term(id)?.information_content)
    }

    /// Direct parents of the term.
    pub fn parents_of(&self, id: &TermId) -> Result<Vec<&OntologyTerm>, Error> {
        Ok(self
            .term(id)?
            .parents
            .iter()
            .map(|&idx| &self.terms[idx])
            .collect())
    }

    /// Common ancestors of two terms, in graph order.
    pub fn common_ancestors<'a>(
        &'a self,
        a: &OntologyTerm,
        b: &OntologyTerm,
    ) -> impl Iterator<Item = &'a OntologyTerm> {
        merge_sorted(&a.ancestors, &b.ancestors, MergeMode::Intersection)
            .into_iter()
            .map(move |idx| &self.terms[idx])
    }

    /// Union of the ancestors of two terms, in graph order.
    pub fn union_ancestors<'a>(
        &'a self,
        a: &OntologyTerm,
        b: &OntologyTerm,
    ) -> impl Iterator<Item = &'a OntologyTerm> {
        merge_sorted(&a.ancestors, &b.ancestors, MergeMode::Union)
            .into_iter()
            .map(move |idx| &self.terms[idx])
    }

    /// The most informative common ancestor of two terms.
    ///
    /// Ties are broken by graph order so the result does not depend on the
    /// order of the arguments.  Returns `None` if the terms are disconnected.
    pub fn mica(&self, a: &OntologyTerm, b: &OntologyTerm) -> Option<&OntologyTerm> {
        self.common_ancestors(a, b).fold(None, |best, term| match best {
            Some(best) if best.information_content >= term.information_content => Some(best),
            _ => Some(term),
        })
    }

    /// Length of the shortest upward path from `term` to `ancestor`.
    ///
    /// Returns `None` if `ancestor` is not an ancestor of `term`.
    pub fn distance_to_ancestor(
        &self,
        term: &OntologyTerm,
        ancestor: &OntologyTerm,
    ) -> Option<usize> {
        if !term.has_ancestor(ancestor) {
            return None;
        }
        let mut seen = HashSet::from([term.idx]);
        let mut queue = VecDeque::from([(term.idx, 0)]);
        while let Some((idx, dist)) = queue.pop_front() {
            if idx == ancestor.idx {
                return Some(dist);
            }
            for &parent in &self.terms[idx].parents {
                if self.terms[parent].has_ancestor(ancestor) && seen.insert(parent) {
                    queue.push_back((parent, dist + 1));
                }
            }
        }
        None
    }

    /// Keep only the most specific terms, dropping every term that is a
    /// proper ancestor of another term in `ids`.
    pub fn remove_parents(&self, ids: &[TermId]) -> Result<Vec<TermId>, Error> {
        let terms = ids
            .iter()
            .map(|id| self.resolve(id.as_str()))
            .collect::<Result<Vec<_>, _>>()?;
        let redundant = terms
            .iter()
            .flat_map(|term| {
                term.ancestors
                    .iter()
                    .copied()
                    .filter(move |&idx| idx != term.idx)
            })
            .collect::<HashSet<_>>();
        Ok(terms
            .into_iter()
            .filter(|term| !redundant.contains(&term.idx))
            .map(|term| term.id.clone())
            .collect())
    }
}

/// Determine the information content of a record.
fn information_content(record: &TermRecord, max_count: u64) -> Result<f64, GraphError> {
    let value = match (record.information_content, record.count) {
        (Some(value), _) => value,
        (None, Some(0)) => 0.0,
        (None, Some(count)) => -((count as f64) / (max_count as f64)).ln(),
        (None, None) => {
            return Err(GraphError::MissingInformationContent(
                record.term_id.to_string(),
            ))
        }
    };
    if !value.is_finite() || value < 0.0 {
        return Err(GraphError::InvalidInformationContent {
            term: record.term_id.to_string(),
            value,
        });
    }
    // `-ln(1)` yields `-0.0`.
    Ok(value.abs())
}

/// Kahn's algorithm over parent -> child edges; fails on cycles.
fn topological_order(terms: &[OntologyTerm]) -> Result<Vec<usize>, GraphError> {
    let mut children = vec![Vec::new(); terms.len()];
    let mut in_degree = vec![0usize; terms.len()];
    for term in terms {
        in_degree[term.idx] = term.parents.len();
        for &parent in &term.parents {
            children[parent].push(term.idx);
        }
    }

    let mut queue = (0..terms.len())
        .filter(|&idx| in_degree[idx] == 0)
        .collect::<VecDeque<_>>();
    let mut order = Vec::with_capacity(terms.len());
    while let Some(idx) = queue.pop_front() {
        order.push(idx);
        for &child in &children[idx] {
            in_degree[child] -= 1;
            if in_degree[child] == 0 {
                queue.push_back(child);
            }
        }
    }

    if order.len() < terms.len() {
        let culprit = in_degree
            .iter()
            .position(|&degree| degree > 0)
            .map(|idx| terms[idx].id.to_string())
            .unwrap_or_default();
        return Err(GraphError::Cycle(culprit));
    }
    Ok(order)
}

#[derive(Clone, Copy)]
enum MergeMode {
    Intersection,
    Union,
}

fn merge_sorted(lhs: &[usize], rhs: &[usize], mode: MergeMode) -> Vec<usize> {
    let mut result = Vec::with_capacity(lhs.len().max(rhs.len()));
    let (mut i, mut j) = (0, 0);
    while i < lhs.len() && j < rhs.len() {
        match lhs[i].cmp(&rhs[j]) {
            std::cmp::Ordering::Less => {
                if let MergeMode::Union = mode {
                    result.push(lhs[i]);
                }
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                if let MergeMode::Union = mode {
                    result.push(rhs[j]);
                }
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                result.push(lhs[i]);
                i += 1;
                j += 1;
            }
        }
    }
    if let MergeMode::Union = mode {
        result.extend_from_slice(&lhs[i..]);
        result.extend_from_slice(&rhs[j..]);
    }
    result
}


#[cfg(test)]
mod test {
    use float_cmp::approx_eq;
    use pretty_assertions::assert_eq;

    use super::fixtures::{record, toy_ontology};
    use super::*;

    fn ids(terms: &[&OntologyTerm]) -> Vec<String> {
        let mut ids = terms.iter().map(|t| t.id().to_string()).collect::<Vec<_>>();
        ids.sort();
        ids
    }

    #[rstest::rstest]
    fn ancestors_include_self_and_all_paths(toy_ontology: OntologyGraph) -> Result<(), Error> {
        let ancestors = toy_ontology.ancestors_of(&"E".into())?;
        assert_eq!(ids(&ancestors), vec!["A", "B", "C", "D", "E", "Root"]);
        Ok(())
    }

    #[rstest::rstest]
    fn descendants_include_self(toy_ontology: OntologyGraph) -> Result<(), Error> {
        let descendants = toy_ontology.descendants_of(&"A".into())?;
        assert_eq!(ids(&descendants), vec!["A", "C", "E"]);
        Ok(())
    }

    #[rstest::rstest]
    fn parents_of(toy_ontology: OntologyGraph) -> Result<(), Error> {
        let parents = toy_ontology.parents_of(&"E".into())?;
        assert_eq!(ids(&parents), vec!["C", "D"]);
        Ok(())
    }

    #[rstest::rstest]
    fn information_content_lookup(toy_ontology: OntologyGraph) -> Result<(), Error> {
        assert!(approx_eq!(
            f64,
            toy_ontology.information_content(&"D".into())?,
            2.5
        ));
        Ok(())
    }

    #[rstest::rstest]
    fn unknown_term(toy_ontology: OntologyGraph) {
        assert_eq!(
            toy_ontology.ancestors_of(&"Z".into()).unwrap_err(),
            Error::UnknownTerm("Z".into())
        );
        assert_eq!(
            toy_ontology.information_content(&"Z".into()).unwrap_err(),
            Error::UnknownTerm("Z".into())
        );
    }

    #[rstest::rstest]
    fn resolve_aliases(toy_ontology: OntologyGraph) -> Result<(), Error> {
        assert_eq!(toy_ontology.resolve("E")?.id().as_str(), "E");
        assert_eq!(toy_ontology.resolve("E-OLD")?.id().as_str(), "E");
        assert_eq!(toy_ontology.resolve("C name")?.id().as_str(), "C");
        assert!(toy_ontology.resolve("nope").is_err());
        Ok(())
    }

    #[test]
    fn resolve_synonyms() -> Result<(), Error> {
        let mut source = super::fixtures::toy_source();
        source.terms[3].synonyms = vec!["Sea".into(), "C name".into()];
        source.terms[4].synonyms = vec!["Sea".into()];
        let graph = OntologyGraph::from_source(source)?;

        assert_eq!(graph.resolve("Sea")?.id().as_str(), "C");
        assert_eq!(graph.resolve("C name")?.id().as_str(), "C");
        Ok(())
    }

    #[rstest::rstest]
    #[case("E", "E", Some(0))]
    #[case("E", "C", Some(1))]
    #[case("E", "Root", Some(3))]
    #[case("C", "Root", Some(2))]
    #[case("C", "E", None)]
    #[case("C", "Lonely", None)]
    fn distance_to_ancestor(
        toy_ontology: OntologyGraph,
        #[case] term: &str,
        #[case] ancestor: &str,
        #[case] expected: Option<usize>,
    ) -> Result<(), Error> {
        let term = toy_ontology.term(&term.into())?;
        let ancestor = toy_ontology.term(&ancestor.into())?;
        assert_eq!(toy_ontology.distance_to_ancestor(term, ancestor), expected);
        Ok(())
    }

    #[rstest::rstest]
    #[case("E", 3.0)]
    #[case("A", 3.0)]
    #[case("Root", 3.0)]
    #[case("Other", 1.5)]
    #[case("Lonely", 1.5)]
    fn leaf_information_content(
        toy_ontology: OntologyGraph,
        #[case] term: &str,
        #[case] expected: f64,
    ) -> Result<(), Error> {
        assert_eq!(
            toy_ontology.term(&term.into())?.leaf_information_content(),
            expected
        );
        Ok(())
    }

    #[rstest::rstest]
    fn mica(toy_ontology: OntologyGraph) -> Result<(), Error> {
        let c = toy_ontology.term(&"C".into())?;
        let d = toy_ontology.term(&"D".into())?;
        let e = toy_ontology.term(&"E".into())?;
        let lonely = toy_ontology.term(&"Lonely".into())?;

        assert_eq!(toy_ontology.mica(c, d).map(|t| t.id().as_str()), Some("Root"));
        assert_eq!(toy_ontology.mica(c, e).map(|t| t.id().as_str()), Some("C"));
        assert_eq!(toy_ontology.mica(e, d).map(|t| t.id().as_str()), Some("D"));
        assert!(toy_ontology.mica(c, lonely).is_none());
        Ok(())
    }

    #[rstest::rstest]
    fn union_ancestors(toy_ontology: OntologyGraph) -> Result<(), Error> {
        let c = toy_ontology.term(&"C".into())?;
        let d = toy_ontology.term(&"D".into())?;
        let union = toy_ontology.union_ancestors(c, d).collect::<Vec<_>>();
        assert_eq!(ids(&union), vec!["A", "B", "C", "D", "Root"]);
        Ok(())
    }

    #[rstest::rstest]
    fn remove_parents(toy_ontology: OntologyGraph) -> Result<(), Error> {
        let kept = toy_ontology.remove_parents(&[
            "Root".into(),
            "A".into(),
            "E".into(),
            "Lonely".into(),
        ])?;
        assert_eq!(kept, vec![TermId::from("E"), TermId::from("Lonely")]);
        Ok(())
    }

    #[test]
    fn build_rejects_dangling_parent() {
        let res = OntologyGraph::build(
            None,
            vec![record("Root", &[], 0.0), record("A", &["Missing"], 1.0)],
        );
        assert_eq!(
            res.unwrap_err(),
            Error::MalformedGraph(GraphError::DanglingParent {
                term: "A".into(),
                parent: "Missing".into()
            })
        );
    }

    #[test]
    fn build_rejects_cycle() {
        let res = OntologyGraph::build(
            None,
            vec![
                record("Root", &[], 0.0),
                record("A", &["Root", "C"], 1.0),
                record("B", &["A"], 1.0),
                record("C", &["B"], 1.0),
            ],
        );
        assert!(matches!(
            res.unwrap_err(),
            Error::MalformedGraph(GraphError::Cycle(_))
        ));
    }

    #[test]
    fn build_rejects_self_loop() {
        let res = OntologyGraph::build(None, vec![record("A", &["A"], 1.0)]);
        assert_eq!(
            res.unwrap_err(),
            Error::MalformedGraph(GraphError::Cycle("A".into()))
        );
    }

    #[test]
    fn build_rejects_duplicates() {
        let res = OntologyGraph::build(
            None,
            vec![record("Root", &[], 0.0), record("Root", &[], 0.0)],
        );
        assert_eq!(
            res.unwrap_err(),
            Error::MalformedGraph(GraphError::DuplicateTerm("Root".into()))
        );
    }

    #[rstest::rstest]
    #[case(-1.0)]
    #[case(f64::NAN)]
    #[case(f64::INFINITY)]
    fn build_rejects_invalid_information_content(#[case] ic: f64) {
        let res = OntologyGraph::build(None, vec![record("Root", &[], ic)]);
        assert!(matches!(
            res.unwrap_err(),
            Error::MalformedGraph(GraphError::InvalidInformationContent { .. })
        ));
    }

    #[test]
    fn information_content_from_counts() -> Result<(), Error> {
        let counted = |id: &str, parents: &[&str], count: Option<u64>| TermRecord {
            information_content: None,
            count,
            ..record(id, parents, 0.0)
        };
        let graph = OntologyGraph::build(
            None,
            vec![
                counted("Root", &[], Some(100)),
                counted("A", &["Root"], Some(10)),
                counted("B", &["Root"], Some(0)),
            ],
        )?;

        assert_eq!(graph.information_content(&"Root".into())?, 0.0);
        assert!(approx_eq!(
            f64,
            graph.information_content(&"A".into())?,
            10f64.ln(),
            ulps = 2
        ));
        assert_eq!(graph.information_content(&"B".into())?, 0.0);

        let res = OntologyGraph::build(None, vec![counted("Root", &[], None)]);
        assert_eq!(
            res.unwrap_err(),
            Error::MalformedGraph(GraphError::MissingInformationContent("Root".into()))
        );
        Ok(())
    }

    #[test]
    fn load_from_json() -> Result<(), anyhow::Error> {
        let graph = OntologyGraph::load("tests/data/pheno/ontology.json")?;
        assert_eq!(graph.version(), Some("toy-2024-01"));
        assert!(!graph.is_empty());
        assert_eq!(graph.resolve("HP:0000999")?.id().as_str(), "HP:0000271");
        assert_eq!(
            graph.resolve("Widely spaced eyes")?.id().as_str(),
            "HP:0000316"
        );
        Ok(())
    }
}
