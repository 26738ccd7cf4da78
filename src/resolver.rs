// 🔍 Entity Resolver - group observations of the same physical park
//
// Blocking: a pair is only compared when the records share a grid cell (or a
// neighbouring one), a significant name token, or a source reference.
// Clustering: union-find over matching pairs, processed best-first, so the
// result is transitive and does not depend on input order.

use crate::config::ResolverConfig;
use crate::entity::{CandidateRecord, Field, ParkEntity};
use crate::geo::{GeoPoint, GridCell};
use crate::names::{name_similarity, normalize_name, significant_tokens};
use log::debug;
use petgraph::unionfind::UnionFind;
use std::collections::{BTreeMap, BTreeSet, HashMap};

// ============================================================================
// TYPES
// ============================================================================

/// Anchor - an existing registry park taking part in resolution so that new
/// observations attach to it instead of minting a new park
#[derive(Debug, Clone, PartialEq)]
pub struct Anchor {
    pub park_id: String,
    pub normalized_name: String,
    pub point: Option<GeoPoint>,
    pub source_refs: BTreeSet<String>,
}

impl Anchor {
    pub fn from_entity(entity: &ParkEntity) -> Self {
        Anchor {
            park_id: entity.park_id.clone(),
            normalized_name: entity.text(Field::Name).map(normalize_name).unwrap_or_default(),
            point: entity.point(),
            source_refs: entity.source_refs.clone(),
        }
    }
}

/// MergeCluster - candidates believed to be one park. Transient: consumed by
/// the reconciler right away.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeCluster {
    /// Candidates in canonical order
    pub members: Vec<CandidateRecord>,

    /// Registry park this cluster attached to, if any
    pub park_id: Option<String>,

    /// Matches that cleared the threshold but had to be refused
    pub contested: Vec<String>,
}

impl MergeCluster {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolutionStats {
    pub candidates: usize,
    pub comparisons: usize,
    pub matches: usize,
    pub unions: usize,
    pub refused: usize,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub clusters: Vec<MergeCluster>,
    pub stats: ResolutionStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum MatchKind {
    /// Same source reference: same feature, whatever the geometry says
    SourceRef,
    Scored,
}

#[derive(Debug, Clone, Copy)]
struct PairMatch {
    kind: MatchKind,
    i: usize,
    j: usize,
    score: f64,
    distance_m: f64,
}

/// Node in the resolution graph: anchors first, then candidates
struct Node<'a> {
    normalized_name: &'a str,
    point: Option<GeoPoint>,
    refs: Vec<&'a str>,
    anchor: Option<&'a str>,
}

// ============================================================================
// RESOLVER
// ============================================================================

pub struct EntityResolver {
    config: ResolverConfig,
}

impl EntityResolver {
    pub fn new(config: ResolverConfig) -> Self {
        EntityResolver { config }
    }

    /// Cluster a fresh candidate set
    pub fn resolve(&self, candidates: &[CandidateRecord]) -> Resolution {
        self.resolve_against(candidates, &[])
    }

    /// Cluster candidates together with existing registry parks
    pub fn resolve_against(&self, candidates: &[CandidateRecord], anchors: &[Anchor]) -> Resolution {
        let mut ordered: Vec<&CandidateRecord> = candidates.iter().collect();
        ordered.sort_by(|a, b| a.canonical_cmp(b));

        let mut sorted_anchors: Vec<&Anchor> = anchors.iter().collect();
        sorted_anchors.sort_by(|a, b| a.park_id.cmp(&b.park_id));

        let nodes: Vec<Node<'_>> = sorted_anchors
            .iter()
            .map(|a| Node {
                normalized_name: a.normalized_name.as_str(),
                point: a.point,
                refs: a.source_refs.iter().map(String::as_str).collect(),
                anchor: Some(a.park_id.as_str()),
            })
            .chain(ordered.iter().map(|c| Node {
                normalized_name: c.normalized_name.as_str(),
                point: c.point,
                refs: c.source_ref.as_deref().into_iter().collect(),
                anchor: None,
            }))
            .collect();

        let mut stats = ResolutionStats {
            candidates: ordered.len(),
            ..Default::default()
        };

        // 1. Blocking → candidate pairs
        let pairs = self.candidate_pairs(&nodes);
        stats.comparisons = pairs.len();

        // 2. Score pairs
        let mut matches: Vec<PairMatch> = pairs
            .into_iter()
            .filter_map(|(i, j)| self.compare(&nodes, i, j))
            .collect();
        stats.matches = matches.len();

        // Best first: source-ref links, then score, then closer, then index
        matches.sort_by(|a, b| {
            a.kind
                .cmp(&b.kind)
                .then_with(|| b.score.total_cmp(&a.score))
                .then_with(|| a.distance_m.total_cmp(&b.distance_m))
                .then_with(|| a.i.cmp(&b.i))
                .then_with(|| a.j.cmp(&b.j))
        });

        // 3. Union-find with exclusivity constraints
        let mut sets = UnionFind::<usize>::new(nodes.len());
        let mut members: Vec<Vec<usize>> = (0..nodes.len()).map(|i| vec![i]).collect();
        let mut anchor_of: Vec<Option<usize>> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| n.anchor.map(|_| i))
            .collect();
        let mut contested: BTreeMap<usize, Vec<String>> = BTreeMap::new();

        for m in &matches {
            let ri = sets.find(m.i);
            let rj = sets.find(m.j);
            if ri == rj {
                continue;
            }

            if let Some(reason) = self.refusal(&nodes, &members[ri], &members[rj], anchor_of[ri], anchor_of[rj], m) {
                debug!("refused match {} ~ {}: {}", m.i, m.j, reason);
                stats.refused += 1;
                contested.entry(m.i).or_default().push(reason.clone());
                contested.entry(m.j).or_default().push(reason);
                continue;
            }

            sets.union(m.i, m.j);
            stats.unions += 1;
            let root = sets.find(m.i);
            let (keep, other) = if root == ri { (ri, rj) } else { (rj, ri) };
            let moved = std::mem::take(&mut members[other]);
            members[keep].extend(moved);
            anchor_of[keep] = anchor_of[keep].or(anchor_of[other]);
        }

        // 4. Collect clusters in canonical order of their first node
        let offset = sorted_anchors.len();
        let mut clusters = Vec::new();
        let mut roots: Vec<usize> = (0..nodes.len())
            .filter(|&i| sets.find(i) == i)
            .collect();
        roots.sort_by_key(|&r| members[r].iter().copied().min().unwrap_or(r));

        for root in roots {
            let mut group = members[root].clone();
            group.sort_unstable();

            let candidates: Vec<CandidateRecord> = group
                .iter()
                .filter(|&&n| n >= offset)
                .map(|&n| ordered[n - offset].clone())
                .collect();
            if candidates.is_empty() {
                continue; // registry park with no new observations
            }

            let mut reasons: Vec<String> = group
                .iter()
                .filter_map(|n| contested.get(n))
                .flatten()
                .cloned()
                .collect();
            reasons.sort();
            reasons.dedup();

            clusters.push(MergeCluster {
                members: candidates,
                park_id: anchor_of[root].and_then(|a| nodes[a].anchor).map(str::to_string),
                contested: reasons,
            });
        }

        Resolution { clusters, stats }
    }

    /// Pairs (i < j) sharing a cell neighbourhood, a significant name token
    /// or a source reference
    fn candidate_pairs(&self, nodes: &[Node<'_>]) -> BTreeSet<(usize, usize)> {
        let mut cells: HashMap<GridCell, Vec<usize>> = HashMap::new();
        let mut token_index: HashMap<&str, Vec<usize>> = HashMap::new();
        let mut ref_index: HashMap<&str, Vec<usize>> = HashMap::new();

        for (i, node) in nodes.iter().enumerate() {
            if let Some(p) = node.point {
                cells.entry(p.cell()).or_default().push(i);
            }
            for token in significant_tokens(node.normalized_name) {
                token_index.entry(token).or_default().push(i);
            }
            for r in &node.refs {
                ref_index.entry(*r).or_default().push(i);
            }
        }

        let mut pairs = BTreeSet::new();
        let mut add = |a: usize, b: usize| {
            if a != b {
                pairs.insert((a.min(b), a.max(b)));
            }
        };

        for (i, node) in nodes.iter().enumerate() {
            if let Some(p) = node.point {
                for cell in p.cell().neighbourhood() {
                    for &j in cells.get(&cell).into_iter().flatten() {
                        add(i, j);
                    }
                }
            }
            for token in significant_tokens(node.normalized_name) {
                for &j in token_index.get(token).into_iter().flatten() {
                    add(i, j);
                }
            }
            for r in &node.refs {
                for &j in ref_index.get(r).into_iter().flatten() {
                    add(i, j);
                }
            }
        }

        pairs
    }

    fn compare(&self, nodes: &[Node<'_>], i: usize, j: usize) -> Option<PairMatch> {
        let (a, b) = (&nodes[i], &nodes[j]);
        if a.anchor.is_some() && b.anchor.is_some() {
            return None; // two registry parks never merge
        }

        let distance = match (a.point, b.point) {
            (Some(pa), Some(pb)) => Some(pa.distance_m(&pb)),
            _ => None,
        };

        if a.refs.iter().any(|r| b.refs.contains(r)) {
            return Some(PairMatch {
                kind: MatchKind::SourceRef,
                i,
                j,
                score: 1.0,
                distance_m: distance.unwrap_or(0.0),
            });
        }

        let (pa, pb, d) = match (a.point, b.point, distance) {
            (Some(pa), Some(pb), Some(d)) => (pa, pb, d),
            _ => return None,
        };
        if d > self.config.max_merge_radius_m {
            return None;
        }

        let unnamed = a.normalized_name.is_empty() || b.normalized_name.is_empty();
        let similarity = name_similarity(a.normalized_name, b.normalized_name);

        let same_site = pa.cell() == pb.cell() && d <= self.config.same_site_radius_m;
        let qualifies = similarity >= self.config.name_match_threshold
            || (same_site && (unnamed || similarity >= self.config.same_cell_name_threshold));
        if !qualifies {
            return None;
        }

        let proximity = 1.0 - d / self.config.max_merge_radius_m;
        let w = self.config.name_weight;
        Some(PairMatch {
            kind: MatchKind::Scored,
            i,
            j,
            score: w * similarity + (1.0 - w) * proximity,
            distance_m: d,
        })
    }

    /// Why a union would break an invariant, if it would
    fn refusal(
        &self,
        nodes: &[Node<'_>],
        left: &[usize],
        right: &[usize],
        left_anchor: Option<usize>,
        right_anchor: Option<usize>,
        m: &PairMatch,
    ) -> Option<String> {
        if let (Some(x), Some(y)) = (left_anchor, right_anchor) {
            if x != y {
                return Some(format!(
                    "observation matches both {} and {}",
                    nodes[x].anchor.unwrap_or("?"),
                    nodes[y].anchor.unwrap_or("?")
                ));
            }
        }
        if m.kind == MatchKind::SourceRef {
            return None;
        }

        for &a in left {
            for &b in right {
                if let (Some(pa), Some(pb)) = (nodes[a].point, nodes[b].point) {
                    let d = pa.distance_m(&pb);
                    if d > self.config.max_merge_radius_m {
                        return Some(format!(
                            "merge would span {:.0} m (limit {:.0} m)",
                            d, self.config.max_merge_radius_m
                        ));
                    }
                }
            }
        }
        None
    }
}

impl Default for EntityResolver {
    fn default() -> Self {
        EntityResolver::new(ResolverConfig::default())
    }
}

/// (source, source_ref) pairs of a cluster, sorted; stable across runs
pub fn cluster_signature(cluster: &MergeCluster) -> Vec<(String, Option<String>)> {
    let mut sig: Vec<(String, Option<String>)> = cluster
        .members
        .iter()
        .map(|c| (c.source.to_string(), c.source_ref.clone()))
        .collect();
    sig.sort();
    sig
}
