//! Provenance graph across symbolic heaps
//!
//! Every heap points at one node of a process-wide trace graph owned by the
//! engine context. A node records which operation produced the heap (entry,
//! clone, transfer of an instruction, join, prune) and, per parent, an
//! id-mapper translating the parent heap's value ids into the child's. When
//! a state container keeps an existing heap but adopts a freshly joined
//! trace node, the mappers are recomposed so that downstream error
//! attribution keeps resolving to real source locations.

use crate::heap::ValId;
use shale_ir::{FncId, Loc};
use std::collections::{BTreeMap, BTreeSet};

/// Index of a node in the [`TraceGraph`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceId(pub u32);

/// What a trace node's not-found lookup resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapDefault {
    /// Unmapped ids map to themselves.
    Identity,
    /// Unmapped ids map to nothing.
    Nothing,
}

/// A (possibly one-to-many) mapping of value ids across one heap derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdMapper {
    map: BTreeMap<ValId, BTreeSet<ValId>>,
    default: MapDefault,
}

impl IdMapper {
    pub fn identity() -> Self {
        IdMapper {
            map: BTreeMap::new(),
            default: MapDefault::Identity,
        }
    }

    pub fn new() -> Self {
        IdMapper {
            map: BTreeMap::new(),
            default: MapDefault::Nothing,
        }
    }

    pub fn insert(&mut self, from: ValId, to: ValId) {
        self.map.entry(from).or_default().insert(to);
    }

    pub fn query(&self, from: ValId) -> Vec<ValId> {
        match self.map.get(&from) {
            Some(set) => set.iter().copied().collect(),
            None => match self.default {
                MapDefault::Identity => vec![from],
                MapDefault::Nothing => Vec::new(),
            },
        }
    }

    /// Swap the direction of the mapping in place.
    pub fn flip(&mut self) {
        let mut rev: BTreeMap<ValId, BTreeSet<ValId>> = BTreeMap::new();
        for (from, tos) in &self.map {
            for to in tos {
                rev.entry(*to).or_default().insert(*from);
            }
        }
        self.map = rev;
    }

    /// Replace `self` by `other ∘ self`: first apply `self`, then `other`.
    pub fn compose(&mut self, other: &IdMapper) {
        let mut out: BTreeMap<ValId, BTreeSet<ValId>> = BTreeMap::new();
        for (from, mids) in &self.map {
            let mut tos = BTreeSet::new();
            for mid in mids {
                tos.extend(other.query(*mid));
            }
            if !tos.is_empty() {
                out.insert(*from, tos);
            }
        }
        self.map = out;
        if self.default == MapDefault::Identity && other.default != MapDefault::Identity {
            self.default = MapDefault::Nothing;
        }
    }

    pub fn is_identity(&self) -> bool {
        self.default == MapDefault::Identity && self.map.is_empty()
    }
}

impl Default for IdMapper {
    fn default() -> Self {
        IdMapper::new()
    }
}

/// The operation a trace node stands for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceKind {
    /// Entry point of one analyzed function; has no parents.
    Root { fnc: FncId },
    /// Internal scaffolding (result heap under construction).
    Transient { origin: &'static str },
    /// Plain heap clone.
    CloneOp,
    /// Transfer of one named instruction.
    Insn { loc: Loc, desc: String },
    /// Result of joining two heaps.
    Join,
    /// Reachability prune along a cut.
    Prune,
}

#[derive(Debug, Clone)]
struct TraceNode {
    kind: TraceKind,
    parents: Vec<TraceId>,
    id_maps: Vec<IdMapper>,
    waived: bool,
}

/// Arena-backed trace graph; nodes are only appended, teardown drops the
/// arena wholesale.
#[derive(Debug, Default)]
pub struct TraceGraph {
    nodes: Vec<TraceNode>,
}

impl TraceGraph {
    pub fn new() -> Self {
        TraceGraph::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root(&mut self, fnc: FncId) -> TraceId {
        self.push(TraceKind::Root { fnc }, Vec::new(), Vec::new())
    }

    pub fn transient(&mut self, origin: &'static str) -> TraceId {
        self.push(TraceKind::Transient { origin }, Vec::new(), Vec::new())
    }

    pub fn clone_node(&mut self, parent: TraceId) -> TraceId {
        self.push(
            TraceKind::CloneOp,
            vec![parent],
            vec![IdMapper::identity()],
        )
    }

    pub fn insn_node(&mut self, parent: TraceId, loc: Loc, desc: String) -> TraceId {
        self.push(
            TraceKind::Insn { loc, desc },
            vec![parent],
            vec![IdMapper::identity()],
        )
    }

    pub fn prune_node(&mut self, parent: TraceId, map: IdMapper) -> TraceId {
        self.push(TraceKind::Prune, vec![parent], vec![map])
    }

    pub fn join_node(
        &mut self,
        parent1: TraceId,
        parent2: TraceId,
        map1: IdMapper,
        map2: IdMapper,
    ) -> TraceId {
        self.push(TraceKind::Join, vec![parent1, parent2], vec![map1, map2])
    }

    pub fn kind(&self, id: TraceId) -> &TraceKind {
        &self.nodes[id.0 as usize].kind
    }

    pub fn parents(&self, id: TraceId) -> &[TraceId] {
        &self.nodes[id.0 as usize].parents
    }

    pub fn id_maps(&self, id: TraceId) -> &[IdMapper] {
        &self.nodes[id.0 as usize].id_maps
    }

    pub fn id_maps_mut(&mut self, id: TraceId) -> &mut Vec<IdMapper> {
        &mut self.nodes[id.0 as usize].id_maps
    }

    /// Mark a clone node so that it is spliced out when the clone replaces
    /// its source: effective lookups resolve to the parent.
    pub fn waive_clone(&mut self, id: TraceId) {
        let node = &mut self.nodes[id.0 as usize];
        if node.kind == TraceKind::CloneOp {
            node.waived = true;
        }
    }

    /// Resolve past waived clone nodes.
    pub fn effective(&self, id: TraceId) -> TraceId {
        let mut cur = id;
        loop {
            let node = &self.nodes[cur.0 as usize];
            if node.waived && !node.parents.is_empty() {
                cur = node.parents[0];
            } else {
                return cur;
            }
        }
    }

    /// Redirect every edge targeting `old` to `new`. Only meaningful when
    /// cyclic trace graphs are allowed; the caller re-points its heap.
    pub fn replace_node(&mut self, old: TraceId, new: TraceId) {
        for node in &mut self.nodes {
            for parent in &mut node.parents {
                if *parent == old {
                    *parent = new;
                }
            }
        }
    }

    /// Source locations of the instruction nodes on the path from `id` back
    /// to its root, nearest first. Multi-parent nodes follow their first
    /// parent, which is the surviving side of a join.
    pub fn insn_trail(&self, id: TraceId) -> Vec<Loc> {
        let mut trail = Vec::new();
        let mut cur = self.effective(id);
        let mut seen = BTreeSet::new();
        loop {
            if !seen.insert(cur) {
                // a cyclic graph (allowed by configuration) terminates here
                break;
            }
            let node = &self.nodes[cur.0 as usize];
            if let TraceKind::Insn { loc, .. } = &node.kind {
                trail.push(loc.clone());
            }
            match node.parents.first() {
                Some(&parent) => cur = parent,
                None => break,
            }
        }
        trail
    }

    fn push(&mut self, kind: TraceKind, parents: Vec<TraceId>, id_maps: Vec<IdMapper>) -> TraceId {
        debug_assert_eq!(parents.len(), id_maps.len());
        let id = TraceId(self.nodes.len() as u32);
        self.nodes.push(TraceNode {
            kind,
            parents,
            id_maps,
            waived: false,
        });
        id
    }
}
