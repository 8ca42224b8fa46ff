// graph.rs — Arena-backed artifact dependency graph.
//
// Artifacts live in a flat `Vec` (the arena) and are addressed by slot
// index; a `HashMap` maps artifact ids and content hashes to slots. Edges
// are pairs of slot indices, and each slot keeps outgoing/incoming edge
// lists so traversals never scan the full edge set.
//
// An edge `from -> to` reads "from depends on to". The edge set must stay
// acyclic: before inserting `from -> to` we check whether `from` is already
// reachable from `to`, and reject the edge if so.
//
// The arena is append-only. That makes rollback trivial: a checkpoint is
// just the (node count, edge count) pair, and rolling back truncates.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::artifact::{Artifact, ArtifactId, ArtifactType, Relation};
use crate::error::{GraphError, IntegrityViolation};

/// An edge stored as arena slot indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Edge {
    from: usize,
    to: usize,
    relation: Relation,
}

/// An edge in id form, as persisted and returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub from: ArtifactId,
    pub to: ArtifactId,
    pub relation: Relation,
}

/// Serializable form of the graph without artifact bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphIndex {
    pub run_id: Uuid,
    pub artifacts: Vec<Artifact>,
    pub edges: Vec<EdgeRecord>,
}

/// Arena sizes captured before a multi-step write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphCheckpoint {
    nodes: usize,
    edges: usize,
}

/// Result of a full-graph integrity scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub artifacts_checked: usize,
    pub edges_checked: usize,
    pub violations: Vec<IntegrityViolation>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    /// Convert to a `Result`, surfacing the first violation found.
    pub fn into_result(self) -> Result<(), GraphError> {
        match self.violations.into_iter().next() {
            None => Ok(()),
            Some(v) => Err(GraphError::Integrity(v)),
        }
    }
}

/// The artifact dependency graph of one run.
#[derive(Debug, Clone)]
pub struct ArtifactGraph {
    run_id: Uuid,
    nodes: Vec<Artifact>,
    index: HashMap<ArtifactId, usize>,
    /// Content hash → slots carrying it, ascending.
    by_hash: HashMap<String, Vec<usize>>,
    edges: Vec<Edge>,
    outgoing: Vec<Vec<usize>>,
    incoming: Vec<Vec<usize>>,
}

impl ArtifactGraph {
    /// Create an empty graph for a run.
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            nodes: Vec::new(),
            index: HashMap::new(),
            by_hash: HashMap::new(),
            edges: Vec::new(),
            outgoing: Vec::new(),
            incoming: Vec::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn contains(&self, id: ArtifactId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn get(&self, id: ArtifactId) -> Option<&Artifact> {
        self.index.get(&id).map(|&slot| &self.nodes[slot])
    }

    /// All artifacts in registration order.
    pub fn artifacts(&self) -> impl Iterator<Item = &Artifact> {
        self.nodes.iter()
    }

    /// The first artifact registered in this run.
    pub fn root(&self) -> Option<&Artifact> {
        self.nodes.first()
    }

    /// The most recently registered artifact.
    pub fn latest(&self) -> Option<&Artifact> {
        self.nodes.last()
    }

    /// The most recently registered artifact of a given type.
    pub fn latest_of_type(&self, artifact_type: ArtifactType) -> Option<&Artifact> {
        self.nodes
            .iter()
            .rev()
            .find(|a| a.artifact_type == artifact_type)
    }

    /// Artifacts produced at a given stage, in registration order.
    pub fn produced_at_stage(&self, stage: u8) -> Vec<ArtifactId> {
        self.nodes
            .iter()
            .filter(|a| a.stage_origin == stage)
            .map(|a| a.artifact_id)
            .collect()
    }

    /// Look up the earliest-registered artifact carrying a content hash.
    pub fn find_by_hash(&self, hash: &str) -> Option<&Artifact> {
        self.by_hash
            .get(hash)
            .and_then(|slots| slots.first())
            .map(|&slot| &self.nodes[slot])
    }

    /// Register a new artifact.
    ///
    /// Fails if the id already exists (with an integrity violation when the
    /// stored artifact is immutable and the new content differs), if the
    /// recorded hash does not match the body, or if `parent_hash` does not
    /// reference a known artifact. Only the run's first artifact may have no
    /// parent. Critical-path artifacts are frozen on registration.
    pub fn register(&mut self, artifact: Artifact) -> Result<ArtifactId, GraphError> {
        let id = artifact.artifact_id;

        if let Some(&slot) = self.index.get(&id) {
            let existing = &self.nodes[slot];
            if existing.is_immutable && existing.hash != artifact.compute_hash() {
                return Err(IntegrityViolation::ImmutableMutation {
                    artifact_id: id,
                    field: "content".to_string(),
                }
                .into());
            }
            return Err(GraphError::DuplicateArtifact(id));
        }

        if artifact.run_id != self.run_id {
            return Err(GraphError::WrongRun {
                artifact_id: id,
                expected: self.run_id,
                actual: artifact.run_id,
            });
        }

        let actual = artifact.compute_hash();
        if actual != artifact.hash {
            return Err(IntegrityViolation::HashMismatch {
                artifact_id: id,
                expected: artifact.hash.clone(),
                actual,
            }
            .into());
        }

        match &artifact.parent_hash {
            None if !self.nodes.is_empty() => return Err(GraphError::MissingParent(id)),
            Some(parent) if !self.by_hash.contains_key(parent) => {
                return Err(GraphError::UnknownParent {
                    artifact_id: id,
                    parent_hash: parent.clone(),
                })
            }
            _ => {}
        }

        let mut artifact = artifact;
        if artifact.is_on_critical_path() {
            artifact.is_immutable = true;
        }
        if artifact.is_immutable {
            artifact.frozen_hash = Some(artifact.hash.clone());
        }

        tracing::debug!(
            artifact_id = %id,
            artifact_type = %artifact.artifact_type,
            immutable = artifact.is_immutable,
            "registered artifact"
        );
        self.push_node(artifact);
        Ok(id)
    }

    /// Add a dependency edge `from -> to` ("from depends on to").
    ///
    /// Rejects unknown endpoints, self-loops, duplicate edges and any edge
    /// that would close a cycle. On rejection the graph is unchanged.
    pub fn add_edge(
        &mut self,
        from: ArtifactId,
        to: ArtifactId,
        relation: Relation,
    ) -> Result<(), GraphError> {
        let f = self.slot(from)?;
        let t = self.slot(to)?;

        if f == t {
            return Err(GraphError::SelfLoop(from));
        }
        if self.outgoing[f]
            .iter()
            .any(|&e| self.edges[e].to == t && self.edges[e].relation == relation)
        {
            return Err(GraphError::DuplicateEdge { from, to, relation });
        }
        // The new edge closes a cycle iff `from` is already reachable from `to`.
        if self.reaches(t, f) {
            return Err(GraphError::CycleDetected { from, to });
        }

        let edge_index = self.edges.len();
        self.edges.push(Edge {
            from: f,
            to: t,
            relation,
        });
        self.outgoing[f].push(edge_index);
        self.incoming[t].push(edge_index);
        Ok(())
    }

    /// Artifacts that `id` depends on (targets of its outgoing edges).
    pub fn dependencies_of(&self, id: ArtifactId) -> Result<Vec<ArtifactId>, GraphError> {
        let slot = self.slot(id)?;
        Ok(self.unique_ids(self.outgoing[slot].iter().map(|&e| self.edges[e].to)))
    }

    /// Artifacts that depend on `id` (sources of its incoming edges).
    pub fn dependents_of(&self, id: ArtifactId) -> Result<Vec<ArtifactId>, GraphError> {
        let slot = self.slot(id)?;
        Ok(self.unique_ids(self.incoming[slot].iter().map(|&e| self.edges[e].from)))
    }

    /// Outgoing edges of an artifact in id form.
    pub fn edges_from(&self, id: ArtifactId) -> Result<Vec<EdgeRecord>, GraphError> {
        let slot = self.slot(id)?;
        Ok(self.outgoing[slot]
            .iter()
            .map(|&e| self.edge_record(&self.edges[e]))
            .collect())
    }

    /// All edges in insertion order.
    pub fn edges(&self) -> Vec<EdgeRecord> {
        self.edges.iter().map(|e| self.edge_record(e)).collect()
    }

    /// True iff the artifact's type is on the critical path.
    pub fn is_on_critical_path(&self, id: ArtifactId) -> Result<bool, GraphError> {
        let slot = self.slot(id)?;
        Ok(self.nodes[slot].is_on_critical_path())
    }

    /// Registered critical-path artifacts, in path order.
    pub fn critical_path(&self) -> Vec<&Artifact> {
        let mut path: Vec<(usize, usize)> = self
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(slot, a)| {
                a.artifact_type
                    .critical_path_position()
                    .map(|pos| (pos, slot))
            })
            .collect();
        path.sort();
        path.into_iter().map(|(_, slot)| &self.nodes[slot]).collect()
    }

    /// Walk `parent_hash` links from `id` back to the run's root.
    ///
    /// Returns the chain starting at `id`. A parent hash that no earlier
    /// artifact carries is an integrity violation.
    pub fn lineage(&self, id: ArtifactId) -> Result<Vec<ArtifactId>, GraphError> {
        let mut slot = self.slot(id)?;
        let mut chain = vec![self.nodes[slot].artifact_id];

        while let Some(parent) = &self.nodes[slot].parent_hash {
            // Parents are always registered before their children, so a
            // valid link points to a strictly smaller slot.
            let next = self
                .by_hash
                .get(parent)
                .and_then(|slots| slots.first().copied())
                .filter(|&s| s < slot);
            match next {
                Some(s) => {
                    slot = s;
                    chain.push(self.nodes[slot].artifact_id);
                }
                None => {
                    return Err(IntegrityViolation::BrokenLineage {
                        artifact_id: id,
                        missing: parent.clone(),
                    }
                    .into())
                }
            }
        }

        Ok(chain)
    }

    /// Replace the body of a mutable artifact.
    ///
    /// Immutable artifacts are refused with an integrity violation and left
    /// untouched. An artifact that is already some other artifact's parent
    /// is refused too, because changing its hash would break that lineage.
    pub fn update_content(
        &mut self,
        id: ArtifactId,
        content: impl Into<String>,
    ) -> Result<String, GraphError> {
        let slot = self.slot(id)?;
        if self.nodes[slot].is_immutable {
            return Err(IntegrityViolation::ImmutableMutation {
                artifact_id: id,
                field: "content".to_string(),
            }
            .into());
        }
        let old_hash = self.nodes[slot].hash.clone();
        if self
            .nodes
            .iter()
            .any(|a| a.artifact_id != id && a.parent_hash.as_deref() == Some(old_hash.as_str()))
        {
            return Err(GraphError::ReferencedByChild(id));
        }

        let content = content.into();
        let new_hash = crate::hasher::hash_str(&content);
        self.unindex_hash(&old_hash, slot);
        let node = &mut self.nodes[slot];
        node.content = content;
        node.hash = new_hash.clone();
        self.index_hash(new_hash.clone(), slot);
        Ok(new_hash)
    }

    /// Set a metadata annotation. Allowed on immutable artifacts.
    pub fn annotate(
        &mut self,
        id: ArtifactId,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), GraphError> {
        let slot = self.slot(id)?;
        self.nodes[slot]
            .annotations
            .insert(key.into(), value.into());
        Ok(())
    }

    /// Freeze an artifact. Returns `true` if it was not frozen before.
    pub fn freeze(&mut self, id: ArtifactId) -> Result<bool, GraphError> {
        let slot = self.slot(id)?;
        self.freeze_slot(slot)
    }

    /// Freeze every artifact produced at `stage`; returns the newly frozen ids.
    pub fn freeze_stage(&mut self, stage: u8) -> Result<Vec<ArtifactId>, GraphError> {
        let slots: Vec<usize> = (0..self.nodes.len())
            .filter(|&s| self.nodes[s].stage_origin == stage)
            .collect();
        self.freeze_slots(slots)
    }

    /// Freeze every artifact in the graph; returns the newly frozen ids.
    pub fn freeze_all(&mut self) -> Result<Vec<ArtifactId>, GraphError> {
        let slots: Vec<usize> = (0..self.nodes.len()).collect();
        self.freeze_slots(slots)
    }

    /// Full-graph scan: hashes, frozen hashes, parent links, edge endpoints
    /// and acyclicity. Every violation found is listed.
    pub fn validate_integrity(&self) -> IntegrityReport {
        let mut violations = Vec::new();

        for (slot, artifact) in self.nodes.iter().enumerate() {
            let actual = artifact.compute_hash();
            if actual != artifact.hash {
                violations.push(IntegrityViolation::HashMismatch {
                    artifact_id: artifact.artifact_id,
                    expected: artifact.hash.clone(),
                    actual: actual.clone(),
                });
            }
            if artifact.is_immutable {
                if let Some(frozen) = &artifact.frozen_hash {
                    if *frozen != actual {
                        violations.push(IntegrityViolation::ChangedSinceFreeze {
                            artifact_id: artifact.artifact_id,
                            frozen: frozen.clone(),
                            actual: actual.clone(),
                        });
                    }
                }
            }
            if let Some(parent) = &artifact.parent_hash {
                let resolvable = self
                    .by_hash
                    .get(parent)
                    .is_some_and(|slots| slots.iter().any(|&s| s < slot));
                if !resolvable {
                    violations.push(IntegrityViolation::BrokenLineage {
                        artifact_id: artifact.artifact_id,
                        missing: parent.clone(),
                    });
                }
            }
        }

        let mut well_formed = true;
        for (index, edge) in self.edges.iter().enumerate() {
            if edge.from >= self.nodes.len() || edge.to >= self.nodes.len() {
                violations.push(IntegrityViolation::OrphanEdge { index });
                well_formed = false;
            }
        }

        if well_formed {
            let stuck = self.cyclic_slots();
            if !stuck.is_empty() {
                violations.push(IntegrityViolation::Cycle {
                    artifacts: stuck
                        .into_iter()
                        .map(|s| self.nodes[s].artifact_id)
                        .collect(),
                });
            }
        }

        IntegrityReport {
            artifacts_checked: self.nodes.len(),
            edges_checked: self.edges.len(),
            violations,
        }
    }

    /// Capture the current arena sizes.
    pub fn checkpoint(&self) -> GraphCheckpoint {
        GraphCheckpoint {
            nodes: self.nodes.len(),
            edges: self.edges.len(),
        }
    }

    /// Drop every artifact and edge added after `checkpoint`.
    ///
    /// Freezes and annotations applied to older artifacts are not undone.
    pub fn rollback(&mut self, checkpoint: GraphCheckpoint) {
        while self.edges.len() > checkpoint.edges {
            let edge_index = self.edges.len() - 1;
            if let Some(edge) = self.edges.pop() {
                self.outgoing[edge.from].retain(|&e| e != edge_index);
                self.incoming[edge.to].retain(|&e| e != edge_index);
            }
        }
        while self.nodes.len() > checkpoint.nodes {
            let slot = self.nodes.len() - 1;
            if let Some(artifact) = self.nodes.pop() {
                self.index.remove(&artifact.artifact_id);
                self.unindex_hash(&artifact.hash, slot);
                self.outgoing.pop();
                self.incoming.pop();
            }
        }
    }

    /// Export the graph without bodies.
    pub fn index(&self) -> GraphIndex {
        GraphIndex {
            run_id: self.run_id,
            artifacts: self.nodes.clone(),
            edges: self.edges(),
        }
    }

    /// Bodies keyed by artifact id.
    pub fn bodies(&self) -> BTreeMap<ArtifactId, &str> {
        self.nodes
            .iter()
            .map(|a| (a.artifact_id, a.content.as_str()))
            .collect()
    }

    /// Rebuild a graph from a persisted index and the artifact bodies.
    ///
    /// No registration rules are re-applied; callers run
    /// [`validate_integrity`](Self::validate_integrity) afterwards.
    pub fn restore(
        index: GraphIndex,
        mut bodies: HashMap<ArtifactId, String>,
    ) -> Result<Self, GraphError> {
        let mut graph = ArtifactGraph::new(index.run_id);
        for mut artifact in index.artifacts {
            let id = artifact.artifact_id;
            if graph.index.contains_key(&id) {
                return Err(GraphError::DuplicateArtifact(id));
            }
            artifact.content = bodies.remove(&id).ok_or(GraphError::NotFound(id))?;
            graph.push_node(artifact);
        }
        for record in index.edges {
            let from = graph.slot(record.from)?;
            let to = graph.slot(record.to)?;
            let edge_index = graph.edges.len();
            graph.edges.push(Edge {
                from,
                to,
                relation: record.relation,
            });
            graph.outgoing[from].push(edge_index);
            graph.incoming[to].push(edge_index);
        }
        Ok(graph)
    }

    // ── internals ──

    fn slot(&self, id: ArtifactId) -> Result<usize, GraphError> {
        self.index.get(&id).copied().ok_or(GraphError::NotFound(id))
    }

    fn push_node(&mut self, artifact: Artifact) {
        let slot = self.nodes.len();
        self.index.insert(artifact.artifact_id, slot);
        self.index_hash(artifact.hash.clone(), slot);
        self.nodes.push(artifact);
        self.outgoing.push(Vec::new());
        self.incoming.push(Vec::new());
    }

    fn index_hash(&mut self, hash: String, slot: usize) {
        let slots = self.by_hash.entry(hash).or_default();
        slots.push(slot);
        slots.sort_unstable();
    }

    fn unindex_hash(&mut self, hash: &str, slot: usize) {
        if let Some(slots) = self.by_hash.get_mut(hash) {
            slots.retain(|&s| s != slot);
            if slots.is_empty() {
                self.by_hash.remove(hash);
            }
        }
    }

    fn freeze_slot(&mut self, slot: usize) -> Result<bool, GraphError> {
        let node = &mut self.nodes[slot];
        let actual = crate::hasher::hash_str(&node.content);
        if actual != node.hash {
            return Err(IntegrityViolation::HashMismatch {
                artifact_id: node.artifact_id,
                expected: node.hash.clone(),
                actual,
            }
            .into());
        }
        if node.is_immutable {
            return Ok(false);
        }
        node.is_immutable = true;
        node.frozen_hash = Some(actual);
        Ok(true)
    }

    fn freeze_slots(&mut self, slots: Vec<usize>) -> Result<Vec<ArtifactId>, GraphError> {
        let mut frozen = Vec::new();
        for slot in slots {
            if self.freeze_slot(slot)? {
                frozen.push(self.nodes[slot].artifact_id);
            }
        }
        Ok(frozen)
    }

    /// Depth-first reachability over outgoing edges.
    fn reaches(&self, start: usize, goal: usize) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![start];
        while let Some(slot) = stack.pop() {
            if slot == goal {
                return true;
            }
            if !seen.insert(slot) {
                continue;
            }
            stack.extend(self.outgoing[slot].iter().map(|&e| self.edges[e].to));
        }
        false
    }

    /// Kahn's algorithm; returns the slots that never reach in-degree zero.
    fn cyclic_slots(&self) -> Vec<usize> {
        let mut in_degree: Vec<usize> = self.incoming.iter().map(Vec::len).collect();
        let mut queue: VecDeque<usize> = (0..self.nodes.len())
            .filter(|&s| in_degree[s] == 0)
            .collect();
        let mut visited = vec![false; self.nodes.len()];

        while let Some(slot) = queue.pop_front() {
            visited[slot] = true;
            for &e in &self.outgoing[slot] {
                let to = self.edges[e].to;
                in_degree[to] -= 1;
                if in_degree[to] == 0 {
                    queue.push_back(to);
                }
            }
        }

        (0..self.nodes.len()).filter(|&s| !visited[s]).collect()
    }

    fn unique_ids(&self, slots: impl Iterator<Item = usize>) -> Vec<ArtifactId> {
        let mut seen = HashSet::new();
        slots
            .filter(|s| seen.insert(*s))
            .map(|s| self.nodes[s].artifact_id)
            .collect()
    }

    fn edge_record(&self, edge: &Edge) -> EdgeRecord {
        EdgeRecord {
            from: self.nodes[edge.from].artifact_id,
            to: self.nodes[edge.to].artifact_id,
            relation: edge.relation,
        }
    }
}
