//! Entity dependency graph.
//!
//! Entities declare the entities they require; a required entity must be
//! reconciled first so that foreign keys pointing at it resolve. The graph
//! owns every node in an arena and links them by index in both directions.
//!
//! ## Key Invariants
//!
//! - Every edge is stored on both ends (`parents` of the dependent and
//!   `children` of the dependency)
//! - Edges that would close a cycle are rejected when added
//! - Ordering uses Kahn's algorithm, ties broken by insertion order
//! - No walk recurses; every traversal keeps an explicit visited set

use crate::error::{SyncError, SyncResult};
use crate::policy::EntityPolicy;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// One entity in the graph.
#[derive(Debug, Clone)]
pub struct EntityNode<T> {
    id: String,
    payload: T,
    parents: BTreeSet<usize>,
    children: BTreeSet<usize>,
}

impl<T> EntityNode<T> {
    /// Entity name.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The value attached to the node.
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Returns true if the node depends on nothing.
    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }
}

/// Dependency DAG over entities.
#[derive(Debug, Clone)]
pub struct EntityGraph<T = EntityPolicy> {
    nodes: Vec<EntityNode<T>>,
    index: HashMap<String, usize>,
}

impl<T> Default for EntityGraph<T> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl EntityGraph<EntityPolicy> {
    /// Builds the graph of a policy set from their `requires` lists.
    ///
    /// Fails without returning a partial graph if any reference is unknown
    /// or the references form a cycle.
    pub fn from_policies(policies: impl IntoIterator<Item = EntityPolicy>) -> SyncResult<Self> {
        let mut graph = Self::new();
        let mut edges = Vec::new();
        for policy in policies {
            let name = policy.name.clone();
            for required in &policy.requires {
                edges.push((name.clone(), required.clone()));
            }
            graph.add_node(name, policy)?;
        }
        for (node, depends_on) in edges {
            graph.add_dependency(&node, &depends_on)?;
        }
        Ok(graph)
    }
}

impl<T> EntityGraph<T> {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns true if `id` is a node of this graph.
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Adds a node.
    pub fn add_node(&mut self, id: impl Into<String>, payload: T) -> SyncResult<()> {
        let id = id.into();
        if id.is_empty() {
            return Err(SyncError::UnknownEntity);
        }
        if self.index.contains_key(&id) {
            return Err(SyncError::configuration(format!(
                "entity '{id}' is declared twice"
            )));
        }
        self.index.insert(id.clone(), self.nodes.len());
        self.nodes.push(EntityNode {
            id,
            payload,
            parents: BTreeSet::new(),
            children: BTreeSet::new(),
        });
        Ok(())
    }

    /// Registers `depends_on` as a parent of `node`.
    ///
    /// Adding an existing edge is a no-op.
    pub fn add_dependency(&mut self, node: &str, depends_on: &str) -> SyncResult<()> {
        if node.is_empty() || depends_on.is_empty() {
            return Err(SyncError::UnknownEntity);
        }
        let child = self.resolve(node, node)?;
        let parent = self.resolve(node, depends_on)?;

        if self.nodes[child].parents.contains(&parent) {
            return Ok(());
        }
        if child == parent || self.reaches_parent(parent, child) {
            return Err(SyncError::DependencyCycle {
                entities: vec![node.to_string(), depends_on.to_string()],
            });
        }

        self.nodes[child].parents.insert(parent);
        self.nodes[parent].children.insert(child);
        Ok(())
    }

    fn resolve(&self, entity: &str, reference: &str) -> SyncResult<usize> {
        self.index
            .get(reference)
            .copied()
            .ok_or_else(|| SyncError::UnresolvedReference {
                entity: entity.to_string(),
                reference: reference.to_string(),
            })
    }

    /// Returns the node named `id`.
    pub fn node(&self, id: &str) -> Option<&EntityNode<T>> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Returns the payload of `id`.
    pub fn payload(&self, id: &str) -> Option<&T> {
        self.node(id).map(EntityNode::payload)
    }

    /// Iterates nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &EntityNode<T>> {
        self.nodes.iter()
    }

    /// Nodes without dependencies.
    pub fn roots(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.is_root())
            .map(|n| n.id.as_str())
            .collect()
    }

    /// Direct dependencies of `id`.
    pub fn parents(&self, id: &str) -> Vec<&str> {
        self.linked(id, |n| &n.parents)
    }

    /// Direct dependents of `id`.
    pub fn children(&self, id: &str) -> Vec<&str> {
        self.linked(id, |n| &n.children)
    }

    fn linked<'a>(
        &'a self,
        id: &str,
        edges: impl Fn(&'a EntityNode<T>) -> &'a BTreeSet<usize>,
    ) -> Vec<&'a str> {
        match self.index.get(id) {
            Some(&i) => edges(&self.nodes[i])
                .iter()
                .map(|&j| self.nodes[j].id.as_str())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Returns true if `ancestor` is a transitive dependency of `id`.
    pub fn has_ancestor(&self, id: &str, ancestor: &str) -> bool {
        match (self.index.get(id), self.index.get(ancestor)) {
            (Some(&from), Some(&to)) => self.reaches_parent(from, to),
            _ => false,
        }
    }

    /// Transitive dependencies of `id`, nearest first.
    pub fn ancestors(&self, id: &str) -> Vec<&str> {
        self.walk(id, |n| &n.parents)
    }

    /// Transitive dependents of `id`, nearest first.
    pub fn descendants(&self, id: &str) -> Vec<&str> {
        self.walk(id, |n| &n.children)
    }

    fn walk<'a>(
        &'a self,
        id: &str,
        edges: impl Fn(&'a EntityNode<T>) -> &'a BTreeSet<usize>,
    ) -> Vec<&'a str> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };
        self.reachable(start, edges)
            .into_iter()
            .map(|i| self.nodes[i].id.as_str())
            .collect()
    }

    /// Breadth-first set of indices reachable from `start` (excluded).
    fn reachable<'a>(
        &'a self,
        start: usize,
        edges: impl Fn(&'a EntityNode<T>) -> &'a BTreeSet<usize>,
    ) -> Vec<usize> {
        let mut visited = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        let mut found = Vec::new();
        while let Some(current) = queue.pop_front() {
            for &next in edges(&self.nodes[current]) {
                if visited.insert(next) {
                    found.push(next);
                    queue.push_back(next);
                }
            }
        }
        found
    }

    fn reaches_parent(&self, from: usize, to: usize) -> bool {
        self.reachable(from, |n| &n.parents).contains(&to)
    }

    /// Orders nodes so every entity follows all of its dependencies.
    pub fn order_by_dependencies(&self) -> SyncResult<Vec<&EntityNode<T>>> {
        Ok(self
            .topological_indices()?
            .into_iter()
            .map(|i| &self.nodes[i])
            .collect())
    }

    /// Consumes the graph, returning payloads in dependency order.
    pub fn into_ordered(self) -> SyncResult<Vec<T>> {
        let order = self.topological_indices()?;
        let mut slots: Vec<Option<T>> = self.nodes.into_iter().map(|n| Some(n.payload)).collect();
        Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
    }

    fn topological_indices(&self) -> SyncResult<Vec<usize>> {
        let mut in_degree: Vec<usize> = self.nodes.iter().map(|n| n.parents.len()).collect();
        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(current) = ready.pop_first() {
            order.push(current);
            for &child in &self.nodes[current].children {
                in_degree[child] -= 1;
                if in_degree[child] == 0 {
                    ready.insert(child);
                }
            }
        }

        if order.len() != self.nodes.len() {
            let entities = in_degree
                .iter()
                .enumerate()
                .filter(|(_, &d)| d > 0)
                .map(|(i, _)| self.nodes[i].id.clone())
                .collect();
            return Err(SyncError::DependencyCycle { entities });
        }
        Ok(order)
    }

    fn known_indices(&self, keys: &[String], purpose: &str) -> Vec<usize> {
        keys.iter()
            .filter_map(|key| {
                let found = self.index.get(key).copied();
                if found.is_none() {
                    tracing::warn!(entity = %key, "ignoring unknown entity in {purpose} list");
                }
                found
            })
            .collect()
    }

    /// Names of `keys` plus every transitive dependent, in insertion order.
    pub fn expand_descendants(&self, keys: &[String]) -> Vec<String> {
        let mut selected = HashSet::new();
        for i in self.known_indices(keys, "include") {
            selected.insert(i);
            selected.extend(self.reachable(i, |n| &n.children));
        }
        self.nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| selected.contains(i))
            .map(|(_, n)| n.id.clone())
            .collect()
    }
}

impl<T: Clone> EntityGraph<T> {
    /// Keeps nodes named in `keys` and every node they depend on.
    pub fn filter_to_keys_and_ancestors(&self, keys: &[String]) -> Self {
        let mut keep = HashSet::new();
        for i in self.known_indices(keys, "include") {
            keep.insert(i);
            keep.extend(self.reachable(i, |n| &n.parents));
        }
        self.subgraph(&keep)
    }

    /// Removes nodes named in `keys` and every node depending on them.
    pub fn exclude_with_descendants(&self, keys: &[String]) -> Self {
        let mut drop = HashSet::new();
        for i in self.known_indices(keys, "exclude") {
            drop.insert(i);
            drop.extend(self.reachable(i, |n| &n.children));
        }
        let keep = (0..self.nodes.len()).filter(|i| !drop.contains(i)).collect();
        self.subgraph(&keep)
    }

    /// Copies the kept nodes and the edges between them.
    fn subgraph(&self, keep: &HashSet<usize>) -> Self {
        let mut remap = HashMap::new();
        let mut graph = Self::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if keep.contains(&i) {
                remap.insert(i, graph.nodes.len());
                graph.index.insert(node.id.clone(), graph.nodes.len());
                graph.nodes.push(EntityNode {
                    id: node.id.clone(),
                    payload: node.payload.clone(),
                    parents: BTreeSet::new(),
                    children: BTreeSet::new(),
                });
            }
        }
        for (old, &new) in &remap {
            let node = &self.nodes[*old];
            let parents = node.parents.iter().filter_map(|p| remap.get(p).copied());
            graph.nodes[new].parents = parents.collect();
            let children = node.children.iter().filter_map(|c| remap.get(c).copied());
            graph.nodes[new].children = children.collect();
        }
        graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> EntityGraph<()> {
        let mut graph = EntityGraph::new();
        for id in ["c", "b", "a"] {
            graph.add_node(id, ()).unwrap();
        }
        graph.add_dependency("b", "a").unwrap();
        graph.add_dependency("c", "b").unwrap();
        graph
    }

    fn ids<T>(nodes: &[&EntityNode<T>]) -> Vec<String> {
        nodes.iter().map(|n| n.id().to_string()).collect()
    }

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn chain_orders_dependencies_first() {
        let graph = chain();
        let order = graph.order_by_dependencies().unwrap();
        assert_eq!(ids(&order), vec!["a", "b", "c"]);
        assert_eq!(graph.roots(), vec!["a"]);
    }

    #[test]
    fn edges_are_symmetric_and_idempotent() {
        let mut graph = chain();
        graph.add_dependency("b", "a").unwrap();
        assert_eq!(graph.parents("b"), vec!["a"]);
        assert_eq!(graph.children("a"), vec!["b"]);
        assert_eq!(graph.children("b"), vec!["c"]);
    }

    #[test]
    fn ancestor_queries() {
        let graph = chain();
        assert!(graph.has_ancestor("c", "a"));
        assert!(!graph.has_ancestor("a", "c"));
        assert!(!graph.has_ancestor("a", "a"));
        assert_eq!(graph.ancestors("c"), vec!["b", "a"]);
        assert_eq!(graph.descendants("a"), vec!["b", "c"]);
    }

    #[test]
    fn unknown_and_empty_references() {
        let mut graph = chain();
        assert!(matches!(
            graph.add_dependency("c", "z"),
            Err(SyncError::UnresolvedReference { .. })
        ));
        assert!(matches!(
            graph.add_dependency("", "a"),
            Err(SyncError::UnknownEntity)
        ));
        assert!(matches!(graph.add_node("", ()), Err(SyncError::UnknownEntity)));
        assert!(graph.add_node("a", ()).unwrap_err().is_configuration());
    }

    #[test]
    fn cycles_are_rejected() {
        let mut graph = chain();
        assert!(matches!(
            graph.add_dependency("a", "c"),
            Err(SyncError::DependencyCycle { .. })
        ));
        assert!(matches!(
            graph.add_dependency("a", "a"),
            Err(SyncError::DependencyCycle { .. })
        ));
        // The rejected edge left no trace.
        assert!(graph.parents("a").is_empty());
        assert!(graph.order_by_dependencies().is_ok());
    }

    #[test]
    fn diamond_and_disconnected() {
        let mut graph = EntityGraph::new();
        for id in ["leaf", "left", "right", "top", "lonely"] {
            graph.add_node(id, ()).unwrap();
        }
        graph.add_dependency("left", "top").unwrap();
        graph.add_dependency("right", "top").unwrap();
        graph.add_dependency("leaf", "left").unwrap();
        graph.add_dependency("leaf", "right").unwrap();

        let order = ids(&graph.order_by_dependencies().unwrap());
        assert_eq!(order, vec!["top", "left", "right", "leaf", "lonely"]);
    }

    #[test]
    fn include_keeps_ancestors() {
        let graph = chain();
        let filtered = graph.filter_to_keys_and_ancestors(&keys(&["c"]));
        assert_eq!(filtered.len(), 3);

        let filtered = graph.filter_to_keys_and_ancestors(&keys(&["b", "missing"]));
        let order = ids(&filtered.order_by_dependencies().unwrap());
        assert_eq!(order, vec!["a", "b"]);
        assert!(filtered.children("b").is_empty());
    }

    #[test]
    fn exclude_drops_descendants() {
        let graph = chain();
        assert!(graph.exclude_with_descendants(&keys(&["a"])).is_empty());

        let filtered = graph.exclude_with_descendants(&keys(&["b"]));
        assert_eq!(ids(&filtered.order_by_dependencies().unwrap()), vec!["a"]);
    }

    #[test]
    fn expand_adds_dependents() {
        let graph = chain();
        assert_eq!(graph.expand_descendants(&keys(&["b"])), vec!["c", "b"]);
        assert!(graph.expand_descendants(&keys(&["nope"])).is_empty());
    }

    #[test]
    fn from_policies_fails_fast() {
        let policies = vec![
            EntityPolicy::new("posts").requires("users"),
            EntityPolicy::new("comments").requires("posts"),
        ];
        let err = EntityGraph::from_policies(policies).unwrap_err();
        assert!(matches!(
            err,
            SyncError::UnresolvedReference { ref entity, ref reference }
                if entity == "posts" && reference == "users"
        ));

        let policies = vec![
            EntityPolicy::new("comments").requires("posts"),
            EntityPolicy::new("posts").requires("users"),
            EntityPolicy::new("users"),
        ];
        let ordered = EntityGraph::from_policies(policies)
            .unwrap()
            .into_ordered()
            .unwrap();
        let names: Vec<_> = ordered.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["users", "posts", "comments"]);
    }
}
