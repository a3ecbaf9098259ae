//! Scope evaluation: is a node inside a capability's subtree?
//!
//! The evaluator walks parent links from the node toward the scope root using
//! whatever tree context the backend currently has. The tri-state result is
//! deliberate: `Unknown` means the ancestor chain cannot be completed yet, so
//! the caller can park the op and retry once more context arrives, instead of
//! wrongly rejecting it.

use async_trait::async_trait;

use crate::error::AuthError;
use crate::ids::{DocId, NodeId};
use crate::op::{OpKind, Operation};
use crate::token::{Action, Capability, ResourceScope, actions_cover};

/// Walk bound: keeps evaluation defined on transiently cyclic move states.
const MAX_WALK: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeDecision {
    Allow,
    Deny,
    Unknown,
}

/// What the tree context knows about a node's parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentLink {
    /// The node's current parent.
    Parent(NodeId),
    /// The node is the document root.
    Root,
    /// The node exists but is currently detached from the tree.
    Detached,
    /// The node is not (yet) known to the local tree context.
    Unknown,
}

/// Parent-link lookups against the local tree index.
#[async_trait]
pub trait TreeContext: Send + Sync {
    async fn parent(&self, doc_id: &DocId, node: &NodeId) -> anyhow::Result<ParentLink>;
}

/// Classify `node` under `scope` using the available tree context.
///
/// Without a tree context only the trivial cases can be decided; anything
/// that would need a walk is `Unknown`.
pub async fn evaluate_node_scope(
    tree: Option<&dyn TreeContext>,
    doc_id: &DocId,
    node: &NodeId,
    scope: &ResourceScope,
) -> Result<ScopeDecision, AuthError> {
    if scope.exclude.contains(node) {
        return Ok(ScopeDecision::Deny);
    }
    if *node == scope.root {
        return Ok(ScopeDecision::Allow);
    }
    if scope.is_doc_wide() {
        return Ok(ScopeDecision::Allow);
    }
    let Some(tree) = tree else {
        return Ok(ScopeDecision::Unknown);
    };

    let mut current = *node;
    let mut hops: u32 = 0;
    loop {
        if let Some(limit) = scope.max_depth {
            if hops >= limit {
                return Ok(ScopeDecision::Unknown);
            }
        }
        if hops >= MAX_WALK {
            return Ok(ScopeDecision::Unknown);
        }
        match tree.parent(doc_id, &current).await.map_err(AuthError::backend)? {
            ParentLink::Parent(parent) => {
                hops += 1;
                if scope.exclude.contains(&parent) {
                    return Ok(ScopeDecision::Deny);
                }
                if parent == scope.root {
                    return Ok(ScopeDecision::Allow);
                }
                if parent.is_root() {
                    // ancestor chain is complete and the scope root is not on
                    // it: the node is provably outside
                    return Ok(ScopeDecision::Deny);
                }
                current = parent;
            }
            ParentLink::Root => return Ok(ScopeDecision::Deny),
            ParentLink::Detached | ParentLink::Unknown => return Ok(ScopeDecision::Unknown),
        }
    }
}

/// Convenience wrapper when a tree context is definitely available.
pub async fn evaluate_node(
    tree: &dyn TreeContext,
    doc_id: &DocId,
    node: &NodeId,
    scope: &ResourceScope,
) -> Result<ScopeDecision, AuthError> {
    evaluate_node_scope(Some(tree), doc_id, node, scope).await
}

/// Can `caps` access `node` with all of `required`?
///
/// OR across caps: `Allow` short-circuits, `Unknown` beats `Deny`.
pub async fn caps_allows_node_access(
    tree: Option<&dyn TreeContext>,
    doc_id: &DocId,
    caps: &[&Capability],
    node: &NodeId,
    required: &[Action],
) -> Result<ScopeDecision, AuthError> {
    let mut best = ScopeDecision::Deny;
    for cap in caps {
        if !required.iter().all(|a| actions_cover(&cap.actions, *a)) {
            continue;
        }
        match evaluate_node_scope(tree, doc_id, node, &cap.res).await? {
            ScopeDecision::Allow => return Ok(ScopeDecision::Allow),
            ScopeDecision::Unknown => best = ScopeDecision::Unknown,
            ScopeDecision::Deny => {}
        }
    }
    Ok(best)
}

/// The node/action checks an op must pass.
///
/// A move is authorized against BOTH the moved node and the destination
/// parent.
pub fn required_checks(op: &Operation) -> Vec<(NodeId, Vec<Action>)> {
    match &op.kind {
        OpKind::Insert { parent, payload, .. } => {
            let mut actions = vec![Action::WriteStructure];
            if payload.is_some() {
                actions.push(Action::WritePayload);
            }
            vec![(*parent, actions)]
        }
        OpKind::Move { node, new_parent, .. } => vec![
            (*node, vec![Action::WriteStructure]),
            (*new_parent, vec![Action::WriteStructure]),
        ],
        OpKind::Delete { node } => vec![(*node, vec![Action::Delete])],
        OpKind::Tombstone { node } => vec![(*node, vec![Action::Tombstone])],
        OpKind::Payload { node, .. } => vec![(*node, vec![Action::WritePayload])],
    }
}

/// Can `caps` authorize `op`? AND across the op's required checks, OR across
/// caps within each check.
pub async fn caps_allows_op(
    tree: Option<&dyn TreeContext>,
    doc_id: &DocId,
    caps: &[&Capability],
    op: &Operation,
) -> Result<ScopeDecision, AuthError> {
    let mut result = ScopeDecision::Allow;
    for (node, required) in required_checks(op) {
        match caps_allows_node_access(tree, doc_id, caps, &node, &required).await? {
            ScopeDecision::Deny => return Ok(ScopeDecision::Deny),
            ScopeDecision::Unknown => result = ScopeDecision::Unknown,
            ScopeDecision::Allow => {}
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ROOT_NODE_ID;
    use crate::op::{OpId, OpMeta};
    use std::collections::HashMap;

    struct MapTree(HashMap<NodeId, NodeId>);

    #[async_trait]
    impl TreeContext for MapTree {
        async fn parent(&self, _doc: &DocId, node: &NodeId) -> anyhow::Result<ParentLink> {
            if node.is_root() {
                return Ok(ParentLink::Root);
            }
            Ok(match self.0.get(node) {
                Some(p) => ParentLink::Parent(*p),
                None => ParentLink::Unknown,
            })
        }
    }

    fn node(n: u8) -> NodeId {
        NodeId::from_bytes([n; 16])
    }

    fn doc() -> DocId {
        DocId::new("doc-scope").unwrap()
    }

    fn scope(root: NodeId, max_depth: Option<u32>, exclude: Vec<NodeId>) -> ResourceScope {
        ResourceScope {
            doc_id: doc(),
            root,
            max_depth,
            exclude,
        }
    }

    /// root ── a ── b ── c, root ── d
    fn tree() -> MapTree {
        let mut parents = HashMap::new();
        parents.insert(node(1), ROOT_NODE_ID);
        parents.insert(node(2), node(1));
        parents.insert(node(3), node(2));
        parents.insert(node(4), ROOT_NODE_ID);
        MapTree(parents)
    }

    #[tokio::test]
    async fn trivial_cases() {
        let t = tree();
        let d = doc();
        // node == root
        assert_eq!(
            evaluate_node(&t, &d, &node(1), &scope(node(1), None, vec![])).await.unwrap(),
            ScopeDecision::Allow
        );
        // excluded
        assert_eq!(
            evaluate_node(&t, &d, &node(1), &scope(ROOT_NODE_ID, None, vec![node(1)])).await.unwrap(),
            ScopeDecision::Deny
        );
        // doc-wide
        assert_eq!(
            evaluate_node(&t, &d, &node(3), &scope(ROOT_NODE_ID, None, vec![])).await.unwrap(),
            ScopeDecision::Allow
        );
    }

    #[tokio::test]
    async fn walks_to_scope_root() {
        let t = tree();
        let d = doc();
        assert_eq!(
            evaluate_node(&t, &d, &node(3), &scope(node(1), None, vec![])).await.unwrap(),
            ScopeDecision::Allow
        );
        // sibling subtree is outside
        assert_eq!(
            evaluate_node(&t, &d, &node(4), &scope(node(1), None, vec![])).await.unwrap(),
            ScopeDecision::Deny
        );
    }

    #[tokio::test]
    async fn excluded_ancestor_denies() {
        let t = tree();
        let d = doc();
        assert_eq!(
            evaluate_node(&t, &d, &node(3), &scope(node(1), None, vec![node(2)])).await.unwrap(),
            ScopeDecision::Deny
        );
    }

    #[tokio::test]
    async fn max_depth_bounds_walk() {
        let t = tree();
        let d = doc();
        // node(3) is 2 hops below node(1)
        assert_eq!(
            evaluate_node(&t, &d, &node(3), &scope(node(1), Some(2), vec![])).await.unwrap(),
            ScopeDecision::Allow
        );
        assert_eq!(
            evaluate_node(&t, &d, &node(3), &scope(node(1), Some(1), vec![])).await.unwrap(),
            ScopeDecision::Unknown
        );
    }

    #[tokio::test]
    async fn missing_ancestor_is_unknown() {
        let t = MapTree(HashMap::new());
        let d = doc();
        assert_eq!(
            evaluate_node(&t, &d, &node(3), &scope(node(1), None, vec![])).await.unwrap(),
            ScopeDecision::Unknown
        );
    }

    #[tokio::test]
    async fn no_tree_context_is_unknown_for_walks() {
        let d = doc();
        assert_eq!(
            evaluate_node_scope(None, &d, &node(3), &scope(node(1), None, vec![])).await.unwrap(),
            ScopeDecision::Unknown
        );
    }

    fn insert_op(replica: u8, counter: u64, parent: NodeId, n: NodeId, payload: Option<Vec<u8>>) -> Operation {
        Operation {
            meta: OpMeta {
                id: OpId {
                    replica: crate::ids::ReplicaId::from_bytes([replica; 32]),
                    counter,
                },
                lamport: counter,
            },
            kind: OpKind::Insert {
                parent,
                node: n,
                order_key: vec![0],
                payload,
            },
        }
    }

    #[tokio::test]
    async fn op_checks_and_across_nodes() {
        let t = tree();
        let d = doc();
        let write_subtree = Capability {
            res: scope(node(1), None, vec![]),
            actions: vec![Action::WriteStructure],
        };
        let caps = [&write_subtree];

        // insert under node(2): inside the subtree
        let ok = insert_op(1, 1, node(2), node(9), None);
        assert_eq!(caps_allows_op(Some(&t), &d, &caps, &ok).await.unwrap(), ScopeDecision::Allow);

        // move from inside to outside: destination check denies
        let bad_move = Operation {
            meta: ok.meta,
            kind: OpKind::Move {
                node: node(3),
                new_parent: node(4),
                order_key: vec![1],
            },
        };
        assert_eq!(
            caps_allows_op(Some(&t), &d, &caps, &bad_move).await.unwrap(),
            ScopeDecision::Deny
        );
    }

    #[tokio::test]
    async fn payload_insert_needs_write_payload() {
        let t = tree();
        let d = doc();
        let structure_only = Capability {
            res: scope(ROOT_NODE_ID, None, vec![]),
            actions: vec![Action::WriteStructure],
        };
        let with_payload = insert_op(1, 1, node(1), node(9), Some(vec![1]));
        assert_eq!(
            caps_allows_op(Some(&t), &d, &[&structure_only], &with_payload).await.unwrap(),
            ScopeDecision::Deny
        );

        let full = Capability {
            res: scope(ROOT_NODE_ID, None, vec![]),
            actions: vec![Action::WriteStructure, Action::WritePayload],
        };
        assert_eq!(
            caps_allows_op(Some(&t), &d, &[&full], &with_payload).await.unwrap(),
            ScopeDecision::Allow
        );
    }

    #[tokio::test]
    async fn unknown_beats_deny_across_caps() {
        let d = doc();
        let t = MapTree(HashMap::new());
        let scoped = Capability {
            res: scope(node(1), None, vec![]),
            actions: vec![Action::ReadStructure],
        };
        // walk cannot complete -> unknown, not deny
        assert_eq!(
            caps_allows_node_access(Some(&t), &d, &[&scoped], &node(3), &[Action::ReadStructure])
                .await
                .unwrap(),
            ScopeDecision::Unknown
        );
    }
}
