// SPDX-License-Identifier: MIT OR Apache-2.0
//! Arena-allocated workflow tree.
//!
//! Nodes are stored in a flat arena and addressed by stable [`NodeId`]
//! indices; parent/child links are ids, never pointers. The engine is the
//! single owner and the only mutator. Cancellation and post-action flags are
//! tree-wide shared handles, so a request raised anywhere is observable at
//! the root.

use crate::state::WorkflowState;
use dua_core::{UpdateId, UpdateManifest, UpdateResult, UpdateType};
use dua_handler::{CancellationToken, Component, PostActionFlags};
use std::collections::HashMap;
use std::path::PathBuf;

/// Stable index of a node within its tree's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

impl NodeId {
    /// The root node's id; the arena guarantees index 0 is the root.
    pub const ROOT: NodeId = NodeId(0);
}

/// Payload of a tree node.
#[derive(Debug)]
pub enum NodeKind {
    /// A manifest-bearing node: the root, or a resolved reference step.
    Update {
        /// The parsed manifest whose steps are this node's children.
        manifest: UpdateManifest,
    },
    /// An inline step executed by one content handler.
    Step {
        /// Handler the step resolves to.
        handler: UpdateType,
        /// File ids into the governing manifest's file table.
        files: Vec<String>,
        /// Handler-interpreted properties.
        handler_properties: serde_json::Map<String, serde_json::Value>,
        /// Components selected for this step; empty targets the host.
        selected_components: Vec<Component>,
        /// Whether `backup` ran for this step (drives restore unwinding).
        backed_up: bool,
    },
}

/// One workflow node.
#[derive(Debug)]
pub struct WorkflowNode {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    index_in_parent: usize,
    /// Identity of the update this node belongs to.
    pub update_id: UpdateId,
    /// Current phase.
    pub state: WorkflowState,
    /// Last recorded result for this node.
    pub result: Option<UpdateResult>,
    /// Node payload.
    pub kind: NodeKind,
}

impl WorkflowNode {
    /// Parent id; `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Ordered child ids.
    #[must_use]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Position within the parent's child list.
    #[must_use]
    pub fn index_in_parent(&self) -> usize {
        self.index_in_parent
    }

    /// The manifest, for `Update` nodes.
    #[must_use]
    pub fn manifest(&self) -> Option<&UpdateManifest> {
        match &self.kind {
            NodeKind::Update { manifest } => Some(manifest),
            NodeKind::Step { .. } => None,
        }
    }

    /// The handler update type, for `Step` nodes.
    #[must_use]
    pub fn handler(&self) -> Option<&UpdateType> {
        match &self.kind {
            NodeKind::Step { handler, .. } => Some(handler),
            NodeKind::Update { .. } => None,
        }
    }

    /// The step's `installedCriteria`, when it declares one.
    #[must_use]
    pub fn installed_criteria(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Step {
                handler_properties, ..
            } => handler_properties
                .get("installedCriteria")
                .and_then(|v| v.as_str()),
            NodeKind::Update { .. } => None,
        }
    }
}

/// The workflow tree: arena, shared flags, and deployment-scoped inputs.
///
/// There is at most one live tree per agent; building a new one goes
/// through the engine, which aborts the previous tree first.
#[derive(Debug)]
pub struct WorkflowTree {
    nodes: Vec<WorkflowNode>,
    /// Deployment-assigned workflow id.
    pub workflow_id: String,
    /// File id → download URL, shared by every node.
    pub file_urls: HashMap<String, String>,
    /// Raw manifest JSON of the root (the signed bytes).
    pub manifest_json: String,
    /// Detached signature material for the root manifest.
    pub manifest_signature: String,
    /// Sandbox directory for this workflow.
    pub work_folder: PathBuf,
    /// Tree-wide cancellation; monotonic.
    pub cancellation: CancellationToken,
    /// Tree-wide reboot/restart requests; sticky.
    pub post_actions: PostActionFlags,
    /// Set when a cancel request arrived after the root reached a terminal
    /// state; advisory only.
    pub cancel_requested_after_terminal: bool,
}

impl WorkflowTree {
    /// Create a tree holding just the root `Update` node.
    #[must_use]
    pub fn new(
        workflow_id: impl Into<String>,
        manifest: UpdateManifest,
        manifest_json: String,
        manifest_signature: String,
        file_urls: HashMap<String, String>,
        work_folder: PathBuf,
    ) -> Self {
        let update_id = manifest.update_id.clone();
        let root = WorkflowNode {
            parent: None,
            children: Vec::new(),
            index_in_parent: 0,
            update_id,
            state: WorkflowState::Idle,
            result: None,
            kind: NodeKind::Update { manifest },
        };
        Self {
            nodes: vec![root],
            workflow_id: workflow_id.into(),
            file_urls,
            manifest_json,
            manifest_signature,
            work_folder,
            cancellation: CancellationToken::new(),
            post_actions: PostActionFlags::new(),
            cancel_requested_after_terminal: false,
        }
    }

    /// The root node id.
    #[must_use]
    pub fn root(&self) -> NodeId {
        NodeId::ROOT
    }

    /// Borrow a node.
    #[must_use]
    pub fn node(&self, id: NodeId) -> &WorkflowNode {
        &self.nodes[id.0]
    }

    /// Mutably borrow a node.
    pub fn node_mut(&mut self, id: NodeId) -> &mut WorkflowNode {
        &mut self.nodes[id.0]
    }

    /// Append a child under `parent`, returning the new node's id.
    pub fn add_child(&mut self, parent: NodeId, update_id: UpdateId, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        let index_in_parent = self.nodes[parent.0].children.len();
        self.nodes.push(WorkflowNode {
            parent: Some(parent),
            children: Vec::new(),
            index_in_parent,
            update_id,
            state: WorkflowState::Idle,
            result: None,
            kind,
        });
        self.nodes[parent.0].children.push(id);
        id
    }

    /// Number of nodes in the arena.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// `true` when only the root exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Depth-first pre-order traversal of node ids.
    #[must_use]
    pub fn depth_first(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            out.push(id);
            for &child in self.node(id).children().iter().rev() {
                stack.push(child);
            }
        }
        out
    }

    /// Ids of all `Step` leaves in execution (declaration) order.
    #[must_use]
    pub fn steps_in_order(&self) -> Vec<NodeId> {
        self.depth_first()
            .into_iter()
            .filter(|id| matches!(self.node(*id).kind, NodeKind::Step { .. }))
            .collect()
    }

    /// The manifest governing a node: the nearest `Update` ancestor
    /// (or the node itself).
    #[must_use]
    pub fn governing_manifest(&self, id: NodeId) -> &UpdateManifest {
        let mut cursor = id;
        loop {
            if let NodeKind::Update { manifest } = &self.node(cursor).kind {
                return manifest;
            }
            cursor = self
                .node(cursor)
                .parent()
                .expect("step nodes always have an Update ancestor");
        }
    }

    /// Request cancellation of the whole tree; monotonic.
    pub fn request_cancel(&mut self) {
        if self.node(self.root()).state.is_terminal() {
            self.cancel_requested_after_terminal = true;
        }
        self.cancellation.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(provider: &str, name: &str) -> UpdateManifest {
        serde_json::from_value(serde_json::json!({
            "manifestVersion": 5,
            "updateId": { "provider": provider, "name": name, "version": "1.0" },
            "instructions": { "steps": [] },
            "files": {},
            "createdDateTime": "2025-10-01T00:00:00Z"
        }))
        .unwrap()
    }

    fn step_kind(handler: &str) -> NodeKind {
        NodeKind::Step {
            handler: UpdateType::parse(handler).unwrap(),
            files: Vec::new(),
            handler_properties: serde_json::Map::new(),
            selected_components: Vec::new(),
            backed_up: false,
        }
    }

    fn empty_tree() -> WorkflowTree {
        WorkflowTree::new(
            "wf-1",
            manifest("contoso", "toaster"),
            "{}".into(),
            String::new(),
            HashMap::new(),
            PathBuf::from("/tmp/wf-1"),
        )
    }

    #[test]
    fn root_is_index_zero() {
        let tree = empty_tree();
        assert_eq!(tree.root(), NodeId::ROOT);
        assert!(tree.node(tree.root()).manifest().is_some());
        assert!(tree.is_empty());
    }

    #[test]
    fn children_keep_declaration_order() {
        let mut tree = empty_tree();
        let a = tree.add_child(tree.root(), UpdateId::new("c", "t", "1"), step_kind("x/a:1"));
        let b = tree.add_child(tree.root(), UpdateId::new("c", "t", "1"), step_kind("x/b:1"));
        assert_eq!(tree.node(tree.root()).children(), &[a, b]);
        assert_eq!(tree.node(a).index_in_parent(), 0);
        assert_eq!(tree.node(b).index_in_parent(), 1);
        assert_eq!(tree.node(a).parent(), Some(tree.root()));
    }

    #[test]
    fn steps_in_order_flattens_nested_updates() {
        let mut tree = empty_tree();
        let s1 = tree.add_child(tree.root(), UpdateId::new("c", "t", "1"), step_kind("x/a:1"));
        let child = tree.add_child(
            tree.root(),
            UpdateId::new("c", "leaf", "1"),
            NodeKind::Update {
                manifest: manifest("c", "leaf"),
            },
        );
        let s2 = tree.add_child(child, UpdateId::new("c", "leaf", "1"), step_kind("x/b:1"));
        let s3 = tree.add_child(tree.root(), UpdateId::new("c", "t", "1"), step_kind("x/c:1"));
        assert_eq!(tree.steps_in_order(), vec![s1, s2, s3]);
    }

    #[test]
    fn governing_manifest_is_nearest_update_ancestor() {
        let mut tree = empty_tree();
        let child = tree.add_child(
            tree.root(),
            UpdateId::new("c", "leaf", "1"),
            NodeKind::Update {
                manifest: manifest("c", "leaf"),
            },
        );
        let step = tree.add_child(child, UpdateId::new("c", "leaf", "1"), step_kind("x/b:1"));
        assert_eq!(tree.governing_manifest(step).update_id.name, "leaf");
        let top_step = tree.add_child(tree.root(), UpdateId::new("c", "t", "1"), step_kind("x/a:1"));
        assert_eq!(tree.governing_manifest(top_step).update_id.name, "toaster");
    }

    #[test]
    fn cancel_after_terminal_is_advisory() {
        let mut tree = empty_tree();
        tree.node_mut(NodeId::ROOT).state = WorkflowState::ApplySucceeded;
        tree.request_cancel();
        assert!(tree.cancellation.is_cancelled());
        assert!(tree.cancel_requested_after_terminal);
    }

    #[test]
    fn cancel_before_terminal_is_not_advisory() {
        let mut tree = empty_tree();
        tree.request_cancel();
        assert!(tree.cancellation.is_cancelled());
        assert!(!tree.cancel_requested_after_terminal);
    }

    #[test]
    fn installed_criteria_accessor_reads_handler_properties() {
        let mut tree = empty_tree();
        let mut props = serde_json::Map::new();
        props.insert("installedCriteria".into(), serde_json::json!("3.1"));
        let step = tree.add_child(
            tree.root(),
            UpdateId::new("c", "t", "1"),
            NodeKind::Step {
                handler: UpdateType::parse("x/a:1").unwrap(),
                files: Vec::new(),
                handler_properties: props,
                selected_components: Vec::new(),
                backed_up: false,
            },
        );
        assert_eq!(tree.node(step).installed_criteria(), Some("3.1"));
    }
}
