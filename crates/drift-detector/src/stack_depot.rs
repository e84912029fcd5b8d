//! Per-thread call-path tree.
//!
//! Every distinct call path a thread has been seen in is a node; an access
//! only needs to remember the node it happened under, and the full stack is
//! rebuilt by walking parent links when a race is reported.

/// Stable handle to a node. Nodes are never removed, so a handle stays valid
/// for the lifetime of the depot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug)]
struct Node {
    pc: usize,
    parent: NodeId,
    children: Vec<(usize, NodeId)>,
}

#[derive(Debug)]
pub struct StackDepot {
    nodes: Vec<Node>,
    current: NodeId,
}

impl StackDepot {
    pub const ROOT: NodeId = NodeId(0);

    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                pc: 0,
                parent: Self::ROOT,
                children: Vec::new(),
            }],
            current: Self::ROOT,
        }
    }

    /// Descend into the callee at `pc`, reusing an existing edge when present.
    pub fn enter(&mut self, pc: usize) {
        let current = self.current;
        let existing = self.nodes[current.0]
            .children
            .iter()
            .find(|(child_pc, _)| *child_pc == pc)
            .map(|(_, id)| *id);

        self.current = match existing {
            Some(id) => id,
            None => {
                let id = NodeId(self.nodes.len());
                self.nodes.push(Node {
                    pc,
                    parent: current,
                    children: Vec::new(),
                });
                self.nodes[current.0].children.push((pc, id));
                id
            }
        };
    }

    /// Return to the caller. A spurious exit at the root is ignored.
    pub fn exit(&mut self) {
        if self.current != Self::ROOT {
            self.current = self.nodes[self.current.0].parent;
        }
    }

    pub fn current(&self) -> NodeId {
        self.current
    }

    pub fn depth(&self) -> usize {
        self.path_len(self.current)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Call stack for an access at `pc` under `node`, outermost frame first
    /// and `pc` last. Overlong stacks lose their outermost frames.
    pub fn trace(&self, node: NodeId, pc: usize, max_depth: usize) -> Vec<usize> {
        if max_depth == 0 {
            return Vec::new();
        }

        let mut frames = Vec::with_capacity(self.path_len(node).min(max_depth - 1) + 1);
        frames.push(pc);
        let mut cursor = node;
        while cursor != Self::ROOT && frames.len() < max_depth {
            let entry = &self.nodes[cursor.0];
            frames.push(entry.pc);
            cursor = entry.parent;
        }
        frames.reverse();
        frames
    }

    fn path_len(&self, mut node: NodeId) -> usize {
        let mut len = 0;
        while node != Self::ROOT {
            len += 1;
            node = self.nodes[node.0].parent;
        }
        len
    }
}

impl Default for StackDepot {
    fn default() -> Self {
        Self::new()
    }
}
