use crate::{math::Set, Symbol};

/// Identifies a node of a [`super::PrefixTree`]. Identities are dense, they are handed out in increasing order
/// and never reused, so a `NodeId` is simply the position of the node in the arena.
pub type NodeId = usize;

/// The color of a node during the blue-fringe traversal. A node starts out [`NodeColor::White`], becomes
/// [`NodeColor::Blue`] once it is directly reachable from a red node and turns [`NodeColor::Red`] when it is
/// promoted to a canonical state. Colors never regress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum NodeColor {
    /// Untouched node that is not yet a candidate for merging.
    #[default]
    White,
    /// Frontier node, reachable from a red node by a single transition.
    Blue,
    /// Canonical state of the automaton that is being built, red nodes are never merged away.
    Red,
}

/// A single node of the prefix tree. Apart from its successors and the outputs on the transitions
/// leading to them, a node stores a non-owning link to the node that created it, an optional
/// state property (only used for Moore-style learning), a bound on the height of its subtree and
/// the set of nodes it has been found to be incompatible with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node<Q, C> {
    pub(crate) id: NodeId,
    pub(crate) color: NodeColor,
    pub(crate) parent: Option<(NodeId, Symbol)>,
    pub(crate) property: Option<Q>,
    pub(crate) successors: Vec<Option<NodeId>>,
    pub(crate) outputs: Vec<Option<C>>,
    pub(crate) height: usize,
    pub(crate) incompatible: Set<NodeId>,
    pub(crate) origin: Option<NodeId>,
}

impl<Q, C> Node<Q, C> {
    pub(crate) fn new(id: NodeId, parent: Option<(NodeId, Symbol)>, alphabet_size: usize) -> Self {
        Self {
            id,
            color: NodeColor::White,
            parent,
            property: None,
            successors: vec![None; alphabet_size],
            outputs: std::iter::repeat_with(|| None).take(alphabet_size).collect(),
            height: 0,
            incompatible: Set::default(),
            origin: None,
        }
    }

    /// Returns the identity of the node.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Returns the current color of the node.
    pub fn color(&self) -> NodeColor {
        self.color
    }

    /// Returns true if the node is a canonical state.
    pub fn is_red(&self) -> bool {
        self.color == NodeColor::Red
    }

    /// Returns true if the node is on the fringe.
    pub fn is_blue(&self) -> bool {
        self.color == NodeColor::Blue
    }

    /// Returns the node that this node hangs off, `None` for the root.
    pub fn parent(&self) -> Option<NodeId> {
        self.parent.map(|(p, _)| p)
    }

    /// Returns the symbol on the edge from [`Self::parent`] to this node.
    pub fn parent_input(&self) -> Option<Symbol> {
        self.parent.map(|(_, a)| a)
    }

    /// The state property (Moore output) of the node, if any is known.
    pub fn property(&self) -> Option<&Q> {
        self.property.as_ref()
    }

    /// Gives the successor on `symbol`, if it exists.
    pub fn successor(&self, symbol: Symbol) -> Option<NodeId> {
        self.successors.get(symbol).copied().flatten()
    }

    /// Gives the output emitted by the transition on `symbol`, if it is known.
    pub fn output(&self, symbol: Symbol) -> Option<&C> {
        self.outputs.get(symbol).and_then(|o| o.as_ref())
    }

    /// Returns the transition on `symbol` as a pair of target and (possibly unknown) output.
    pub fn transition(&self, symbol: Symbol) -> Option<(NodeId, Option<&C>)> {
        self.successor(symbol).map(|q| (q, self.output(symbol)))
    }

    /// Iterates over all present successors together with the symbol leading to them.
    pub fn successors(&self) -> impl Iterator<Item = (Symbol, NodeId)> + '_ {
        self.successors
            .iter()
            .enumerate()
            .filter_map(|(a, q)| q.map(|q| (a, q)))
    }

    /// Counts the present successors.
    pub fn child_count(&self) -> usize {
        self.successors.iter().flatten().count()
    }

    /// Upper bound on the length of the longest path leaving this node through the tree.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Returns true if `other` is known to be incompatible with this node.
    pub fn is_incompatible_with(&self, other: NodeId) -> bool {
        self.incompatible.contains(&other)
    }

    /// Iterates over all nodes this one is known to be incompatible with.
    pub fn incompatible_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.incompatible.iter().copied()
    }

    /// For a node that was created by copying another one during a merge, this returns the node
    /// it was copied from.
    pub fn origin(&self) -> Option<NodeId> {
        self.origin
    }
}

impl<Q: Clone, C: Clone> Node<Q, C> {
    /// Copies the node under the new identity `id`, remembering where the copy came from.
    pub(crate) fn copy_as(&self, id: NodeId) -> Self {
        Self {
            id,
            origin: Some(self.origin.unwrap_or(self.id)),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_node() {
        let node: Node<(), char> = Node::new(3, Some((1, 0)), 2);
        assert_eq!(node.color(), NodeColor::White);
        assert_eq!(node.parent(), Some(1));
        assert_eq!(node.parent_input(), Some(0));
        assert_eq!(node.child_count(), 0);
        assert_eq!(node.successor(5), None);
        assert!(node.origin().is_none());

        let copy = node.copy_as(7);
        assert_eq!(copy.id(), 7);
        assert_eq!(copy.origin(), Some(3));
        assert_eq!(copy.copy_as(8).origin(), Some(3));
    }

    #[test]
    fn colors_are_ordered() {
        assert!(NodeColor::White < NodeColor::Blue);
        assert!(NodeColor::Blue < NodeColor::Red);
    }
}
