use std::collections::VecDeque;

use bit_set::BitSet;
use itertools::Itertools;
use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    automaton::{MealyMachine, MealyState},
    math, Color, Symbol, Void,
};

mod node;
pub use node::{Node, NodeColor, NodeId};

/// Errors that can occur when a sample is inserted into a [`PrefixTree`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SampleError {
    /// Two samples assign different outputs to the same input, so no deterministic machine can be
    /// consistent with both of them.
    #[error("sample conflict: input {prefix:?} is associated with two different outputs")]
    Conflict {
        /// The shortest input on which the two samples disagree.
        prefix: Vec<Symbol>,
    },
    /// The sample contains a symbol that is not part of the alphabet.
    #[error("symbol {symbol} does not belong to the alphabet of size {alphabet_size}")]
    SymbolOutOfRange {
        /// The offending symbol.
        symbol: Symbol,
        /// Size of the alphabet the tree was created for.
        alphabet_size: usize,
    },
    /// The outputs cannot be aligned with the input.
    #[error("{outputs} outputs cannot annotate an input of length {inputs}")]
    LengthMismatch {
        /// Length of the input sequence.
        inputs: usize,
        /// Number of outputs that were given.
        outputs: usize,
    },
}

/// Errors raised when manipulating the nodes of a [`PrefixTree`] directly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    /// There is no node with the given identity.
    #[error("node {0} does not exist")]
    UnknownNode(NodeId),
    /// The symbol is not part of the alphabet.
    #[error("symbol {symbol} does not belong to the alphabet of size {alphabet_size}")]
    SymbolOutOfRange {
        /// The offending symbol.
        symbol: Symbol,
        /// Size of the alphabet the tree was created for.
        alphabet_size: usize,
    },
    /// The node already has a successor on the given symbol.
    #[error("node {node} already has a successor on symbol {symbol}")]
    Occupied {
        /// The would-be parent.
        node: NodeId,
        /// The symbol of the occupied slot.
        symbol: Symbol,
    },
}

/// The prefix tree acceptor, built from a sample and successively folded into the learned machine.
///
/// All nodes are stored in an arena and refer to each other through their [`NodeId`]. The tree
/// starts with a single white root (which always has identity `0`), more nodes are created by
/// inserting samples and by committing merges. Nodes are never removed, states that are folded
/// away simply become unreachable from the red part of the tree.
///
/// The type parameter `Q` is the type of state properties, which is [`Void`] when learning Mealy
/// machines, and `C` is the type of outputs on transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixTree<Q = Void, C = usize> {
    alphabet_size: usize,
    nodes: Vec<Node<Q, C>>,
    red: Vec<NodeId>,
}

impl<Q: Color, C: Color> PrefixTree<Q, C> {
    /// Creates a tree over an alphabet with `alphabet_size` symbols that consists only of the root.
    pub fn new(alphabet_size: usize) -> Self {
        Self {
            alphabet_size,
            nodes: vec![Node::new(0, None, alphabet_size)],
            red: vec![],
        }
    }

    /// The number of symbols in the alphabet.
    pub fn alphabet_size(&self) -> usize {
        self.alphabet_size
    }

    /// The root of the tree, which corresponds to the empty input.
    pub fn root(&self) -> NodeId {
        0
    }

    /// The number of nodes that exist in the arena, including unreachable ones.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// A tree always contains its root, so this is never true. Exists for completeness.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Gives access to the node with identity `id`.
    pub fn node(&self, id: NodeId) -> Option<&Node<Q, C>> {
        self.nodes.get(id)
    }

    /// Iterates over all nodes in the arena.
    pub fn nodes(&self) -> impl Iterator<Item = &Node<Q, C>> + '_ {
        self.nodes.iter()
    }

    /// The successor of `node` on `symbol`.
    pub fn successor(&self, node: NodeId, symbol: Symbol) -> Option<NodeId> {
        self.nodes.get(node)?.successor(symbol)
    }

    /// The output on the transition leaving `node` on `symbol`.
    pub fn output(&self, node: NodeId, symbol: Symbol) -> Option<&C> {
        self.nodes.get(node)?.output(symbol)
    }

    /// The state property of `node`.
    pub fn property(&self, node: NodeId) -> Option<&Q> {
        self.nodes.get(node)?.property()
    }

    /// Returns true if `node` exists and is red.
    pub fn is_red(&self, node: NodeId) -> bool {
        self.nodes.get(node).map(|n| n.is_red()).unwrap_or(false)
    }

    /// The red nodes in the order in which they were promoted. This is the fixed enumeration
    /// order in which merge candidates are considered.
    pub fn red_states(&self) -> &[NodeId] {
        &self.red
    }

    /// Number of red nodes, i.e. the size of the machine built so far.
    pub fn red_count(&self) -> usize {
        self.red.len()
    }

    /// Number of successors of `node`.
    pub fn child_count(&self, node: NodeId) -> usize {
        self.nodes.get(node).map(|n| n.child_count()).unwrap_or(0)
    }

    /// Creates a fresh white node as the successor of `parent` on `symbol`. The height of all
    /// ancestors is raised accordingly.
    pub fn add_child(&mut self, parent: NodeId, symbol: Symbol) -> Result<NodeId, TreeError> {
        if symbol >= self.alphabet_size {
            return Err(TreeError::SymbolOutOfRange {
                symbol,
                alphabet_size: self.alphabet_size,
            });
        }
        let Some(p) = self.nodes.get(parent) else {
            return Err(TreeError::UnknownNode(parent));
        };
        if p.successor(symbol).is_some() {
            return Err(TreeError::Occupied {
                node: parent,
                symbol,
            });
        }

        Ok(self.push_child(parent, symbol))
    }

    fn push_child(&mut self, parent: NodeId, symbol: Symbol) -> NodeId {
        let id = self.nodes.len();
        self.nodes
            .push(Node::new(id, Some((parent, symbol)), self.alphabet_size));
        self.nodes[parent].successors[symbol] = Some(id);
        self.raise_height(parent, 1);
        id
    }

    fn check_symbols(&self, input: &[Symbol]) -> Result<(), SampleError> {
        match input.iter().find(|&&a| a >= self.alphabet_size) {
            Some(&symbol) => Err(SampleError::SymbolOutOfRange {
                symbol,
                alphabet_size: self.alphabet_size,
            }),
            None => Ok(()),
        }
    }

    /// Follows `input` from the root as far as the tree goes and returns the visited nodes,
    /// starting with the root.
    fn existing_path(&self, input: &[Symbol]) -> Vec<NodeId> {
        let mut path = vec![self.root()];
        let mut current = self.root();
        for &a in input {
            match self.nodes[current].successor(a) {
                Some(next) => {
                    path.push(next);
                    current = next;
                }
                None => break,
            }
        }
        path
    }

    fn get_or_add_child(&mut self, parent: NodeId, symbol: Symbol) -> NodeId {
        match self.nodes[parent].successor(symbol) {
            Some(q) => q,
            None => self.push_child(parent, symbol),
        }
    }

    /// Inserts a sample, which consists of an input sequence and the outputs it produces. If `output`
    /// is shorter than `input`, the outputs annotate the last `output.len()` transitions. Returns the
    /// node that is reached by `input`.
    ///
    /// Insertion is atomic: if the sample contradicts an output that is already present, a
    /// [`SampleError::Conflict`] is returned and the tree is left untouched.
    pub fn insert_sample(&mut self, input: &[Symbol], output: &[C]) -> Result<NodeId, SampleError> {
        self.check_symbols(input)?;
        if output.len() > input.len() {
            return Err(SampleError::LengthMismatch {
                inputs: input.len(),
                outputs: output.len(),
            });
        }
        let offset = input.len() - output.len();

        // only transitions that already exist can contradict the sample
        let path = self.existing_path(input);
        for (i, (&q, &a)) in path.iter().zip(input).enumerate() {
            if i < offset {
                continue;
            }
            if let Some(existing) = self.nodes[q].output(a) {
                if existing != &output[i - offset] {
                    debug!("sample conflict on prefix {:?}", &input[..=i]);
                    return Err(SampleError::Conflict {
                        prefix: input[..=i].to_vec(),
                    });
                }
            }
        }

        let mut current = self.root();
        for (i, &a) in input.iter().enumerate() {
            let next = self.get_or_add_child(current, a);
            if i >= offset {
                self.nodes[current].outputs[a] = Some(output[i - offset].clone());
            }
            current = next;
        }
        trace!("inserted sample {:?}, reaching node {current}", input);
        Ok(current)
    }

    /// Inserts a Moore-style sample, where `properties[i]` is the state property of the node reached
    /// by the first `i` symbols of `input`. Thus there must be exactly one more property than there
    /// are input symbols. Like [`Self::insert_sample`], this is atomic.
    pub fn insert_state_properties(
        &mut self,
        input: &[Symbol],
        properties: &[Q],
    ) -> Result<NodeId, SampleError> {
        self.check_symbols(input)?;
        if properties.len() != input.len() + 1 {
            return Err(SampleError::LengthMismatch {
                inputs: input.len(),
                outputs: properties.len(),
            });
        }

        let path = self.existing_path(input);
        for (i, &q) in path.iter().enumerate() {
            if let Some(existing) = self.nodes[q].property() {
                if existing != &properties[i] {
                    return Err(SampleError::Conflict {
                        prefix: input[..i].to_vec(),
                    });
                }
            }
        }

        let mut current = self.root();
        self.nodes[current].property = Some(properties[0].clone());
        for (i, &a) in input.iter().enumerate() {
            current = self.get_or_add_child(current, a);
            self.nodes[current].property = Some(properties[i + 1].clone());
        }
        Ok(current)
    }

    /// Raises the height bound of `node` to `height` and propagates the increase along the parent links.
    pub(crate) fn raise_height(&mut self, node: NodeId, height: usize) {
        let mut current = node;
        let mut height = height;
        while height > self.nodes[current].height {
            self.nodes[current].height = height;
            match self.nodes[current].parent {
                Some((parent, _)) => {
                    current = parent;
                    height += 1;
                }
                None => break,
            }
        }
    }

    /// Decides whether some node at distance at least `min_depth` is reachable from `node`. Distances
    /// are determined by a breadth-first search, so on the (possibly cyclic) red part they are shortest
    /// distances. As the height of a non-red node bounds its subtree, this can often be answered
    /// without any search.
    pub fn reaches_depth(&self, node: NodeId, min_depth: usize) -> bool {
        if min_depth == 0 {
            return true;
        }
        let Some(start) = self.nodes.get(node) else {
            return false;
        };
        if !start.is_red() && start.height < min_depth {
            return false;
        }

        let mut visited = BitSet::with_capacity(self.nodes.len());
        let mut queue = VecDeque::from([(node, 0usize)]);
        while let Some((q, depth)) = queue.pop_front() {
            for (_, succ) in self.nodes[q].successors() {
                if visited.insert(succ) {
                    if depth + 1 >= min_depth {
                        return true;
                    }
                    queue.push_back((succ, depth + 1));
                }
            }
        }
        false
    }

    /// Returns true if `a` and `b` are recorded as incompatible.
    pub fn is_incompatible(&self, a: NodeId, b: NodeId) -> bool {
        self.nodes
            .get(a)
            .map(|n| n.is_incompatible_with(b))
            .unwrap_or(false)
    }

    /// Checks whether the data stored in `a` and `b` themselves (not in their subtrees) contradicts,
    /// i.e. whether they have different state properties or emit different outputs on some symbol.
    pub fn conflicting(&self, a: NodeId, b: NodeId) -> bool {
        let (Some(a), Some(b)) = (self.nodes.get(a), self.nodes.get(b)) else {
            return false;
        };
        if let (Some(p), Some(q)) = (a.property(), b.property()) {
            if p != q {
                return true;
            }
        }
        a.outputs
            .iter()
            .zip(&b.outputs)
            .any(|pair| matches!(pair, (Some(x), Some(y)) if x != y))
    }

    /// Returns the parent link of `node` if it is still live, meaning the parent actually points to `node`.
    fn live_parent(&self, node: NodeId) -> Option<(NodeId, Symbol)> {
        let (parent, symbol) = self.nodes[node].parent?;
        (self.nodes[parent].successor(symbol) == Some(node)).then_some((parent, symbol))
    }

    /// Records that `a` and `b` can never be merged. As the two nodes are reached from their parents
    /// on the same symbol, merging the parents would force merging `a` and `b`, so the parents are
    /// marked as well and so on, for as long as both nodes have live parent links with matching
    /// symbols. Returns the number of newly recorded pairs.
    pub(crate) fn mark_incompatible(&mut self, a: NodeId, b: NodeId) -> usize {
        let (mut a, mut b) = (a, b);
        let mut recorded = 0;
        while a != b && a < self.nodes.len() && b < self.nodes.len() {
            if !self.nodes[a].incompatible.insert(b) {
                break;
            }
            self.nodes[b].incompatible.insert(a);
            recorded += 1;

            match (self.live_parent(a), self.live_parent(b)) {
                (Some((pa, x)), Some((pb, y))) if x == y => {
                    a = pa;
                    b = pb;
                }
                _ => break,
            }
        }
        recorded
    }

    /// Promotes `node` to a canonical state.
    pub(crate) fn make_red(&mut self, node: NodeId) {
        assert!(
            !self.nodes[node].is_red(),
            "node {node} has already been promoted"
        );
        self.nodes[node].color = NodeColor::Red;
        self.red.push(node);
    }

    /// Colors a white node blue and makes `parent` its owner. Returns true if the color changed.
    pub(crate) fn make_blue(&mut self, node: NodeId, parent: NodeId, symbol: Symbol) -> bool {
        let n = &mut self.nodes[node];
        if n.color != NodeColor::White {
            return false;
        }
        n.color = NodeColor::Blue;
        n.parent = Some((parent, symbol));
        true
    }

    /// Resets the parent link of all successors of `node` to `node`.
    pub(crate) fn adopt_children(&mut self, node: NodeId) {
        let children = self.nodes[node].successors().collect::<Vec<_>>();
        for (a, child) in children {
            self.nodes[child].parent = Some((node, a));
        }
    }

    /// Appends a node that was created elsewhere, its identity must match the next free one.
    pub(crate) fn push_node(&mut self, node: Node<Q, C>) {
        assert_eq!(node.id, self.nodes.len(), "node identities must be dense");
        self.nodes.push(node);
    }

    pub(crate) fn get(&self, id: NodeId) -> &Node<Q, C> {
        &self.nodes[id]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node<Q, C> {
        &mut self.nodes[id]
    }

    /// Recomputes the height bounds of all nodes with identity at least `first`. These are the nodes
    /// appended by a merge, they form a forest below red nodes, so they can be settled bottom-up.
    pub(crate) fn settle_heights(&mut self, first: NodeId) {
        let mut settled = BitSet::with_capacity(self.nodes.len());
        let mut stack: Vec<NodeId> = (first..self.nodes.len()).collect();
        while let Some(&q) = stack.last() {
            if settled.contains(q) {
                stack.pop();
                continue;
            }
            let pending = self.nodes[q]
                .successors()
                .map(|(_, s)| s)
                .filter(|&s| s >= first && !settled.contains(s) && !self.nodes[s].is_red())
                .collect_vec();
            if !pending.is_empty() {
                stack.extend(pending);
                continue;
            }
            let height = self.nodes[q]
                .successors()
                .map(|(_, s)| self.nodes[s].height + 1)
                .max()
                .unwrap_or(0);
            let node = &mut self.nodes[q];
            node.height = node.height.max(height);
            settled.insert(q);
            stack.pop();
        }
    }

    /// Reads off the machine formed by the red nodes. States are numbered in promotion order, so the
    /// root becomes the initial state `0`. This is only meaningful once the fringe is exhausted, at
    /// which point every transition of a red node leads to a red node.
    pub fn to_automaton(&self) -> MealyMachine<C, Q> {
        let numbering: math::Bijection<NodeId, usize> =
            self.red.iter().enumerate().map(|(i, &q)| (q, i)).collect();

        let states = self
            .red
            .iter()
            .map(|&q| {
                let node = &self.nodes[q];
                let edges = (0..self.alphabet_size)
                    .map(|a| {
                        let target = node.successor(a)?;
                        let Some(&state) = numbering.get_by_left(&target) else {
                            debug_assert!(false, "red node {q} points to non-red node {target}");
                            return None;
                        };
                        Some((state, node.output(a).cloned()))
                    })
                    .collect();
                MealyState::new(node.property().cloned(), edges)
            })
            .collect();

        let initial = numbering.get_by_left(&self.root()).copied().unwrap_or(0);
        MealyMachine::from_parts(self.alphabet_size, initial, states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> PrefixTree<Void, char> {
        let mut tree = PrefixTree::new(2);
        tree.insert_sample(&[0], &['a']).unwrap();
        tree.insert_sample(&[1], &['b']).unwrap();
        tree.insert_sample(&[0, 0], &['a', 'a']).unwrap();
        tree
    }

    #[test]
    fn building_the_tree() {
        let tree = sample_tree();
        assert_eq!(tree.len(), 4);
        let n0 = tree.successor(0, 0).unwrap();
        let n1 = tree.successor(0, 1).unwrap();
        assert_eq!(tree.output(0, 0), Some(&'a'));
        assert_eq!(tree.output(0, 1), Some(&'b'));
        assert_eq!(tree.output(n0, 0), Some(&'a'));
        assert_eq!(tree.node(n0).unwrap().parent(), Some(0));
        assert_eq!(tree.node(n1).unwrap().parent_input(), Some(1));
        assert_eq!(tree.node(0).unwrap().height(), 2);
        assert_eq!(tree.node(n0).unwrap().height(), 1);
        assert_eq!(tree.node(n1).unwrap().height(), 0);
        assert_eq!(tree.child_count(0), 2);
    }

    #[test]
    fn conflicting_samples_are_rejected() {
        let mut tree = sample_tree();
        let before = tree.clone();
        assert_eq!(
            tree.insert_sample(&[0, 0, 1], &['a', 'b', 'a']),
            Err(SampleError::Conflict { prefix: vec![0, 0] })
        );
        assert_eq!(tree, before);

        assert!(matches!(
            tree.insert_sample(&[2], &['a']),
            Err(SampleError::SymbolOutOfRange { symbol: 2, .. })
        ));
        assert!(matches!(
            tree.insert_sample(&[0], &['a', 'a']),
            Err(SampleError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn partial_outputs_annotate_the_suffix() {
        let mut tree: PrefixTree<Void, char> = PrefixTree::new(2);
        let reached = tree.insert_sample(&[1, 0, 1], &['x']).unwrap();
        assert_eq!(tree.output(0, 1), None);
        let n1 = tree.successor(0, 1).unwrap();
        let n10 = tree.successor(n1, 0).unwrap();
        assert_eq!(tree.output(n10, 1), Some(&'x'));
        assert_eq!(tree.successor(n10, 1), Some(reached));

        // a later sample may fill in missing outputs but not contradict existing ones
        tree.insert_sample(&[1, 0], &['y', 'z']).unwrap();
        assert_eq!(tree.output(0, 1), Some(&'y'));
        assert!(tree.insert_sample(&[1, 0, 1], &['y', 'z', 'w']).is_err());
    }

    #[test]
    fn moore_properties() {
        let mut tree: PrefixTree<bool, Void> = PrefixTree::new(2);
        tree.insert_state_properties(&[0, 1], &[true, false, true])
            .unwrap();
        assert_eq!(tree.property(0), Some(&true));
        let n0 = tree.successor(0, 0).unwrap();
        assert_eq!(tree.property(n0), Some(&false));
        assert_eq!(
            tree.insert_state_properties(&[0], &[true, true]),
            Err(SampleError::Conflict { prefix: vec![0] })
        );
        assert!(tree.insert_state_properties(&[0], &[true]).is_err());
    }

    #[test]
    fn creating_nodes() {
        let mut tree: PrefixTree<Void, char> = PrefixTree::new(2);
        let a = tree.add_child(0, 1).unwrap();
        assert_eq!(
            tree.add_child(0, 1),
            Err(TreeError::Occupied { node: 0, symbol: 1 })
        );
        assert_eq!(tree.add_child(17, 0), Err(TreeError::UnknownNode(17)));
        assert!(tree.add_child(a, 2).is_err());
        let b = tree.add_child(a, 0).unwrap();
        assert!(b > a);
        assert_eq!(tree.node(0).unwrap().height(), 2);
    }

    #[test]
    fn depth_of_subtrees() {
        let tree = sample_tree();
        assert!(tree.reaches_depth(0, 0));
        assert!(tree.reaches_depth(0, 2));
        assert!(!tree.reaches_depth(0, 3));
        let n1 = tree.successor(0, 1).unwrap();
        assert!(!tree.reaches_depth(n1, 1));
    }

    #[test]
    fn incompatibilities_propagate_to_parents() {
        let mut tree: PrefixTree<Void, char> = PrefixTree::new(2);
        tree.insert_sample(&[0, 1, 0], &['a', 'a', 'a']).unwrap();
        tree.insert_sample(&[1, 1, 0], &['a', 'a', 'b']).unwrap();
        let n0 = tree.successor(0, 0).unwrap();
        let n01 = tree.successor(n0, 1).unwrap();
        let n1 = tree.successor(0, 1).unwrap();
        let n11 = tree.successor(n1, 1).unwrap();

        assert!(tree.conflicting(n01, n11));
        assert!(!tree.conflicting(n0, n1));
        assert_eq!(tree.mark_incompatible(n01, n11), 2);
        assert!(tree.is_incompatible(n01, n11));
        assert!(tree.is_incompatible(n11, n01));
        assert!(tree.is_incompatible(n0, n1));
        assert!(tree.is_incompatible(n1, n0));
        // n0 and n1 hang off the root on different symbols, so nothing further is recorded
        assert_eq!(tree.mark_incompatible(n01, n11), 0);
    }

    #[test]
    fn incompatibility_needs_matching_symbols() {
        let mut tree: PrefixTree<Void, char> = PrefixTree::new(2);
        tree.insert_sample(&[0, 0, 0], &['a', 'a', 'a']).unwrap();
        tree.insert_sample(&[1, 1, 0], &['a', 'a', 'b']).unwrap();
        let n00 = tree.successor(tree.successor(0, 0).unwrap(), 0).unwrap();
        let n11 = tree.successor(tree.successor(0, 1).unwrap(), 1).unwrap();
        assert_eq!(tree.mark_incompatible(n00, n11), 1);
        let n0 = tree.successor(0, 0).unwrap();
        let n1 = tree.successor(0, 1).unwrap();
        assert!(!tree.is_incompatible(n0, n1));
    }
}
