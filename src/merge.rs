use tracing::trace;

use crate::{
    math::Map,
    prefixtree::{Node, NodeId, PrefixTree},
    Color, Symbol,
};

/// Decides when a merge whose subtrees could be reconciled without conflict is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeCriterion {
    /// The classic blue-fringe criterion, every conflict free merge is accepted.
    Plain,
    /// A merge is only accepted if the red subtree reaches `min_depth` and the reconciliation of
    /// both subtrees descends at least `min_depth` levels.
    Strong {
        /// The minimal depth up to which the subtrees must agree.
        min_depth: usize,
    },
}

impl MergeCriterion {
    /// A minimal depth of `0` gives the plain criterion, anything else the strong one.
    pub fn from_min_depth(min_depth: usize) -> Self {
        match min_depth {
            0 => MergeCriterion::Plain,
            min_depth => MergeCriterion::Strong { min_depth },
        }
    }

    /// The minimal depth that is required, `0` for the plain criterion.
    pub fn min_depth(&self) -> usize {
        match self {
            MergeCriterion::Plain => 0,
            MergeCriterion::Strong { min_depth } => *min_depth,
        }
    }
}

/// Why a merge attempt was turned down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The two nodes are already known to be incompatible.
    KnownIncompatible,
    /// The subtree of the red node does not reach the required depth.
    ShallowRed {
        /// The depth that would have been required.
        min_depth: usize,
    },
    /// Reconciling the subtrees led to a contradiction between the two given nodes, the first one
    /// stemming from the red side and the second one from the blue side.
    Conflict(NodeId, NodeId),
    /// Everything could be reconciled, but the reconciliation did not descend deep enough.
    InsufficientDepth {
        /// Deepest level that was reached.
        reached: usize,
        /// Depth that would have been required.
        required: usize,
    },
}

/// A merge attempt that did not succeed. Rejections are a normal outcome and never leave the learner,
/// but they carry the information that is needed to remember incompatibilities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// The red node that should have absorbed `blue`.
    pub red: NodeId,
    /// The blue node that should have been folded.
    pub blue: NodeId,
    /// The reason for the rejection.
    pub reason: RejectReason,
}

impl Rejection {
    /// If the rejection was caused by two nodes whose own data contradicts, this returns the pair.
    /// Contradictions that only arise from data which the attempt itself moved around are not
    /// reported, as they do not imply that the two nodes can never be merged.
    pub fn incompatible_pair<Q: Color, C: Color>(
        &self,
        tree: &PrefixTree<Q, C>,
    ) -> Option<(NodeId, NodeId)> {
        match self.reason {
            RejectReason::Conflict(a, b) if tree.conflicting(a, b) => Some((a, b)),
            _ => None,
        }
    }
}

/// A successful, not yet committed merge of a blue node into a red node.
///
/// While a merge is explored, the tree is only read. All changes are collected in the merge itself:
/// pending successors, outputs and properties of red nodes are kept in overlays keyed by the identity
/// of the red node, and non-red nodes that need to change are copied on first write. The copies
/// already carry the identities they will have once they are appended to the tree, which is why a
/// merge can only be applied to the tree it was computed on. Dropping a merge discards it.
#[derive(Debug, Clone)]
pub struct Merge<Q, C> {
    red: NodeId,
    blue: NodeId,
    base: NodeId,
    copies: Vec<Node<Q, C>>,
    copy_of: Map<NodeId, NodeId>,
    successor_overlay: Map<NodeId, Vec<Option<NodeId>>>,
    output_overlay: Map<NodeId, Vec<Option<C>>>,
    property_overlay: Map<NodeId, Q>,
    depth: usize,
}

impl<Q: Color, C: Color> Merge<Q, C> {
    /// The red node that absorbs the blue one.
    pub fn red(&self) -> NodeId {
        self.red
    }

    /// The blue node that is folded into the red one.
    pub fn blue(&self) -> NodeId {
        self.blue
    }

    /// The deepest level that reconciling both subtrees descended to.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The number of nodes that had to be copied.
    pub fn copy_count(&self) -> usize {
        self.copies.len()
    }

    /// Commits the merge into `tree`. Copies are appended to the arena, overlays are written into
    /// their red nodes and for every transition of a red node that now leads to a previously white
    /// node, that node is colored blue and `new_fringe` is called with the source and symbol.
    pub fn apply<F>(self, tree: &mut PrefixTree<Q, C>, mut new_fringe: F)
    where
        F: FnMut(NodeId, Symbol),
    {
        assert_eq!(
            tree.len(),
            self.base,
            "merge is applied to a tree it was not computed on"
        );
        let Merge {
            base,
            copies,
            mut successor_overlay,
            mut output_overlay,
            mut property_overlay,
            ..
        } = self;

        for copy in copies {
            tree.push_node(copy);
        }
        tree.settle_heights(base);

        for red in tree.red_states().to_vec() {
            if let Some(property) = property_overlay.remove(&red) {
                tree.node_mut(red).property = Some(property);
            }
            if let Some(outputs) = output_overlay.remove(&red) {
                tree.node_mut(red).outputs = outputs;
            }
            if let Some(successors) = successor_overlay.remove(&red) {
                for (symbol, target) in successors.iter().enumerate() {
                    if let Some(target) = *target {
                        if tree.make_blue(target, red, symbol) {
                            new_fringe(red, symbol);
                        }
                    }
                }
                tree.node_mut(red).successors = successors;
            }
        }
        debug_assert!(
            successor_overlay.is_empty() && output_overlay.is_empty() && property_overlay.is_empty(),
            "overlays may only be attached to red nodes"
        );
    }
}

/// One level of the reconciliation, `q` is the node on the red side (possibly a copy), `r` the node
/// on the blue side and `next` the next symbol that needs to be treated.
#[derive(Debug, Clone, Copy)]
struct Fold {
    q: NodeId,
    r: NodeId,
    next: Symbol,
    depth: usize,
}

impl Fold {
    /// The symbol that is currently being treated on this level.
    fn current(&self) -> Symbol {
        self.next - 1
    }
}

/// Merges the outputs `incoming` into `existing`. Returns `Ok(None)` if `existing` already subsumes
/// `incoming`, the merged outputs if something changed and the first contradicting symbol otherwise.
fn merge_outputs<C: Color>(
    existing: &[Option<C>],
    incoming: &[Option<C>],
) -> Result<Option<Vec<Option<C>>>, Symbol> {
    let mut merged: Option<Vec<Option<C>>> = None;
    for (symbol, output) in incoming.iter().enumerate() {
        let Some(output) = output else {
            continue;
        };
        match &existing[symbol] {
            Some(present) if present != output => return Err(symbol),
            Some(_) => {}
            None => {
                merged.get_or_insert_with(|| existing.to_vec())[symbol] = Some(output.clone());
            }
        }
    }
    Ok(merged)
}

/// The state of an ongoing merge attempt, it combines a read-only view of the tree with the changes
/// collected so far.
struct Attempt<'t, Q, C> {
    tree: &'t PrefixTree<Q, C>,
    merge: Merge<Q, C>,
}

type Contradiction = (NodeId, NodeId);

impl<'t, Q: Color, C: Color> Attempt<'t, Q, C> {
    fn new(tree: &'t PrefixTree<Q, C>, red: NodeId, blue: NodeId) -> Self {
        Self {
            tree,
            merge: Merge {
                red,
                blue,
                base: tree.len(),
                copies: vec![],
                copy_of: Map::default(),
                successor_overlay: Map::default(),
                output_overlay: Map::default(),
                property_overlay: Map::default(),
                depth: 0,
            },
        }
    }

    fn is_copy(&self, id: NodeId) -> bool {
        id >= self.merge.base || self.merge.copy_of.contains_key(&id)
    }

    /// Maps a node of the tree to its copy, if one exists.
    fn resolve(&self, id: NodeId) -> NodeId {
        if id >= self.merge.base {
            id
        } else {
            self.merge.copy_of.get(&id).copied().unwrap_or(id)
        }
    }

    fn node(&self, id: NodeId) -> &Node<Q, C> {
        let id = self.resolve(id);
        if id >= self.merge.base {
            &self.merge.copies[id - self.merge.base]
        } else {
            self.tree.get(id)
        }
    }

    fn copy_mut(&mut self, id: NodeId) -> &mut Node<Q, C> {
        let id = self.resolve(id);
        assert!(id >= self.merge.base, "only copies may be modified");
        &mut self.merge.copies[id - self.merge.base]
    }

    /// Gives the node of the tree that `id` stands for, copies are mapped to their origin.
    fn original(&self, id: NodeId) -> NodeId {
        if id >= self.merge.base {
            self.merge.copies[id - self.merge.base]
                .origin()
                .unwrap_or(id)
        } else {
            id
        }
    }

    fn is_red(&self, id: NodeId) -> bool {
        self.node(id).is_red()
    }

    fn successor(&self, q: NodeId, symbol: Symbol) -> Option<NodeId> {
        match self.merge.successor_overlay.get(&q) {
            Some(successors) => successors[symbol],
            None => self.node(q).successor(symbol),
        }
    }

    fn outputs(&self, q: NodeId) -> &[Option<C>] {
        match self.merge.output_overlay.get(&q) {
            Some(outputs) => outputs,
            None => &self.node(q).outputs,
        }
    }

    fn property(&self, q: NodeId) -> Option<&Q> {
        self.merge
            .property_overlay
            .get(&q)
            .or_else(|| self.node(q).property())
    }

    /// Returns the copy of `id`, creating it if this is the first time it is needed.
    fn copy(&mut self, id: NodeId) -> NodeId {
        let id = self.resolve(id);
        if id >= self.merge.base {
            return id;
        }
        let copy = self.merge.base + self.merge.copies.len();
        self.merge.copies.push(self.tree.get(id).copy_as(copy));
        self.merge.copy_of.insert(id, copy);
        copy
    }

    /// Records a change of the transition of the red node `red` on `symbol` in the overlay.
    fn update_red_transition(
        &mut self,
        red: NodeId,
        symbol: Symbol,
        target: NodeId,
        output: Option<C>,
    ) {
        debug_assert!(self.is_red(red), "{red} is not red");
        let tree = self.tree;
        self.merge
            .successor_overlay
            .entry(red)
            .or_insert_with(|| tree.get(red).successors.clone())[symbol] = Some(target);
        if let Some(output) = output {
            self.merge
                .output_overlay
                .entry(red)
                .or_insert_with(|| tree.get(red).outputs.clone())[symbol] = Some(output);
        }
    }

    /// Folds the state property and the outputs of `blue` into the red node `red`.
    fn merge_red_properties(&mut self, red: NodeId, blue: NodeId) -> Result<(), Contradiction> {
        debug_assert!(self.is_red(red), "{red} is not red");
        let tree = self.tree;

        if let Some(incoming) = tree.get(blue).property() {
            match self.property(red).cloned() {
                Some(present) if &present != incoming => return Err((red, blue)),
                Some(_) => {}
                None => {
                    self.merge.property_overlay.insert(red, incoming.clone());
                }
            }
        }

        match merge_outputs(self.outputs(red), &tree.get(blue).outputs) {
            Err(symbol) => {
                trace!("outputs of {red} and {blue} differ on {symbol}");
                Err((red, blue))
            }
            Ok(Some(merged)) => {
                self.merge.output_overlay.insert(red, merged);
                Ok(())
            }
            Ok(None) => Ok(()),
        }
    }

    /// Folds the data of `blue` into the non-red node `q`, copying `q` if it needs to change. Returns
    /// the node that stands for `q` from now on.
    fn merge_into_copy(
        &mut self,
        stack: &mut [Fold],
        q: NodeId,
        blue: NodeId,
        symbol: Symbol,
    ) -> Result<NodeId, Contradiction> {
        let tree = self.tree;
        let incoming = tree.get(blue);
        let present = self.node(q);

        let property = match (present.property(), incoming.property()) {
            (None, Some(p)) => Some(p.clone()),
            (Some(a), Some(b)) if a != b => return Err((q, blue)),
            _ => None,
        };
        let outputs =
            merge_outputs(&present.outputs, &incoming.outputs).map_err(|_| (q, blue))?;

        if property.is_none() && outputs.is_none() {
            return Ok(q);
        }
        let copy = self.copy_top_successor(stack, q, symbol);
        let node = self.copy_mut(copy);
        if let Some(property) = property {
            node.property = Some(property);
        }
        if let Some(outputs) = outputs {
            node.outputs = outputs;
        }
        Ok(copy)
    }

    /// Copies `successor`, the successor of the topmost node on the stack on `symbol`, and links the
    /// copy into the topmost node (which is copied itself if it is not red).
    fn copy_top_successor(
        &mut self,
        stack: &mut [Fold],
        successor: NodeId,
        symbol: Symbol,
    ) -> NodeId {
        if self.is_copy(successor) {
            return self.resolve(successor);
        }
        let copy = self.copy(successor);
        let top = stack[stack.len() - 1].q;
        if self.is_red(top) {
            self.update_red_transition(top, symbol, copy, None);
            self.copy_mut(copy).parent = Some((top, symbol));
        } else {
            let top = self.copy_top(stack);
            self.link_copies(top, symbol, copy);
        }
        copy
    }

    /// Makes the copy `target` the successor of the copy `source` on `symbol`.
    fn link_copies(&mut self, source: NodeId, symbol: Symbol, target: NodeId) {
        self.copy_mut(source).successors[symbol] = Some(target);
        self.copy_mut(target).parent = Some((source, symbol));
    }

    /// Copies the topmost node on the stack and relinks the copy by copying its ancestors along the
    /// stack, up to the closest red ancestor or an ancestor that has already been copied.
    fn copy_top(&mut self, stack: &mut [Fold]) -> NodeId {
        let (top, below) = stack
            .split_last_mut()
            .expect("reconciliation stack is never empty");
        debug_assert!(!self.is_red(top.q), "red nodes are never copied");

        if self.is_copy(top.q) {
            top.q = self.resolve(top.q);
            return top.q;
        }
        let top_copy = self.copy(top.q);
        top.q = top_copy;

        let mut target = top_copy;
        for fold in below.iter_mut().rev() {
            let symbol = fold.current();
            if self.is_red(fold.q) {
                self.update_red_transition(fold.q, symbol, target, None);
                self.copy_mut(target).parent = Some((fold.q, symbol));
                return top_copy;
            }
            let was_copy = self.is_copy(fold.q);
            let source = self.copy(fold.q);
            self.link_copies(source, symbol, target);
            fold.q = source;
            if was_copy {
                return top_copy;
            }
            target = source;
        }
        debug_assert!(false, "the bottom of the stack is always red");
        top_copy
    }

    /// Runs the reconciliation of the subtree of the red node with the subtree of the blue node, using an
    /// explicit stack. Returns the contradiction that was found, if any.
    fn fold(&mut self) -> Result<(), Contradiction> {
        let alphabet_size = self.tree.alphabet_size();
        let mut stack = vec![Fold {
            q: self.merge.red,
            r: self.merge.blue,
            next: 0,
            depth: 0,
        }];

        while let Some(top) = stack.last_mut() {
            if top.next == alphabet_size {
                stack.pop();
                continue;
            }
            let Fold { q, r, next: symbol, depth } = *top;
            top.next += 1;

            let Some(r_succ) = self.tree.successor(r, symbol) else {
                continue;
            };

            match self.successor(q, symbol) {
                Some(q_succ) => {
                    let q_succ = if self.is_red(q_succ) {
                        self.merge_red_properties(q_succ, r_succ)?;
                        q_succ
                    } else {
                        self.merge_into_copy(&mut stack, q_succ, r_succ, symbol)?
                    };
                    stack.push(Fold {
                        q: q_succ,
                        r: r_succ,
                        next: 0,
                        depth: depth + 1,
                    });
                    self.merge.depth = self.merge.depth.max(depth + 1);
                }
                None if self.is_red(q) => {
                    let output = self.tree.output(r, symbol).cloned();
                    self.update_red_transition(q, symbol, r_succ, output);
                }
                None => {
                    let copy = self.copy_top(&mut stack);
                    self.copy_mut(copy).successors[symbol] = Some(r_succ);
                }
            }
        }
        Ok(())
    }
}

/// Attempts to fold the blue node `blue` into the red node `red` under the given criterion. The tree is
/// only read, a successful attempt yields a [`Merge`] that can be committed with [`Merge::apply`].
pub fn try_merge<Q: Color, C: Color>(
    tree: &PrefixTree<Q, C>,
    red: NodeId,
    blue: NodeId,
    criterion: MergeCriterion,
) -> Result<Merge<Q, C>, Rejection> {
    let reject = |reason| Rejection { red, blue, reason };

    if tree.is_incompatible(blue, red) {
        return Err(reject(RejectReason::KnownIncompatible));
    }
    if let MergeCriterion::Strong { min_depth } = criterion {
        if !tree.reaches_depth(red, min_depth) {
            return Err(reject(RejectReason::ShallowRed { min_depth }));
        }
    }

    let mut attempt = Attempt::new(tree, red, blue);
    let folded = attempt.merge_red_properties(red, blue).and_then(|_| {
        if let Some((parent, symbol)) = tree.get(blue).parent {
            attempt.update_red_transition(parent, symbol, red, None);
        }
        attempt.fold()
    });
    if let Err((a, b)) = folded {
        let (a, b) = (attempt.original(a), attempt.original(b));
        trace!("merging {blue} into {red} fails, {a} contradicts {b}");
        return Err(reject(RejectReason::Conflict(a, b)));
    }

    let merge = attempt.merge;
    match criterion {
        MergeCriterion::Strong { min_depth } if merge.depth < min_depth => {
            trace!(
                "merging {blue} into {red} only reaches depth {} < {min_depth}",
                merge.depth
            );
            Err(reject(RejectReason::InsufficientDepth {
                reached: merge.depth,
                required: min_depth,
            }))
        }
        _ => Ok(merge),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Void;

    /// Root is red, its successors on `0` and `1` are blue. The blue node on `1` can be folded into the
    /// root, which requires copying the blue node on `0` to add an output and graft a subtree.
    fn fringe_tree(extra: &[(Vec<Symbol>, Vec<char>)]) -> PrefixTree<Void, char> {
        let mut tree = PrefixTree::new(2);
        tree.insert_sample(&[0, 1], &['a', 'c']).unwrap();
        tree.insert_sample(&[1, 0, 0], &['a', 'a', 'e']).unwrap();
        for (input, output) in extra {
            tree.insert_sample(input, output).unwrap();
        }
        tree.make_red(0);
        for symbol in 0..2 {
            let child = tree.successor(0, symbol).unwrap();
            tree.make_blue(child, 0, symbol);
        }
        tree
    }

    #[test]
    fn criterion_from_depth() {
        assert_eq!(MergeCriterion::from_min_depth(0), MergeCriterion::Plain);
        assert_eq!(
            MergeCriterion::from_min_depth(2),
            MergeCriterion::Strong { min_depth: 2 }
        );
        assert_eq!(MergeCriterion::from_min_depth(2).min_depth(), 2);
    }

    #[test]
    fn output_merging() {
        let a = [Some('x'), None];
        assert_eq!(merge_outputs(&a, &[None, None]), Ok(None));
        assert_eq!(merge_outputs(&a, &[Some('x'), None]), Ok(None));
        assert_eq!(
            merge_outputs(&a, &[None, Some('y')]),
            Ok(Some(vec![Some('x'), Some('y')]))
        );
        assert_eq!(merge_outputs(&a, &[Some('y'), None]), Err(0));
    }

    #[test_log::test]
    fn copy_on_write_merge() {
        let mut tree = fringe_tree(&[]);
        let a = tree.successor(0, 0).unwrap();
        let a1 = tree.successor(a, 1).unwrap();
        let b = tree.successor(0, 1).unwrap();
        let b0 = tree.successor(b, 0).unwrap();
        let b00 = tree.successor(b0, 0).unwrap();

        let merge = try_merge(&tree, 0, b, MergeCriterion::Plain).unwrap();
        assert_eq!(merge.depth(), 1);
        assert_eq!(merge.copy_count(), 1);

        let mut fringe = vec![];
        merge.apply(&mut tree, |q, a| fringe.push((q, a)));
        assert!(fringe.is_empty());

        let copy = tree.successor(0, 0).unwrap();
        assert_ne!(copy, a);
        assert_eq!(tree.node(copy).unwrap().origin(), Some(a));
        assert!(tree.node(copy).unwrap().is_blue());
        assert_eq!(tree.output(copy, 0), Some(&'e'));
        assert_eq!(tree.output(copy, 1), Some(&'c'));
        assert_eq!(tree.successor(copy, 0), Some(b00));
        assert_eq!(tree.successor(copy, 1), Some(a1));
        assert_eq!(tree.node(copy).unwrap().height(), 1);
        assert_eq!(tree.successor(0, 1), Some(0));

        // the original is left as it was
        assert_eq!(tree.output(a, 0), None);
        assert_eq!(tree.successor(a, 0), None);
    }

    #[test]
    fn rejected_attempts_leave_the_tree_untouched() {
        let tree = fringe_tree(&[]);
        let snapshot = tree.clone();
        let b = tree.successor(0, 1).unwrap();

        let rejection =
            try_merge(&tree, 0, b, MergeCriterion::Strong { min_depth: 3 }).unwrap_err();
        assert_eq!(
            rejection.reason,
            RejectReason::InsufficientDepth {
                reached: 1,
                required: 3
            }
        );
        assert_eq!(rejection.incompatible_pair(&tree), None);
        assert_eq!(tree, snapshot);

        let rejection =
            try_merge(&tree, 0, b, MergeCriterion::Strong { min_depth: 4 }).unwrap_err();
        assert_eq!(rejection.reason, RejectReason::ShallowRed { min_depth: 4 });
        assert_eq!(tree, snapshot);
    }

    #[test]
    fn conflicts_are_reported_on_original_nodes() {
        let mut tree = fringe_tree(&[(vec![1, 0, 1], vec!['a', 'a', 'd'])]);
        let snapshot = tree.clone();
        let a = tree.successor(0, 0).unwrap();
        let b = tree.successor(0, 1).unwrap();
        let b0 = tree.successor(b, 0).unwrap();

        let rejection = try_merge(&tree, 0, b, MergeCriterion::Plain).unwrap_err();
        assert_eq!(rejection.reason, RejectReason::Conflict(a, b0));
        assert_eq!(tree, snapshot);

        let (x, y) = rejection.incompatible_pair(&tree).unwrap();
        assert_eq!(tree.mark_incompatible(x, y), 2);
        assert!(tree.is_incompatible(0, b));
        assert_eq!(
            try_merge(&tree, 0, b, MergeCriterion::Plain)
                .unwrap_err()
                .reason,
            RejectReason::KnownIncompatible
        );
    }

    #[test]
    fn red_outputs_must_agree() {
        let tree = fringe_tree(&[(vec![1, 1], vec!['a', 'z'])]);
        let b = tree.successor(0, 1).unwrap();
        let rejection = try_merge(&tree, 0, b, MergeCriterion::Plain).unwrap_err();
        assert_eq!(rejection.reason, RejectReason::Conflict(0, b));
    }

    #[test]
    fn state_properties_are_reconciled() {
        let mut tree: PrefixTree<bool, Void> = PrefixTree::new(1);
        tree.insert_state_properties(&[0, 0], &[true, false, true])
            .unwrap();
        tree.make_red(0);
        let n0 = tree.successor(0, 0).unwrap();
        tree.make_blue(n0, 0, 0);
        let n00 = tree.successor(n0, 0).unwrap();

        let rejection = try_merge(&tree, 0, n0, MergeCriterion::Plain).unwrap_err();
        assert_eq!(rejection.reason, RejectReason::Conflict(0, n0));
        assert_eq!(rejection.incompatible_pair(&tree), Some((0, n0)));

        // the grandchild has the same property as the root and can be folded into it
        tree.make_red(n0);
        tree.make_blue(n00, n0, 0);
        let merge = try_merge(&tree, 0, n00, MergeCriterion::Plain).unwrap();
        merge.apply(&mut tree, |_, _| {});
        assert_eq!(tree.successor(n0, 0), Some(0));
    }
}
