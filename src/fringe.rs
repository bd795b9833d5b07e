use std::{
    cmp::{Ordering, Reverse},
    collections::{BinaryHeap, VecDeque},
};

use itertools::Itertools;
use owo_colors::OwoColorize;
use rayon::prelude::*;
use tracing::{debug, info, trace};

use crate::{
    math::{self, Map},
    merge::{try_merge, Merge, MergeCriterion},
    passive::LearnerSettings,
    prefixtree::{NodeId, PrefixTree},
    Color, Symbol,
};

/// A transition of a red node whose target still needs to be dealt with. Only the source and the
/// symbol are stored, the target is looked up when the transition is taken from the worklist. If a
/// merge has redirected the transition in the meantime, this automatically gives the new target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FringeTransition {
    /// The red node the transition leaves.
    pub source: NodeId,
    /// The symbol of the transition.
    pub symbol: Symbol,
}

impl FringeTransition {
    /// Creates a new fringe transition.
    pub fn new(source: NodeId, symbol: Symbol) -> Self {
        Self { source, symbol }
    }

    /// The node the transition currently leads to.
    pub fn target<Q: Color, C: Color>(&self, tree: &PrefixTree<Q, C>) -> Option<NodeId> {
        tree.successor(self.source, self.symbol)
    }
}

/// The order in which fringe transitions are taken from the worklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProcessingOrder {
    /// First in, first out. This roughly corresponds to a breadth-first traversal.
    #[default]
    Fifo,
    /// Last in, first out.
    Lifo,
    /// Transitions are taken in length-lexicographic order of the words that reach their targets.
    Canonical,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CanonicalEntry {
    access: Vec<Symbol>,
    transition: FringeTransition,
}

impl Ord for CanonicalEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        math::length_lexicographic(&self.access, &other.access)
            .then_with(|| self.transition.cmp(&other.transition))
    }
}

impl PartialOrd for CanonicalEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
enum Worklist {
    Fifo(VecDeque<FringeTransition>),
    Lifo(Vec<FringeTransition>),
    Canonical(BinaryHeap<Reverse<CanonicalEntry>>),
}

impl Worklist {
    fn new(order: ProcessingOrder) -> Self {
        match order {
            ProcessingOrder::Fifo => Worklist::Fifo(VecDeque::new()),
            ProcessingOrder::Lifo => Worklist::Lifo(vec![]),
            ProcessingOrder::Canonical => Worklist::Canonical(BinaryHeap::new()),
        }
    }

    fn pop(&mut self) -> Option<FringeTransition> {
        match self {
            Worklist::Fifo(queue) => queue.pop_front(),
            Worklist::Lifo(stack) => stack.pop(),
            Worklist::Canonical(heap) => heap.pop().map(|Reverse(entry)| entry.transition),
        }
    }

    fn len(&self) -> usize {
        match self {
            Worklist::Fifo(queue) => queue.len(),
            Worklist::Lifo(stack) => stack.len(),
            Worklist::Canonical(heap) => heap.len(),
        }
    }
}

/// What happened in a single [`Fringe::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The target of the transition became a red state.
    Promoted(NodeId),
    /// The blue node was folded into the red node.
    Merged {
        /// The red node that absorbed the blue one.
        red: NodeId,
        /// The blue node that disappeared.
        blue: NodeId,
    },
    /// The transition no longer led to a blue node and was dropped.
    Stale(FringeTransition),
}

/// Counters that are collected while the fringe is processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FringeStats {
    /// Number of nodes that were promoted, not counting the root.
    pub promotions: usize,
    /// Number of committed merges.
    pub merges: usize,
    /// Number of merge attempts that were rejected.
    pub rejections: usize,
    /// Number of recorded incompatible pairs.
    pub incompatibilities: usize,
    /// Number of worklist entries that turned out to be stale.
    pub stale: usize,
}

/// Drives the red/blue traversal of a [`PrefixTree`]. The root is red from the start, all other
/// nodes that are reachable from red nodes in one step are blue and wait in the worklist. Every
/// [`Fringe::step`] takes one of them and either folds it into a red node or promotes it.
#[derive(Debug, Clone)]
pub struct Fringe<Q, C> {
    tree: PrefixTree<Q, C>,
    criterion: MergeCriterion,
    skip_below_size: usize,
    deterministic: bool,
    parallel: bool,
    worklist: Worklist,
    access: Map<NodeId, Vec<Symbol>>,
    stats: FringeStats,
}

impl<Q: Color, C: Color> Fringe<Q, C> {
    /// Starts the traversal of `tree`, which must not have been colored before.
    pub fn new(tree: PrefixTree<Q, C>, settings: &LearnerSettings) -> Self {
        assert_eq!(tree.red_count(), 0, "tree has already been colored");
        let root = tree.root();
        let mut fringe = Self {
            tree,
            criterion: settings.criterion(),
            skip_below_size: settings.skip_below_size,
            deterministic: settings.deterministic,
            parallel: settings.parallel,
            worklist: Worklist::new(settings.order),
            access: Map::default(),
            stats: FringeStats::default(),
        };
        fringe.access.insert(root, vec![]);
        fringe.tree.make_red(root);
        fringe.expose(root);
        fringe
    }

    /// The tree in its current state.
    pub fn tree(&self) -> &PrefixTree<Q, C> {
        &self.tree
    }

    /// The counters collected so far.
    pub fn stats(&self) -> FringeStats {
        self.stats
    }

    /// Number of transitions waiting in the worklist, including stale ones.
    pub fn pending(&self) -> usize {
        self.worklist.len()
    }

    /// The merge criterion in use.
    pub fn criterion(&self) -> MergeCriterion {
        self.criterion
    }

    fn enqueue(&mut self, transition: FringeTransition) {
        trace!("enqueueing {:?}", transition);
        match &mut self.worklist {
            Worklist::Fifo(queue) => queue.push_back(transition),
            Worklist::Lifo(stack) => stack.push(transition),
            Worklist::Canonical(heap) => {
                let mut access = self
                    .access
                    .get(&transition.source)
                    .cloned()
                    .unwrap_or_default();
                access.push(transition.symbol);
                heap.push(Reverse(CanonicalEntry { access, transition }));
            }
        }
    }

    /// Colors all successors of the red node `red` blue and enqueues the transitions leading to them.
    fn expose(&mut self, red: NodeId) {
        self.tree.adopt_children(red);
        let children = self.tree.get(red).successors().collect_vec();
        for (symbol, child) in children {
            if !self.tree.is_red(child) {
                self.tree.make_blue(child, red, symbol);
                self.enqueue(FringeTransition::new(red, symbol));
            }
        }
    }

    fn promote(&mut self, blue: NodeId, via: FringeTransition) {
        let mut access = self.access.get(&via.source).cloned().unwrap_or_default();
        access.push(via.symbol);
        debug!(
            "{} {blue} reached by {:?}, {} red states",
            "promoting".green(),
            access,
            self.tree.red_count() + 1
        );
        self.access.insert(blue, access);
        self.tree.make_red(blue);
        self.stats.promotions += 1;
        self.expose(blue);
    }

    fn commit(&mut self, merge: Merge<Q, C>) {
        debug!(
            "{} {} into {} at depth {}, copying {} nodes",
            "merging".blue(),
            merge.blue(),
            merge.red(),
            merge.depth(),
            merge.copy_count()
        );
        let mut exposed = vec![];
        merge.apply(&mut self.tree, |source, symbol| {
            exposed.push(FringeTransition::new(source, symbol))
        });
        self.stats.merges += 1;
        for transition in exposed {
            self.enqueue(transition);
        }
    }

    /// Tries to fold `blue` into each of the red nodes, in the order in which they were promoted.
    /// Rejections caused by conflicting nodes are reported back from the attempts and recorded once
    /// the search is over, before the winning merge (if any) is committed.
    fn search(&mut self, blue: NodeId) -> Option<Merge<Q, C>> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let tree = &self.tree;
        let criterion = self.criterion;

        let attempt = |(position, red): (usize, &NodeId)| match try_merge(
            tree, *red, blue, criterion,
        ) {
            Ok(merge) => Some((position, merge)),
            Err(rejection) => {
                trace!("{:?}", rejection);
                // the receiver outlives the search, so this cannot fail
                let _ = sender.send((position, rejection.incompatible_pair(tree)));
                None
            }
        };

        let reds = tree.red_states();
        let found = match (self.parallel, self.deterministic) {
            (true, true) => reds.par_iter().enumerate().find_map_first(attempt),
            (true, false) => reds.par_iter().enumerate().find_map_any(attempt),
            (false, _) => reds.iter().enumerate().find_map(attempt),
        };
        drop(sender);

        // only the attempts a sequential search would have made are recorded
        let cutoff = match &found {
            Some((position, _)) if self.deterministic => *position,
            _ => usize::MAX,
        };
        for (_, pair) in receiver.try_iter().filter(|(p, _)| *p < cutoff) {
            self.stats.rejections += 1;
            if let Some((a, b)) = pair {
                self.stats.incompatibilities += self.tree.mark_incompatible(a, b);
            }
        }
        found.map(|(_, merge)| merge)
    }

    /// Takes the next transition from the worklist and deals with its target. Returns `None` once the
    /// worklist is exhausted.
    pub fn step(&mut self) -> Option<Step> {
        let transition = self.worklist.pop()?;
        let Some(blue) = transition
            .target(&self.tree)
            .filter(|&q| !self.tree.is_red(q))
        else {
            trace!("dropping stale {:?}", transition);
            self.stats.stale += 1;
            return Some(Step::Stale(transition));
        };

        if let MergeCriterion::Strong { min_depth } = self.criterion {
            if self.tree.red_count() < self.skip_below_size {
                self.promote(blue, transition);
                return Some(Step::Promoted(blue));
            }
            self.tree.adopt_children(blue);
            if self.tree.child_count(blue) < 2 || !self.tree.reaches_depth(blue, min_depth) {
                trace!("{blue} is too shallow to be merged");
                self.promote(blue, transition);
                return Some(Step::Promoted(blue));
            }
        }

        match self.search(blue) {
            Some(merge) => {
                let red = merge.red();
                self.commit(merge);
                Some(Step::Merged { red, blue })
            }
            None => {
                self.promote(blue, transition);
                Some(Step::Promoted(blue))
            }
        }
    }

    /// Processes the worklist until it is empty and returns the resulting tree, whose red nodes
    /// form the learned machine.
    pub fn run(mut self) -> PrefixTree<Q, C> {
        while self.step().is_some() {}
        info!(
            "{} with {} states, {} merges, {} rejected attempts, {} incompatibilities",
            "fringe exhausted".bold(),
            self.tree.red_count(),
            self.stats.merges,
            self.stats.rejections,
            self.stats.incompatibilities
        );
        self.tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Void;

    fn tree(samples: &[(Vec<Symbol>, Vec<char>)]) -> PrefixTree<Void, char> {
        let mut tree = PrefixTree::new(2);
        for (input, output) in samples {
            tree.insert_sample(input, output).unwrap();
        }
        tree
    }

    #[test]
    fn canonical_entries_are_ordered() {
        let entry = |access: Vec<Symbol>| CanonicalEntry {
            access,
            transition: FringeTransition::new(0, 0),
        };
        assert!(entry(vec![1]) < entry(vec![0, 0]));
        assert!(entry(vec![0, 1]) < entry(vec![1, 0]));
    }

    #[test_log::test]
    fn plain_fringe_collapses_everything() {
        let samples = [
            (vec![0], vec!['a']),
            (vec![1], vec!['b']),
            (vec![0, 0], vec!['a', 'a']),
        ];
        let mut fringe = Fringe::new(tree(&samples), &LearnerSettings::default());
        assert!(fringe.tree().is_red(0));
        assert_eq!(fringe.pending(), 2);
        assert_eq!(fringe.criterion(), MergeCriterion::Plain);

        assert_eq!(fringe.step(), Some(Step::Merged { red: 0, blue: 1 }));
        assert_eq!(fringe.step(), Some(Step::Merged { red: 0, blue: 2 }));
        assert_eq!(fringe.step(), None);

        let tree = fringe.run();
        assert_eq!(tree.red_states(), &[0]);
        assert_eq!(tree.successor(0, 0), Some(0));
        assert_eq!(tree.successor(0, 1), Some(0));
    }

    #[test_log::test]
    fn shallow_nodes_are_promoted() {
        let samples = [
            (vec![0], vec!['a']),
            (vec![1], vec!['b']),
            (vec![0, 0], vec!['a', 'a']),
        ];
        let settings = LearnerSettings::default().with_min_depth(3);
        let mut fringe = Fringe::new(tree(&samples), &settings);
        assert_eq!(fringe.step(), Some(Step::Promoted(1)));
        assert_eq!(fringe.step(), Some(Step::Promoted(2)));
        assert_eq!(fringe.step(), Some(Step::Promoted(3)));
        assert_eq!(fringe.step(), None);
        assert_eq!(fringe.stats().promotions, 3);
        assert_eq!(fringe.stats().merges, 0);
    }

    #[test_log::test]
    fn rejections_are_remembered() {
        let samples = [
            (vec![0, 1], vec!['a', 'c']),
            (vec![1, 0, 0], vec!['a', 'a', 'e']),
            (vec![1, 0, 1], vec!['a', 'a', 'd']),
        ];
        let (a, b, b0) = (1, 3, 4);
        let mut fringe = Fringe::new(tree(&samples), &LearnerSettings::default());

        // a emits c on 1 where the root emits a
        assert_eq!(fringe.step(), Some(Step::Promoted(a)));
        assert_eq!(fringe.stats().incompatibilities, 1);
        assert!(fringe.tree().is_incompatible(a, 0));

        // b cannot go into the root, as b0 would have to be merged with a
        assert_eq!(fringe.step(), Some(Step::Merged { red: a, blue: b }));
        assert_eq!(fringe.stats().rejections, 2);
        assert_eq!(fringe.stats().incompatibilities, 3);
        assert!(fringe.tree().is_incompatible(0, b));
        assert!(fringe.tree().is_incompatible(b0, a));
        assert!(fringe.tree().node(b0).unwrap().is_blue());

        let tree = fringe.run();
        assert_eq!(tree.red_states(), &[0, a, b0]);
        let mm = tree.to_automaton();
        for (input, output) in &samples {
            assert!(mm.is_consistent_with(input, output));
        }
    }

    #[test_log::test]
    fn processing_orders() {
        let samples = [(vec![0, 0], vec!['a', 'a']), (vec![1], vec!['b'])];
        let promoted = |order| {
            let settings = LearnerSettings::default()
                .with_min_depth(5)
                .with_order(order);
            Fringe::new(tree(&samples), &settings)
                .run()
                .red_states()
                .to_vec()
        };
        // nodes are created as root 0, "0" 1, "00" 2, "1" 3
        assert_eq!(promoted(ProcessingOrder::Fifo), vec![0, 1, 3, 2]);
        assert_eq!(promoted(ProcessingOrder::Lifo), vec![0, 3, 1, 2]);
        assert_eq!(promoted(ProcessingOrder::Canonical), vec![0, 1, 3, 2]);
    }

    #[test_log::test]
    fn parallel_search_agrees_with_sequential_search() {
        let samples = [
            (vec![0, 1], vec!['a', 'c']),
            (vec![1, 0, 0], vec!['a', 'a', 'e']),
            (vec![1, 0, 1], vec!['a', 'a', 'd']),
            (vec![1, 1, 1, 0], vec!['a', 'c', 'a', 'a']),
        ];
        let sequential = Fringe::new(tree(&samples), &LearnerSettings::default()).run();
        let parallel = Fringe::new(
            tree(&samples),
            &LearnerSettings::default().with_parallel(true),
        )
        .run();
        assert_eq!(sequential.to_automaton(), parallel.to_automaton());
    }
}
