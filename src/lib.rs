//! Passive learning of Mealy machines with the strong blue-fringe algorithm.
//!
//! A Mealy machine is a deterministic transition system where every transition emits an output. Given a finite
//! collection of observed input/output traces, this crate builds a prefix tree from the traces and then greedily
//! folds states of that tree into each other, until every state reachable from the root is either a canonical
//! (red) state or has been merged into one. The red states then form the learned machine.
//!
//! The crate distinguishes between a plain and a strong merge criterion. The plain criterion is the classic
//! blue-fringe variant of RPNI, which accepts a merge as soon as the two involved subtrees do not contradict
//! each other. The strong criterion additionally requires that the subtrees agree up to a minimum depth, which
//! keeps states apart that only look compatible because too little is known about them.
//!
//! The most important types are
//! - [`prefixtree::PrefixTree`], the arena of nodes that the learner operates on,
//! - [`merge::Merge`], a single transactional merge attempt, which can be committed into the tree,
//! - [`fringe::Fringe`], which schedules promotions and merges of the blue frontier,
//! - [`passive::StrongBlueFringeRpni`], the learner that ties everything together and produces a
//!   [`automaton::MealyMachine`].
//!
//! Symbols are assumed to be dense integers in the range `0..alphabet_size`, mapping some concrete alphabet to
//! such indices is left to the user of the crate.
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

/// The prelude is supposed to make using this package easier. Including everything, i.e.
/// `use mealy_rpni::prelude::*;` should be enough to use the package.
pub mod prelude {
    pub use super::{
        automaton::{MealyMachine, MealyState, StateIndex},
        fringe::{Fringe, FringeStats, FringeTransition, ProcessingOrder, Step},
        math,
        merge::{try_merge, Merge, MergeCriterion, RejectReason, Rejection},
        passive::{strong_mealy_rpni, LearnerSettings, StrongBlueFringeRpni},
        prefixtree::{Node, NodeColor, NodeId, PrefixTree, SampleError, TreeError},
        Color, Symbol, Void,
    };
}

/// This module contains some definitions of mathematical objects which are used throughout the crate and
/// do not really fit to the top level.
pub mod math;

/// Defines the prefix tree that stores the sample and on which all merges operate.
pub mod prefixtree;

/// Implements merging of a blue state into a red state, with plain and strong acceptance.
pub mod merge;

/// Red/blue coloring and the worklist that decides which state is treated next.
pub mod fringe;

/// Contains the learned automata, i.e. Mealy machines.
pub mod automaton;

/// Contains the passive learners, most notably the strong blue-fringe RPNI for Mealy machines.
pub mod passive;

/// Implements the generation of random Mealy machines and samples drawn from them.
#[cfg(feature = "random")]
pub mod random;

use std::{fmt::Debug, hash::Hash};

/// Symbols are dense indices into the input alphabet, i.e. values in `0..alphabet_size`.
pub type Symbol = usize;

/// A color is simply a type that can be used to color states or transitions. In the context of learning
/// Mealy machines, the colors on transitions are the outputs. As merge attempts may be explored on a
/// worker pool, colors need to be shareable between threads.
pub trait Color: Clone + Eq + Hash + Debug + Send + Sync {}

impl<T: Clone + Eq + Hash + Debug + Send + Sync> Color for T {}

/// Represents the absence of a color. This is used as the state color for Mealy machines, whose
/// states do not carry any output.
#[derive(Hash, Eq, PartialEq, PartialOrd, Ord, Clone, Copy, Default)]
pub struct Void;

impl Debug for Void {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#")
    }
}
