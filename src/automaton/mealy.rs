use std::{collections::VecDeque, fmt::Display};

use bit_set::BitSet;
use itertools::Itertools;

use crate::{math::Bijection, Color, Symbol, Void};

/// States of a [`MealyMachine`] are identified by their position.
pub type StateIndex = usize;

/// A single state of a [`MealyMachine`], consisting of an optional state color and one (possibly missing)
/// outgoing transition per symbol. The output of a transition may be unknown, which happens for
/// transitions that were only observed without output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MealyState<Q, C> {
    color: Option<Q>,
    edges: Vec<Option<(StateIndex, Option<C>)>>,
}

impl<Q, C> MealyState<Q, C> {
    /// Creates a state with the given color, `edges[a]` is the transition on symbol `a`.
    pub fn new(color: Option<Q>, edges: Vec<Option<(StateIndex, Option<C>)>>) -> Self {
        Self { color, edges }
    }

    /// The color of the state, if it has one.
    pub fn color(&self) -> Option<&Q> {
        self.color.as_ref()
    }
}

/// A Mealy machine is a transition system where each transition has an output. Thus, the output
/// of running a Mealy machine on a word produces a sequence of outputs, one for each transition
/// that is taken. Note that since the empty word does not take any transitions, it does not
/// produce any output. For a word of length `n`, there are `n` outputs.
///
/// Machines produced by learning may be partial, meaning some transitions or some outputs are not
/// defined. States may carry a color, which is only used when learning Moore-style machines and
/// is [`Void`] otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MealyMachine<C = usize, Q = Void> {
    alphabet_size: usize,
    initial: StateIndex,
    states: Vec<MealyState<Q, C>>,
}

impl<C: Color, Q: Color> MealyMachine<C, Q> {
    /// Assembles a machine from its states. All edges must point to existing states and every
    /// state needs exactly `alphabet_size` edge slots.
    pub fn from_parts(
        alphabet_size: usize,
        initial: StateIndex,
        states: Vec<MealyState<Q, C>>,
    ) -> Self {
        debug_assert!(states.iter().all(|q| q.edges.len() == alphabet_size));
        debug_assert!(states
            .iter()
            .flat_map(|q| q.edges.iter().flatten())
            .all(|(p, _)| *p < states.len()));
        Self {
            alphabet_size,
            initial,
            states,
        }
    }

    /// Builds a complete machine from a list of `(source, symbol, target, output)` transitions.
    /// Mostly useful for writing down small machines by hand.
    pub fn from_transitions<I>(alphabet_size: usize, size: usize, transitions: I) -> Self
    where
        I: IntoIterator<Item = (StateIndex, Symbol, StateIndex, C)>,
    {
        let mut states = (0..size)
            .map(|_| MealyState::new(None, vec![None; alphabet_size]))
            .collect_vec();
        for (source, symbol, target, output) in transitions {
            states[source].edges[symbol] = Some((target, Some(output)));
        }
        Self::from_parts(alphabet_size, 0, states)
    }

    /// Number of states.
    pub fn size(&self) -> usize {
        self.states.len()
    }

    /// The initial state.
    pub fn initial(&self) -> StateIndex {
        self.initial
    }

    /// Number of input symbols.
    pub fn alphabet_size(&self) -> usize {
        self.alphabet_size
    }

    /// Iterates over the indices of all states.
    pub fn state_indices(&self) -> impl Iterator<Item = StateIndex> {
        0..self.states.len()
    }

    /// The color of `state`.
    pub fn state_color(&self, state: StateIndex) -> Option<&Q> {
        self.states.get(state)?.color()
    }

    /// The transition from `state` on `symbol`, consisting of the target and the output (if known).
    pub fn transition(&self, state: StateIndex, symbol: Symbol) -> Option<(StateIndex, Option<&C>)> {
        self.states
            .get(state)?
            .edges
            .get(symbol)?
            .as_ref()
            .map(|(p, c)| (*p, c.as_ref()))
    }

    /// The state reached from `state` on `symbol`.
    pub fn successor(&self, state: StateIndex, symbol: Symbol) -> Option<StateIndex> {
        self.transition(state, symbol).map(|(p, _)| p)
    }

    /// The output of the transition from `state` on `symbol`.
    pub fn output(&self, state: StateIndex, symbol: Symbol) -> Option<&C> {
        self.transition(state, symbol).and_then(|(_, c)| c)
    }

    /// Iterates over all transitions as `(source, symbol, target, output)`.
    pub fn transitions(
        &self,
    ) -> impl Iterator<Item = (StateIndex, Symbol, StateIndex, Option<&C>)> + '_ {
        self.state_indices().flat_map(move |q| {
            (0..self.alphabet_size)
                .filter_map(move |a| self.transition(q, a).map(|(p, c)| (q, a, p, c)))
        })
    }

    /// Runs `word` from the initial state and returns the state that is reached, or `None` if the
    /// run gets stuck on a missing transition.
    pub fn reached_state(&self, word: &[Symbol]) -> Option<StateIndex> {
        word.iter()
            .try_fold(self.initial, |q, &a| self.successor(q, a))
    }

    /// The color of the state that is reached by `word`.
    pub fn reached_state_color(&self, word: &[Symbol]) -> Option<&Q> {
        self.state_color(self.reached_state(word)?)
    }

    /// Runs `word` and collects the outputs of all transitions that are taken. Unknown outputs are
    /// `None`, a run that gets stuck yields `None` overall.
    pub fn outputs(&self, word: &[Symbol]) -> Option<Vec<Option<&C>>> {
        let mut q = self.initial;
        let mut out = Vec::with_capacity(word.len());
        for &a in word {
            let (p, c) = self.transition(q, a)?;
            out.push(c);
            q = p;
        }
        Some(out)
    }

    /// Translates `word` into the sequence of outputs it produces, if the run exists and every
    /// output along it is known.
    pub fn transduce(&self, word: &[Symbol]) -> Option<Vec<C>> {
        self.outputs(word)?
            .into_iter()
            .map(|c| c.cloned())
            .collect()
    }

    /// The output of the last transition taken on `word`. This is `None` for the empty word.
    pub fn last_output(&self, word: &[Symbol]) -> Option<C> {
        let (last, prefix) = word.split_last()?;
        self.output(self.reached_state(prefix)?, *last).cloned()
    }

    /// Checks whether the machine reproduces the given observation, where `output` annotates the
    /// last `output.len()` transitions taken on `input`.
    pub fn is_consistent_with(&self, input: &[Symbol], output: &[C]) -> bool {
        if output.len() > input.len() {
            return false;
        }
        let Some(produced) = self.outputs(input) else {
            return false;
        };
        produced[input.len() - output.len()..]
            .iter()
            .zip(output)
            .all(|(p, o)| *p == Some(o))
    }

    /// Computes for every reachable state the length-lexicographically minimal word that reaches it.
    /// The result is ordered by these words.
    pub fn minimal_representatives(&self) -> Vec<(Vec<Symbol>, StateIndex)> {
        let mut seen = BitSet::with_capacity(self.size());
        let mut queue = VecDeque::from([(vec![], self.initial)]);
        let mut out = vec![];
        seen.insert(self.initial);
        while let Some((word, q)) = queue.pop_front() {
            for a in 0..self.alphabet_size {
                if let Some(p) = self.successor(q, a) {
                    if seen.insert(p) {
                        let mut next = word.clone();
                        next.push(a);
                        queue.push_back((next, p));
                    }
                }
            }
            out.push((word, q));
        }
        out
    }

    /// Attempts to construct a word that separates the two machines, meaning it produces different
    /// outputs (or state colors) when run in both machines, or can be run in only one of them. If no
    /// such word exists, the function returns `None`. The witness is a shortest one.
    pub fn witness_inequivalence(&self, other: &MealyMachine<C, Q>) -> Option<Vec<Symbol>> {
        let mut seen = crate::math::Set::default();
        let mut queue = VecDeque::from([(vec![], self.initial, other.initial)]);
        seen.insert((self.initial, other.initial));

        while let Some((word, l, r)) = queue.pop_front() {
            if self.state_color(l) != other.state_color(r) {
                return Some(word);
            }
            for a in 0..self.alphabet_size.max(other.alphabet_size) {
                let mut next = word.clone();
                next.push(a);
                match (self.transition(l, a), other.transition(r, a)) {
                    (None, None) => {}
                    (Some((p, c)), Some((s, d))) if c == d => {
                        if seen.insert((p, s)) {
                            queue.push_back((next, p, s));
                        }
                    }
                    _ => return Some(next),
                }
            }
        }
        None
    }

    /// Returns true if and only if both machines are bisimilar, meaning for all possible
    /// inputs, they will produce the same output.
    pub fn bisimilar(&self, other: &MealyMachine<C, Q>) -> bool {
        self.witness_inequivalence(other).is_none()
    }

    /// Decides whether the reachable parts of both machines are identical up to renaming of states,
    /// in which case the renaming is returned.
    pub fn isomorphism(&self, other: &MealyMachine<C, Q>) -> Option<Bijection<StateIndex, StateIndex>> {
        let mut mapping = Bijection::new();
        let mut queue = VecDeque::from([(self.initial, other.initial)]);
        mapping.insert(self.initial, other.initial);

        while let Some((l, r)) = queue.pop_front() {
            if self.state_color(l) != other.state_color(r) {
                return None;
            }
            for a in 0..self.alphabet_size.max(other.alphabet_size) {
                match (self.transition(l, a), other.transition(r, a)) {
                    (None, None) => {}
                    (Some((p, c)), Some((s, d))) if c == d => {
                        match (mapping.get_by_left(&p), mapping.get_by_right(&s)) {
                            (None, None) => {
                                mapping.insert(p, s);
                                queue.push_back((p, s));
                            }
                            (Some(&x), Some(&y)) if x == s && y == p => {}
                            _ => return None,
                        }
                    }
                    _ => return None,
                }
            }
        }
        Some(mapping)
    }

    /// Returns true if [`Self::isomorphism`] finds a renaming.
    pub fn is_isomorphic(&self, other: &MealyMachine<C, Q>) -> bool {
        self.isomorphism(other).is_some()
    }
}

impl<C: Color, Q: Color> Display for MealyMachine<C, Q> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut builder = tabled::builder::Builder::default();
        builder.push_record(
            std::iter::once("State".to_string()).chain((0..self.alphabet_size).map(|a| a.to_string())),
        );
        for q in self.state_indices() {
            let mut name = if q == self.initial {
                format!("-> {q}")
            } else {
                q.to_string()
            };
            if let Some(color) = self.state_color(q) {
                name.push_str(&format!(" [{color:?}]"));
            }
            let row = std::iter::once(name).chain((0..self.alphabet_size).map(|a| {
                match self.transition(q, a) {
                    Some((p, Some(c))) => format!("{p}|{c:?}"),
                    Some((p, None)) => format!("{p}|?"),
                    None => "-".to_string(),
                }
            }));
            builder.push_record(row);
        }
        write!(
            f,
            "{}",
            builder.build().with(tabled::settings::Style::rounded())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Counts the number of 1s modulo 3 and outputs the new count, a 0 outputs 0. The output
    /// when wrapping around from 2 back to 0 is configurable.
    fn counter(wrap: usize) -> MealyMachine {
        MealyMachine::from_transitions(
            2,
            3,
            [
                (0, 0, 0, 0),
                (0, 1, 1, 1),
                (1, 0, 1, 0),
                (1, 1, 2, 2),
                (2, 0, 2, 0),
                (2, 1, 0, wrap),
            ],
        )
    }

    #[test]
    fn running_words() {
        let mm = counter(0);
        assert_eq!(mm.size(), 3);
        assert_eq!(mm.reached_state(&[0, 1]), Some(1));
        assert_eq!(mm.transduce(&[0, 1, 1]), Some(vec![0, 1, 2]));
        assert_eq!(mm.last_output(&[0, 1]), Some(1));
        assert_eq!(mm.last_output(&[]), None);
        assert!(mm.is_consistent_with(&[0, 1, 1], &[0, 1, 2]));
        assert!(mm.is_consistent_with(&[0, 1, 1], &[2]));
        assert!(!mm.is_consistent_with(&[0, 1, 1], &[1]));
        assert!(!mm.is_consistent_with(&[0], &[0, 0]));
        assert_eq!(mm.transitions().count(), 6);
        assert_eq!(
            mm.minimal_representatives(),
            vec![(vec![], 0), (vec![1], 1), (vec![1, 1], 2)]
        );
    }

    #[test]
    fn partial_machines() {
        let mm: MealyMachine<char> = MealyMachine::from_parts(
            2,
            0,
            vec![MealyState::new(
                None,
                vec![Some((0, Some('a'))), Some((0, None))],
            )],
        );
        assert_eq!(mm.outputs(&[0, 1]), Some(vec![Some(&'a'), None]));
        assert_eq!(mm.transduce(&[0, 1]), None);
        assert!(mm.is_consistent_with(&[1, 0], &['a']));
        assert!(!mm.is_consistent_with(&[0, 1], &['a', 'a']));
        assert!(mm.to_string().contains("0|?"));
    }

    #[test]
    fn mealy_equivalence() {
        let mm1 = counter(0);
        let mm2 = counter(1);
        assert_eq!(mm1.witness_inequivalence(&mm2), Some(vec![1, 1, 1]));
        assert!(!mm1.bisimilar(&mm2));
        assert!(!mm1.is_isomorphic(&mm2));
        assert!(mm1.is_isomorphic(&mm1));

        // the same counter with states renamed by i -> i + 1 mod 3
        let renamed = MealyMachine::from_parts(
            2,
            1,
            vec![
                MealyState::new(None, vec![Some((0, Some(0))), Some((1, Some(0)))]),
                MealyState::new(None, vec![Some((1, Some(0))), Some((2, Some(1)))]),
                MealyState::new(None, vec![Some((2, Some(0))), Some((0, Some(2)))]),
            ],
        );
        let iso = mm1.isomorphism(&renamed).unwrap();
        assert_eq!(iso.get_by_left(&0), Some(&1));
        assert_eq!(iso.get_by_left(&2), Some(&0));

        // counting modulo 6 gives the same outputs with twice the states
        let unrolled = MealyMachine::from_transitions(
            2,
            6,
            (0..6).flat_map(|i| [(i, 0, i, 0), (i, 1, (i + 1) % 6, (i + 1) % 3)]),
        );
        assert!(mm1.bisimilar(&unrolled));
        assert!(!mm1.is_isomorphic(&unrolled));
    }
}
