use fastrand::Rng;
use itertools::Itertools;
use tracing::debug;

use crate::{
    automaton::{MealyMachine, MealyState},
    Symbol,
};

/// Generates a complete Mealy machine with `size` states over `alphabet_size` symbols. For each state
/// and symbol, the target is drawn uniformly from all states and the output uniformly from
/// `0..outputs`. State `0` is initial, depending on the draws some states may be unreachable.
pub fn generate_random_mealy(
    rng: &mut Rng,
    alphabet_size: usize,
    size: usize,
    outputs: usize,
) -> MealyMachine {
    assert!(size > 0 && outputs > 0);
    let states = (0..size)
        .map(|_| {
            let edges = (0..alphabet_size)
                .map(|_| Some((rng.usize(..size), Some(rng.usize(..outputs)))))
                .collect();
            MealyState::new(None, edges)
        })
        .collect();
    MealyMachine::from_parts(alphabet_size, 0, states)
}

/// Generates a random word over `alphabet_size` symbols, whose length is drawn uniformly from
/// `min_len..=max_len`.
pub fn generate_random_word(
    rng: &mut Rng,
    alphabet_size: usize,
    min_len: usize,
    max_len: usize,
) -> Vec<Symbol> {
    let length = rng.usize(min_len..=max_len);
    (0..length).map(|_| rng.usize(..alphabet_size)).collect()
}

/// Draws `number` random words as in [`generate_random_word`] and pairs each of them with the outputs
/// that `target` produces on it. Words on which `target` gets stuck are dropped.
pub fn generate_samples(
    rng: &mut Rng,
    target: &MealyMachine,
    number: usize,
    min_len: usize,
    max_len: usize,
) -> Vec<(Vec<Symbol>, Vec<usize>)> {
    let samples = (0..number)
        .map(|_| generate_random_word(rng, target.alphabet_size(), min_len, max_len))
        .unique()
        .filter_map(|word| {
            let output = target.transduce(&word)?;
            Some((word, output))
        })
        .collect_vec();
    debug!("generated {} samples", samples.len());
    samples
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_machines_are_complete() {
        let mut rng = Rng::with_seed(7);
        let mm = generate_random_mealy(&mut rng, 3, 5, 2);
        assert_eq!(mm.size(), 5);
        assert_eq!(mm.transitions().count(), 15);
        assert!(mm.transitions().all(|(_, _, _, c)| c.is_some_and(|c| *c < 2)));

        let samples = generate_samples(&mut rng, &mm, 20, 2, 4);
        assert!(!samples.is_empty());
        for (input, output) in samples {
            assert!((2..=4).contains(&input.len()));
            assert_eq!(input.len(), output.len());
            assert!(mm.is_consistent_with(&input, &output));
        }
    }

    #[test]
    fn seeded_generation_is_reproducible() {
        let draw = || generate_random_mealy(&mut Rng::with_seed(3), 2, 4, 3);
        assert_eq!(draw(), draw());
    }
}
