/// Type alias for sets, we use this to hide which type of `HashSet` we are actually using.
pub type Set<S> = fxhash::FxHashSet<S>;
/// Type alias for maps, we use this to hide which type of `HashMap` we are actually using.
pub type Map<K, V> = fxhash::FxHashMap<K, V>;

/// Represents a bijective mapping between `L` and `R`, that is a mapping which associates
/// each `L` with precisely one `R` and vice versa.
pub type Bijection<L, R> = bimap::BiBTreeMap<L, R>;

/// Orders two words length-lexicographically, i.e. shorter words come first and words of the
/// same length are compared lexicographically.
pub fn length_lexicographic<S: Ord>(left: &[S], right: &[S]) -> std::cmp::Ordering {
    left.len()
        .cmp(&right.len())
        .then_with(|| left.iter().cmp(right.iter()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_lexicographic_ordering() {
        let mut words = vec![vec![2, 0], vec![0, 2], vec![0, 0, 0], vec![1]];
        words.sort_by(|a, b| length_lexicographic(a, b));
        assert_eq!(words, vec![vec![1], vec![0, 2], vec![2, 0], vec![0, 0, 0]]);
    }
}
