use owo_colors::OwoColorize;
use tracing::{debug, info};

use crate::{
    automaton::MealyMachine,
    fringe::{Fringe, ProcessingOrder},
    merge::MergeCriterion,
    prefixtree::{PrefixTree, SampleError},
    Color, Symbol, Void,
};

/// Collects the knobs of [`StrongBlueFringeRpni`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LearnerSettings {
    /// Minimal depth up to which the subtrees of two nodes have to agree for them to be merged. A
    /// value of `0` gives the plain blue-fringe algorithm.
    pub min_depth: usize,
    /// As long as fewer states than this have been found, blue nodes are promoted without trying to
    /// merge them. Only used when `min_depth` is positive.
    pub skip_below_size: usize,
    /// If set, the first red state (in promotion order) that admits a merge is chosen, which makes
    /// results reproducible even if the search runs in parallel.
    pub deterministic: bool,
    /// Run the search for a red state that admits a merge on the rayon thread pool.
    pub parallel: bool,
    /// The order in which blue nodes are treated.
    pub order: ProcessingOrder,
}

impl Default for LearnerSettings {
    fn default() -> Self {
        Self {
            min_depth: 0,
            skip_below_size: 0,
            deterministic: true,
            parallel: false,
            order: ProcessingOrder::default(),
        }
    }
}

impl LearnerSettings {
    /// Sets the minimal merge depth.
    pub fn with_min_depth(self, min_depth: usize) -> Self {
        Self { min_depth, ..self }
    }

    /// Sets the number of states below which merges are not attempted.
    pub fn with_skip_below_size(self, skip_below_size: usize) -> Self {
        Self {
            skip_below_size,
            ..self
        }
    }

    /// Chooses between deterministic and arbitrary selection among successful merges.
    pub fn with_deterministic(self, deterministic: bool) -> Self {
        Self {
            deterministic,
            ..self
        }
    }

    /// Enables or disables the parallel search.
    pub fn with_parallel(self, parallel: bool) -> Self {
        Self { parallel, ..self }
    }

    /// Sets the processing order of the fringe.
    pub fn with_order(self, order: ProcessingOrder) -> Self {
        Self { order, ..self }
    }

    /// The merge criterion that corresponds to the minimal depth.
    pub fn criterion(&self) -> MergeCriterion {
        MergeCriterion::from_min_depth(self.min_depth)
    }
}

/// Passive learner for Mealy machines, based on the blue-fringe variant of RPNI with a strong merge
/// criterion. Samples are pairs of an input word and the outputs it produces, where the outputs may
/// be shorter than the input, in which case they belong to the last transitions.
///
/// ```
/// use mealy_rpni::prelude::*;
///
/// let mut learner = StrongBlueFringeRpni::new(2, 0, 0);
/// learner.add_sample(vec![0], vec!['a']);
/// learner.add_sample(vec![1], vec!['b']);
/// learner.add_sample(vec![0, 0], vec!['a', 'a']);
///
/// let mm = learner.compute_model().unwrap();
/// assert_eq!(mm.transduce(&[1, 0, 1]), Some(vec!['b', 'a', 'b']));
/// ```
#[derive(Debug, Clone)]
pub struct StrongBlueFringeRpni<C = usize> {
    alphabet_size: usize,
    settings: LearnerSettings,
    samples: Vec<(Vec<Symbol>, Vec<C>)>,
}

impl<C: Color> StrongBlueFringeRpni<C> {
    /// Creates a learner for inputs over `alphabet_size` symbols with the given minimal merge depth and
    /// skip threshold. The remaining settings take their default values.
    pub fn new(alphabet_size: usize, min_depth: usize, skip_below_size: usize) -> Self {
        Self::with_settings(
            alphabet_size,
            LearnerSettings::default()
                .with_min_depth(min_depth)
                .with_skip_below_size(skip_below_size),
        )
    }

    /// Creates a learner with the given settings.
    pub fn with_settings(alphabet_size: usize, settings: LearnerSettings) -> Self {
        Self {
            alphabet_size,
            settings,
            samples: vec![],
        }
    }

    /// Changes the minimal merge depth for subsequent runs.
    pub fn set_min_depth(&mut self, min_depth: usize) {
        self.settings.min_depth = min_depth;
    }

    /// The settings used by [`Self::compute_model`].
    pub fn settings(&self) -> &LearnerSettings {
        &self.settings
    }

    /// Number of input symbols.
    pub fn alphabet_size(&self) -> usize {
        self.alphabet_size
    }

    /// Stores a sample, it is only checked when a model is computed.
    pub fn add_sample(&mut self, input: Vec<Symbol>, output: Vec<C>) {
        self.samples.push((input, output));
    }

    /// Stores all given samples.
    pub fn add_samples<I: IntoIterator<Item = (Vec<Symbol>, Vec<C>)>>(&mut self, samples: I) {
        self.samples.extend(samples);
    }

    /// The samples stored so far.
    pub fn samples(&self) -> &[(Vec<Symbol>, Vec<C>)] {
        &self.samples
    }

    /// Inserts all samples into a fresh prefix tree.
    pub fn build_tree(&self) -> Result<PrefixTree<Void, C>, SampleError> {
        let mut tree = PrefixTree::new(self.alphabet_size);
        for (input, output) in &self.samples {
            tree.insert_sample(input, output)?;
        }
        debug!(
            "built prefix tree with {} nodes from {} samples",
            tree.len(),
            self.samples.len()
        );
        Ok(tree)
    }

    /// Learns a machine using the stored settings.
    pub fn compute_model(&self) -> Result<MealyMachine<C>, SampleError> {
        Ok(learn(self.build_tree()?, &self.settings))
    }

    /// Learns a machine with the given minimal merge depth, skip threshold and selection mode. The
    /// remaining settings are taken from the stored ones.
    pub fn compute_model_with(
        &self,
        min_depth: usize,
        skip_below_size: usize,
        deterministic: bool,
    ) -> Result<MealyMachine<C>, SampleError> {
        let settings = self
            .settings
            .with_min_depth(min_depth)
            .with_skip_below_size(skip_below_size)
            .with_deterministic(deterministic);
        Ok(learn(self.build_tree()?, &settings))
    }
}

fn learn<C: Color>(tree: PrefixTree<Void, C>, settings: &LearnerSettings) -> MealyMachine<C> {
    let start = std::time::Instant::now();
    let mm = Fringe::new(tree, settings).run().to_automaton();
    info!(
        "{} {} states with {:?} in {}ms",
        "learned".bold(),
        mm.size(),
        settings.criterion(),
        start.elapsed().as_millis()
    );
    mm
}

/// Learns a Mealy machine over `alphabet_size` symbols from the given samples in one go, see
/// [`StrongBlueFringeRpni`].
pub fn strong_mealy_rpni<C, I>(
    alphabet_size: usize,
    samples: I,
    settings: LearnerSettings,
) -> Result<MealyMachine<C>, SampleError>
where
    C: Color,
    I: IntoIterator<Item = (Vec<Symbol>, Vec<C>)>,
{
    let mut learner = StrongBlueFringeRpni::with_settings(alphabet_size, settings);
    learner.add_samples(samples);
    learner.compute_model()
}
