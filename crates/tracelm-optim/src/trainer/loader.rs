//! Datasets and minibatching.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::OptimError;

/// Parallel lists of inputs and the side information a guide needs to judge
/// the output for each input (expected answers, rubrics, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset<I, T> {
    pub inputs: Vec<I>,
    pub infos: Vec<T>,
}

impl<I, T> Dataset<I, T> {
    pub fn new(inputs: Vec<I>, infos: Vec<T>) -> Result<Self, OptimError> {
        if inputs.len() != infos.len() {
            return Err(OptimError::Config(format!(
                "dataset has {} inputs but {} infos",
                inputs.len(),
                infos.len()
            )));
        }
        Ok(Dataset { inputs, infos })
    }

    pub fn len(&self) -> usize {
        self.inputs.len().min(self.infos.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<(&I, &T)> {
        Some((self.inputs.get(index)?, self.infos.get(index)?))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&I, &T)> + '_ {
        self.inputs.iter().zip(self.infos.iter())
    }
}

/// Splits a dataset into batches, optionally reshuffled every epoch.
///
/// With a seed the order of epoch `e` is a deterministic permutation drawn
/// from `ChaCha8Rng::seed_from_u64(seed + e)`.
#[derive(Debug, Clone, Copy)]
pub struct DataLoader<'a, I, T> {
    dataset: &'a Dataset<I, T>,
    batch_size: usize,
    seed: Option<u64>,
}

impl<'a, I, T> DataLoader<'a, I, T> {
    /// A batch size of 0 is treated as 1.
    pub fn new(dataset: &'a Dataset<I, T>, batch_size: usize, seed: Option<u64>) -> Self {
        DataLoader {
            dataset,
            batch_size: batch_size.max(1),
            seed,
        }
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Dataset indices in the order epoch `epoch` visits them.
    pub fn order(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if let Some(seed) = self.seed {
            let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        order
    }

    /// The batches of epoch `epoch`. The last batch may be short.
    pub fn batches(&self, epoch: usize) -> Vec<Vec<(&'a I, &'a T)>> {
        let dataset = self.dataset;
        self.order(epoch)
            .chunks(self.batch_size)
            .map(|chunk| chunk.iter().filter_map(|&i| dataset.get(i)).collect())
            .collect()
    }
}
