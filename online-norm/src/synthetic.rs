use crate::batch::FeatureBatch;
use anyhow::{anyhow, Result};
use rand::{
    distributions::Distribution,
    rngs::{SmallRng, StdRng},
    Rng, SeedableRng,
};
use statrs::distribution::Normal;

/// Draws batches whose channels follow fixed, independent normal distributions.
pub struct StationarySource {
    shape: (usize, usize, usize, usize),
    channels: Vec<Normal>,
    rng: SmallRng,
}

impl StationarySource {
    pub fn new(
        seed: &[u8; 32],
        shape: (usize, usize, usize, usize),
        means: &[f64],
        stds: &[f64],
    ) -> Result<Self> {
        let num_features = shape.1;
        if means.len() != num_features || stds.len() != num_features {
            return Err(anyhow!(
                "Expected {} channel means and stds, got {} and {}",
                num_features,
                means.len(),
                stds.len()
            ));
        }
        let channels = means
            .iter()
            .zip(stds)
            .map(|(&mean, &std)| {
                Normal::new(mean, std).map_err(|e| {
                    anyhow!("Invalid channel distribution N({}, {}): {}", mean, std, e)
                })
            })
            .collect::<Result<Vec<Normal>>>()?;

        Ok(Self {
            shape,
            channels,
            rng: SmallRng::from_seed(StdRng::from_seed(*seed).gen()),
        })
    }

    /// Zero mean, unit variance in every channel.
    pub fn standard(seed: &[u8; 32], shape: (usize, usize, usize, usize)) -> Result<Self> {
        let num_features = shape.1;
        Self::new(
            seed,
            shape,
            &vec![0.0; num_features],
            &vec![1.0; num_features],
        )
    }

    pub fn shape(&self) -> (usize, usize, usize, usize) {
        self.shape
    }

    pub fn sample(&mut self) -> FeatureBatch {
        let channels = &self.channels;
        let rng = &mut self.rng;
        FeatureBatch::from_shape_fn(self.shape, |(_, ch, _, _)| channels[ch].sample(&mut *rng))
    }
}
