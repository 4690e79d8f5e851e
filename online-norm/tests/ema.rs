use approx::assert_relative_eq;
use ndarray::{array, Array2};
use online_norm::ema::{ema_over_batch, DecayKernel};

/// Feeds `batches` one sample at a time through `y = ρ·y + (1-ρ)·x`.
fn sequential_ema(seed: &[f64], batches: &[Array2<f64>], rate: f64) -> Vec<Array2<f64>> {
    let mut y = seed.to_vec();
    batches
        .iter()
        .map(|batch| {
            let mut fresh = Array2::zeros(batch.raw_dim());
            for (i, row) in batch.outer_iter().enumerate() {
                for (ch, &x) in row.iter().enumerate() {
                    y[ch] = rate * y[ch] + (1.0 - rate) * x;
                    fresh[[i, ch]] = y[ch];
                }
            }
            fresh
        })
        .collect()
}

fn pseudo_random(b: usize, c: usize, salt: f64) -> Array2<f64> {
    Array2::from_shape_fn((b, c), |(i, ch)| {
        ((i as f64 + 1.0) * 12.9898 + (ch as f64 + 1.0) * 78.233 + salt).sin() * 3.0
    })
}

#[test]
fn test_decay_kernel_powers() {
    let kernel = DecayKernel::new(0.5, 4);
    assert_eq!(kernel.powers(), &array![0.125, 0.25, 0.5, 1.0]);
    assert_relative_eq!(kernel.batch_power(), 0.0625);
    assert_eq!(kernel.batch_size(), 4);
}

#[test]
fn test_ema_matches_sequential_over_several_batches() {
    for &(b, c, rate) in &[(1, 3, 0.9), (4, 2, 0.9), (5, 1, 0.5), (8, 3, 0.999)] {
        let kernel = DecayKernel::new(rate, b);
        let batches = (0..5)
            .map(|k| pseudo_random(b, c, k as f64))
            .collect::<Vec<_>>();
        let expected = sequential_ema(&vec![0.0; c], &batches, rate);

        let mut prev = Array2::<f64>::zeros((b, c));
        let mut stream = Array2::<f64>::zeros((b, c));
        let mut last_fresh_row = vec![0.0; c];
        for (batch, expected) in batches.iter().zip(&expected) {
            let trajectory = ema_over_batch(&prev, batch, &stream, &kernel);
            for (&got, &want) in trajectory.fresh.iter().zip(expected.iter()) {
                assert_relative_eq!(got, want, epsilon = 1e-12, max_relative = 1e-10);
            }
            // stale[0] carries the previous call's last fresh value
            for ch in 0..c {
                assert_relative_eq!(trajectory.stale[[0, ch]], last_fresh_row[ch], epsilon = 1e-12);
            }
            for i in 1..b {
                for ch in 0..c {
                    assert_eq!(trajectory.stale[[i, ch]], trajectory.fresh[[i - 1, ch]]);
                }
            }
            last_fresh_row = trajectory.fresh.row(b - 1).to_vec();
            prev = batch.clone();
            stream = trajectory.fresh;
        }
    }
}

#[test]
fn test_ema_from_steady_state_seed() {
    // history already at 1 on every position: a batch of ones keeps it there
    let kernel = DecayKernel::new(0.9, 4);
    let ones = Array2::<f64>::ones((4, 2));
    let trajectory = ema_over_batch(&ones, &ones, &ones, &kernel);
    for &value in trajectory.fresh.iter().chain(trajectory.stale.iter()) {
        assert_relative_eq!(value, 1.0, epsilon = 1e-12);
    }
}

#[test]
fn test_ema_steady_seed_equals_sequential_seed() {
    // seeding with a steady history of s is the same as starting the loop at s
    let (b, c, rate) = (6, 2, 0.8);
    let kernel = DecayKernel::new(rate, b);
    let seed = Array2::<f64>::from_elem((b, c), 1.0);
    let batch = pseudo_random(b, c, 0.25);
    let trajectory = ema_over_batch(&seed, &batch, &seed, &kernel);
    let expected = sequential_ema(&vec![1.0; c], &[batch], rate);
    for (&got, &want) in trajectory.fresh.iter().zip(expected[0].iter()) {
        assert_relative_eq!(got, want, epsilon = 1e-12);
    }
}
