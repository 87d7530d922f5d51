//! Common test utilities for the denoising integration tests

#![allow(dead_code)]

use asl_tgv::TimeStack;
use ndarray::{Array, Array3, Array4};
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Smooth ground-truth volume: a slow in-plane oscillation on a z ramp.
pub fn smooth_volume(n: usize) -> Array3<f64> {
    Array3::from_shape_fn((n, n, n), |(i, j, k)| {
        500.0 + 200.0 * (i as f64 / 3.0).sin() * (j as f64 / 4.0).cos() + 10.0 * k as f64
    })
}

/// `repeats` noisy copies of `clean * gain`, stacked along the last axis.
pub fn noisy_repeats(clean: &Array3<f64>, gain: f64, repeats: usize, sigma: f64, rng: &mut StdRng) -> Array4<f64> {
    let (nx, ny, nz) = clean.dim();
    let base = Array4::from_shape_fn((nx, ny, nz, repeats), |(i, j, k, _)| gain * clean[[i, j, k]]);
    let noise = Normal::new(0.0, sigma).unwrap();
    base + Array::random_using((nx, ny, nz, repeats), noise, rng)
}

/// Control series and a label series at 98% of the control signal.
pub fn synthetic_pair(n: usize, repeats: usize, sigma: f64, seed: u64) -> (Array3<f64>, TimeStack, TimeStack) {
    let mut rng = StdRng::seed_from_u64(seed);
    let clean = smooth_volume(n);
    let control = noisy_repeats(&clean, 1.0, repeats, sigma, &mut rng);
    let label = noisy_repeats(&clean, 0.98, repeats, sigma, &mut rng);
    (
        clean,
        TimeStack::new(control).unwrap(),
        TimeStack::new(label).unwrap(),
    )
}

/// Root-mean-square difference between two volumes.
pub fn rmse(a: &Array3<f64>, b: &Array3<f64>) -> f64 {
    let sum_sq: f64 = a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum();
    (sum_sq / a.len() as f64).sqrt()
}
