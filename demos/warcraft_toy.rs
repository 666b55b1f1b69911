//! Toy Warcraft-style training loop.
//!
//! Terrain grids with a few cost levels are observed through noisy features. A two-parameter
//! affine map `w = max(a·x + b, 0)` is trained end to end through the shortest-path
//! oracle with the chosen strategy:
//!
//! ```text
//! RUST_LOG=combdiff=debug cargo run --example warcraft_toy -- fenchel_young
//! ```

use combdiff::{
    hamming_grad, hamming_loss, make_estimator, normalized_regret, EstimatorConfig,
    EstimatorKind, GroundTruth, ShortestPath,
};
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use tracing::info;
use tracing_subscriber::EnvFilter;

const TERRAIN: [f64; 5] = [0.8, 1.2, 5.3, 7.7, 9.2];
const SIDE: usize = 8;
const EXAMPLES: usize = 32;
const EPOCHS: usize = 15;
const LEARNING_RATE: f64 = 0.05;

const CONFIG: &str = r#"
neighbourhood = "8-grid"
lambda = 10.0
sigma = 0.5
num_samples = 8
nb_samples = 4
mu = 0.1
"#;

struct Example {
    features: Array2<f64>,
    weights: Array2<f64>,
    path: Array2<f64>,
}

fn make_data(rng: &mut ChaCha8Rng, oracle: &ShortestPath) -> combdiff::Result<Vec<Example>> {
    let noise = Normal::new(0.0, 1.0).map_err(|e| combdiff::Error::Config(e.to_string()))?;
    (0..EXAMPLES)
        .map(|_| {
            let weights = Array2::from_shape_fn((SIDE, SIDE), |_| {
                TERRAIN[rng.random_range(0..TERRAIN.len())]
            });
            let features = weights.mapv(|w| w + noise.sample(&mut *rng));
            let path = oracle.solve(weights.view())?;
            Ok(Example {
                features,
                weights,
                path,
            })
        })
        .collect()
}

fn predict(features: &Array2<f64>, a: f64, b: f64) -> Array2<f64> {
    features.mapv(|x| (a * x + b).max(0.0))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let kind: EstimatorKind = std::env::args()
        .nth(1)
        .as_deref()
        .unwrap_or("blackbox")
        .parse()?;
    let config = EstimatorConfig::from_toml(CONFIG)?;
    let estimator = make_estimator(kind, &config)?;
    let oracle = ShortestPath::new(config.neighbourhood);

    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let data = make_data(&mut rng, &oracle)?;
    let (mut a, mut b) = (0.2, 1.0);

    for epoch in 0..EPOCHS {
        let (mut grad_a, mut grad_b) = (0.0, 0.0);
        for ex in &data {
            let w = predict(&ex.features, a, b);
            let truth = GroundTruth::new(ex.path.view(), ex.weights.view());
            let fwd = estimator.forward(w.view(), Some(truth), &mut rng)?;
            let upstream = hamming_grad(fwd.output().view(), ex.path.view())?;
            let g = estimator.backward(&fwd, upstream.view())?;
            // Chain rule through the affine map; the clamp passes gradients where w > 0.
            for ((gi, xi), wi) in g.iter().zip(ex.features.iter()).zip(w.iter()) {
                if *wi > 0.0 {
                    grad_a += gi * xi;
                    grad_b += gi;
                }
            }
        }
        a -= LEARNING_RATE * grad_a / data.len() as f64;
        b -= LEARNING_RATE * grad_b / data.len() as f64;

        let (mut regret, mut hamming) = (0.0, 0.0);
        for ex in &data {
            let pred = oracle.solve(predict(&ex.features, a, b).view())?;
            regret += normalized_regret(pred.view(), ex.path.view(), ex.weights.view())?;
            hamming += hamming_loss(pred.view(), ex.path.view())?;
        }
        let count = data.len() as f64;
        info!(
            strategy = %kind,
            epoch,
            a,
            b,
            regret = regret / count,
            hamming = hamming / count,
            "epoch finished"
        );
    }
    Ok(())
}
