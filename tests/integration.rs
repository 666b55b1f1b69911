use combdiff::{
    hamming_grad, hamming_loss, hamming_loss_batch, make_estimator, normalized_regret,
    normalized_regret_batch, oracle_solve, EstimatorConfig, EstimatorKind, ErrorKind,
    GroundTruth, Neighbourhood, RankingConfig, RankingKind, ShortestPath, SolutionCache,
};
use ndarray::{array, Array2};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn toy() -> (Array2<f64>, Array2<f64>, Array2<f64>) {
    let w = array![[1.0, 9.0, 9.0], [1.0, 9.0, 9.0], [1.0, 1.0, 1.0]];
    let c = array![[1.0, 1.0, 1.0], [9.0, 9.0, 1.0], [9.0, 9.0, 1.0]];
    let y = array![[1.0, 1.0, 1.0], [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]];
    (w, c, y)
}

fn four_grid() -> EstimatorConfig {
    EstimatorConfig {
        neighbourhood: Neighbourhood::Four,
        ..Default::default()
    }
}

#[test]
fn diagonal_scenario_on_four_by_four() {
    let w = Array2::from_shape_fn((4, 4), |(r, c)| if r == c { 1.0 } else { 10.0 });
    let path = oracle_solve(w.view(), Neighbourhood::Eight).unwrap();
    assert_eq!(path, Array2::eye(4));
    assert_eq!(combdiff::path_cost(w.view(), path.view()).unwrap(), 4.0);
    assert_eq!(hamming_loss(path.view(), path.view()).unwrap(), 0.0);
    assert_eq!(normalized_regret(path.view(), path.view(), w.view()).unwrap(), 0.0);

    // Without diagonal moves the cheapest route is a staircase along the diagonal.
    let stair = oracle_solve(w.view(), Neighbourhood::Four).unwrap();
    assert_eq!(stair.sum(), 7.0);
    assert_eq!(combdiff::path_cost(w.view(), stair.view()).unwrap(), 4.0 + 3.0 * 10.0);
}

#[test]
fn blackbox_rescaled_by_lambda_agrees_with_spo() {
    let (w, c, y) = toy();
    let spo = make_estimator(EstimatorKind::Spo, &four_grid()).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let truth = GroundTruth::new(y.view(), c.view());
    let fwd = spo.forward(w.view(), Some(truth), &mut rng).unwrap();
    let g_spo = spo.backward(&fwd, c.view()).unwrap();

    for lambda in [2.0, 5.0, 10.0, 20.0] {
        let cfg = EstimatorConfig {
            lambda,
            ..four_grid()
        };
        let bb = make_estimator(EstimatorKind::Blackbox, &cfg).unwrap();
        let fwd = bb.forward(w.view(), None, &mut rng).unwrap();
        let g_bb = bb.backward(&fwd, c.view()).unwrap();
        for (a, b) in g_bb.iter().zip(g_spo.iter()) {
            assert!((lambda * a - b).abs() < 1e-12, "lambda={lambda}: {g_bb:?} vs {g_spo:?}");
        }
    }

    // Below the switching point the interpolated solve does not move.
    let cfg = EstimatorConfig {
        lambda: 0.1,
        ..four_grid()
    };
    let bb = make_estimator(EstimatorKind::Blackbox, &cfg).unwrap();
    let fwd = bb.forward(w.view(), None, &mut rng).unwrap();
    assert!(bb.backward(&fwd, c.view()).unwrap().iter().all(|&v| v == 0.0));
}

#[test]
fn perturbed_batch_pipeline_with_hamming_upstream() {
    let (w, c, y) = toy();
    let cfg = EstimatorConfig {
        sigma: 1.0,
        num_samples: 16,
        ..four_grid()
    };
    let est = make_estimator(EstimatorKind::Perturbed, &cfg).unwrap();
    let batch = vec![w.clone(), c.clone()];
    let truths = [GroundTruth::new(y.view(), c.view()), GroundTruth::new(y.view(), c.view())];
    let mut rng = ChaCha8Rng::seed_from_u64(11);

    let fwds = est.forward_batch(&batch, None, &mut rng).unwrap();
    let outputs: Vec<Array2<f64>> = fwds.iter().map(|f| f.output().clone()).collect();
    let ups: Vec<Array2<f64>> = outputs
        .iter()
        .map(|o| hamming_grad(o.view(), y.view()).unwrap())
        .collect();
    let grads = est.backward_batch(&fwds, &ups).unwrap();
    assert_eq!(grads.len(), 2);
    assert!(grads.iter().all(|g| g.iter().all(|v| v.is_finite())));

    let loss = hamming_loss_batch(&outputs, &truths).unwrap();
    assert!((0.0..=1.0).contains(&loss));
    let oracle = ShortestPath::new(Neighbourhood::Four);
    let preds = oracle.solve_batch(&batch).unwrap();
    let regret = normalized_regret_batch(&preds, &truths).unwrap();
    // First example predicts the detour (cost 29 vs 5), the second predicts the truth.
    assert!((regret - 24.0 / 10.0).abs() < 1e-12);
}

#[test]
fn cache_training_loop_reaches_the_true_path() {
    let (mut w, c, y) = toy();
    let cfg = RankingConfig {
        loss: RankingKind::Pairwise,
        tau: 1.0,
        growth: 1.0,
        neighbourhood: Neighbourhood::Four,
    };
    let mut cache = SolutionCache::from_config(&cfg, &[y.clone()]).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    for _ in 0..60 {
        cache.maybe_grow(w.view(), cfg.growth, &mut rng).unwrap();
        let batch = cache.ranking_batch(w.view(), GroundTruth::new(y.view(), c.view())).unwrap();
        let loss = batch.loss(&cfg).unwrap();
        w = (&w - &(loss.gradient * 0.5)).mapv(|v| v.max(0.0));
    }
    let pred = oracle_solve(w.view(), Neighbourhood::Four).unwrap();
    assert_eq!(pred, y);
    assert!(cache.len() >= 2);
}

#[test]
fn every_strategy_builds_from_toml() {
    let cfg = EstimatorConfig::from_toml(
        r#"
        neighbourhood = "4-grid"
        lambda = 10.0
        sigma = 0.5
        num_samples = 4
        nb_samples = 2
        max_iterations = 200
        "#,
    )
    .unwrap();
    let (w, c, y) = toy();
    let mut rng = ChaCha8Rng::seed_from_u64(1);
    for kind in EstimatorKind::ALL {
        let name = kind.to_string();
        let est = make_estimator(name.parse().unwrap(), &cfg).unwrap();
        let truth = GroundTruth::new(y.view(), c.view());
        let fwd = est.forward(w.view(), Some(truth), &mut rng).unwrap();
        let up = hamming_grad(fwd.output().view(), y.view()).unwrap();
        let g = est.backward(&fwd, up.view()).unwrap();
        assert_eq!(g.dim(), (3, 3), "{name}");
    }
}

#[test]
fn failures_are_classified() {
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let est = make_estimator(EstimatorKind::Blackbox, &four_grid()).unwrap();

    let ragged = Array2::<f64>::zeros((2, 3));
    let err = est.forward(ragged.view(), None, &mut rng).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidWeight);

    let cfg = EstimatorConfig {
        num_samples: 0,
        ..four_grid()
    };
    let err = make_estimator(EstimatorKind::Perturbed, &cfg).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let (w, _, _) = toy();
    let tight = EstimatorConfig {
        max_iterations: 1,
        ..four_grid()
    };
    let qp = make_estimator(EstimatorKind::QuadraticProgram, &tight).unwrap();
    let err = qp.forward(w.view(), None, &mut rng).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SolverDivergence);
}
