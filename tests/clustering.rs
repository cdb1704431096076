use pmc_rs::test_posteriors::GaussianMixture;
use pmc_rs::{bootstrap, ChainHistory, ClusteringSettings, Posterior, State};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

fn iid_chain(center: [f64; 2], n: usize, rng: &mut ChaCha8Rng) -> ChainHistory {
    let states = (0..n)
        .map(|_| {
            let point: Vec<f64> = center
                .iter()
                .map(|c| c + Distribution::<f64>::sample(&StandardNormal, &mut *rng))
                .collect();
            State::evaluated(point, 0, 0.0)
        })
        .collect();
    ChainHistory::new(states, n)
}

#[test]
fn separated_chains_give_two_components() {
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let chains = vec![
        iid_chain([-5.0, -5.0], 5000, &mut rng),
        iid_chain([5.0, 5.0], 5000, &mut rng),
    ];
    let mut posterior = GaussianMixture::new(vec![vec![-5.0, -5.0], vec![5.0, 5.0]], 1.0, 20.0);
    let mixture = bootstrap(
        &chains,
        &mut posterior,
        &ClusteringSettings::default(),
        None,
        &mut rng,
    )
    .unwrap();

    assert_eq!(mixture.live_components(), 2);
    assert_eq!(mixture.dim(), posterior.dim());
    let mut means: Vec<Vec<f64>> = mixture
        .components()
        .iter()
        .filter(|c| c.is_alive())
        .map(|c| c.mean().to_vec())
        .collect();
    means.sort_by(|a, b| a[0].total_cmp(&b[0]));
    for (mean, target) in means.iter().zip([-5.0, 5.0]) {
        assert!((mean[0] - target).abs() < 0.1, "{:?}", mean);
        assert!((mean[1] - target).abs() < 0.1, "{:?}", mean);
    }
}
