//! Initial mixture from Markov chain histories.
//!
//! Chains that sample the same mode are grouped by their R-value. Each group
//! is split into a few large windows that give a coarse first guess of the
//! mixture, and every chain is cut into many small windows ("patches").
//! The patches are then clustered onto the guess by minimizing the
//! Kullback-Leibler divergence, as in Goldberger and Roweis (2004).

use rand::Rng;
use thiserror::Error;

use crate::chain::ChainHistory;
use crate::math::{cholesky_lower, sample_mean_covariance, weighted_mean_covariance};
use crate::mixture::{Mixture, MixtureComponent, MixtureError};
use crate::model::Posterior;
use crate::proposal::ProposalError;
use crate::state::State;

#[derive(Error, Debug)]
pub enum ClusteringError {
    #[error("All components were removed by the overlap filter, check the parameter ranges")]
    AllComponentsFiltered,
    #[error("No chain histories given")]
    NoChains,
    #[error("Chain {chain} has {points} points after burn-in, need at least {needed}")]
    TooShort {
        chain: usize,
        points: usize,
        needed: usize,
    },
    #[error("Every patch has a singular covariance matrix")]
    NoPatches,
    #[error("Local mode search failed")]
    PosteriorFailure(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error(transparent)]
    Proposal(#[from] ProposalError),
    #[error(transparent)]
    Mixture(#[from] MixtureError),
}

#[derive(Debug, Clone, Copy)]
pub struct ClusteringSettings {
    /// Chains whose R-value is below this value are merged into one group.
    pub rvalue_ceiling: f64,
    /// Fraction of every chain discarded as burn-in.
    pub skip_initial: f64,
    /// Number of components seeded per chain group.
    pub clusters_per_group: usize,
    /// Length of the windows that are cut into patches.
    pub window_size: usize,
    /// Components with a smaller fraction of draws inside the parameter
    /// bounds are removed.
    pub minimum_overlap: f64,
    /// Number of draws per component for the overlap test.
    pub overlap_samples: usize,
    /// Replace the initial window means by local modes of the posterior.
    pub seed_with_local_modes: bool,
    pub max_iterations: usize,
}

impl Default for ClusteringSettings {
    fn default() -> Self {
        Self {
            rvalue_ceiling: 1.1,
            skip_initial: 0.2,
            clusters_per_group: 1,
            window_size: 200,
            minimum_overlap: 0.05,
            overlap_samples: 1000,
            seed_with_local_modes: false,
            max_iterations: 100,
        }
    }
}

/// Gelman-Rubin potential scale reduction, maximized over all coordinates.
///
/// Chains are truncated to the shortest one.
pub fn rvalue(chains: &[&[State]]) -> f64 {
    let m = chains.len();
    let n = chains.iter().map(|chain| chain.len()).min().unwrap_or(0);
    if m < 2 || n < 2 {
        return f64::NAN;
    }
    let dim = chains[0][0].dim();
    let (m_f, n_f) = (m as f64, n as f64);

    (0..dim)
        .map(|k| {
            let mut means = Vec::with_capacity(m);
            let mut within = 0.0;
            for chain in chains.iter() {
                let values = chain[..n].iter().map(|state| state.point[k]);
                let mean = values.clone().sum::<f64>() / n_f;
                let variance = values.map(|x| (x - mean) * (x - mean)).sum::<f64>() / (n_f - 1.0);
                means.push(mean);
                within += variance / m_f;
            }
            let grand = means.iter().sum::<f64>() / m_f;
            let between = n_f / (m_f - 1.0) * means.iter().map(|x| (x - grand).powi(2)).sum::<f64>();
            let pooled = (n_f - 1.0) / n_f * within + between / n_f;
            (pooled / within).sqrt()
        })
        .fold(f64::NEG_INFINITY, f64::max)
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (a, b) = (self.find(a), self.find(b));
        if a != b {
            self.parent[a.max(b)] = a.min(b);
        }
    }
}

/// Group chains transitively: two chains belong to the same group if their
/// post burn-in R-value is below `rvalue_ceiling`.
pub fn group_chains(chains: &[ChainHistory], skip_initial: f64, rvalue_ceiling: f64) -> Vec<Vec<usize>> {
    let mut sets = UnionFind::new(chains.len());
    for i in 0..chains.len() {
        for j in (i + 1)..chains.len() {
            let pair = [
                chains[i].post_burn_in(skip_initial),
                chains[j].post_burn_in(skip_initial),
            ];
            let r = rvalue(&pair);
            log::debug!("R-value of chains {} and {}: {:.4}", i, j, r);
            if r < rvalue_ceiling {
                sets.union(i, j);
            }
        }
    }

    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut roots: Vec<usize> = Vec::new();
    for chain in 0..chains.len() {
        let root = sets.find(chain);
        match roots.iter().position(|&r| r == root) {
            Some(idx) => groups[idx].push(chain),
            None => {
                roots.push(root);
                groups.push(vec![chain]);
            }
        }
    }
    groups
}

/// Gaussian approximations of consecutive, non-overlapping windows.
///
/// Windows with a singular covariance matrix are skipped.
pub fn patches(states: &[State], window_size: usize) -> Vec<MixtureComponent> {
    if window_size == 0 {
        return Vec::new();
    }
    states
        .chunks_exact(window_size)
        .filter_map(|window| {
            let dim = window[0].dim();
            let points: Vec<&[f64]> = window.iter().map(|state| state.point.as_slice()).collect();
            let (mean, covariance) = sample_mean_covariance(dim, &points);
            cholesky_lower(&covariance)?;
            MixtureComponent::gaussian(1.0, mean, covariance).ok()
        })
        .collect()
}

/// `KL(p ‖ q)` between the Gaussian parts of two components.
pub fn kl_divergence(p: &MixtureComponent, q: &MixtureComponent) -> f64 {
    let dim = p.dim();
    let precision = q.core().precision();
    let covariance = p.covariance();
    let mut trace = 0.0;
    for i in 0..dim {
        for j in 0..dim {
            trace += precision[(i, j)] * covariance[(j, i)];
        }
    }
    let delta: Vec<f64> = q.mean().iter().zip(p.mean()).map(|(a, b)| a - b).collect();
    let mahalanobis = q.core().chi_squared(&delta);
    0.5 * (trace + mahalanobis - dim as f64 + q.core().log_det() - p.core().log_det())
}

/// Cluster `patches` onto the `initial` components.
///
/// Each patch is assigned to the component closest in KL divergence, then
/// every component is refit to its patches by moment matching. Components
/// without patches die. Stops once the assignment is stable.
pub fn hierarchical_clustering(
    patches: &[MixtureComponent],
    initial: Vec<MixtureComponent>,
    max_iterations: usize,
) -> Result<Mixture, ClusteringError> {
    if patches.is_empty() {
        return Err(ClusteringError::NoPatches);
    }
    let dim = patches[0].dim();
    let mut clusters = initial;
    let mut assignment: Vec<usize> = vec![usize::MAX; patches.len()];

    for iteration in 0..max_iterations {
        let next: Vec<usize> = patches
            .iter()
            .map(|patch| {
                clusters
                    .iter()
                    .enumerate()
                    .filter(|(_, cluster)| cluster.is_alive())
                    .map(|(c, cluster)| (c, kl_divergence(patch, cluster)))
                    .min_by(|a, b| a.1.total_cmp(&b.1))
                    .map(|(c, _)| c)
                    .unwrap_or(0)
            })
            .collect();
        if next == assignment {
            log::debug!("Clustering converged after {} iterations", iteration);
            break;
        }
        assignment = next;

        for (c, cluster) in clusters.iter_mut().enumerate() {
            let members: Vec<&MixtureComponent> = patches
                .iter()
                .zip(&assignment)
                .filter(|(_, &a)| a == c)
                .map(|(patch, _)| patch)
                .collect();
            if members.is_empty() {
                if cluster.is_alive() {
                    log::debug!("Cluster {} lost all its patches", c);
                }
                *cluster = MixtureComponent::gaussian(0.0, cluster.mean().to_vec(), cluster.covariance().clone())?;
                continue;
            }
            let count = members.len() as f64;
            let (mean, mut covariance) =
                weighted_mean_covariance(dim, members.iter().map(|patch| (patch.mean(), 1.0)));
            for patch in members.iter() {
                let inner = patch.covariance();
                for i in 0..dim {
                    for j in 0..dim {
                        covariance[(i, j)] += inner[(i, j)] / count;
                    }
                }
            }
            *cluster = MixtureComponent::gaussian(count, mean, covariance)?;
        }
    }

    Ok(Mixture::new(clusters)?)
}

/// Remove components that put too little mass inside the parameter bounds.
///
/// Returns the number of live components left.
pub fn filter_components<P: Posterior, R: Rng + ?Sized>(
    mixture: &mut Mixture,
    posterior: &P,
    settings: &ClusteringSettings,
    rng: &mut R,
) -> Result<usize, ClusteringError> {
    for c in 0..mixture.len() {
        if !mixture.components()[c].is_alive() {
            continue;
        }
        let inside = (0..settings.overlap_samples)
            .filter(|_| posterior.in_bounds(&mixture.components()[c].sample(&mut *rng)))
            .count();
        let overlap = inside as f64 / settings.overlap_samples.max(1) as f64;
        if overlap < settings.minimum_overlap {
            log::debug!(
                "Removing component {}: only {:.1}% of its mass is inside the bounds",
                c,
                100.0 * overlap
            );
            mixture.kill(c);
        }
    }
    let live = mixture.live_components();
    if live == 0 {
        return Err(ClusteringError::AllComponentsFiltered);
    }
    mixture.normalize()?;
    Ok(live)
}

/// Build an initial Gaussian (or Student-T, with `dof`) mixture from chain
/// histories.
pub fn bootstrap<P: Posterior, R: Rng + ?Sized>(
    chains: &[ChainHistory],
    posterior: &mut P,
    settings: &ClusteringSettings,
    dof: Option<f64>,
    rng: &mut R,
) -> Result<Mixture, ClusteringError> {
    if chains.is_empty() {
        return Err(ClusteringError::NoChains);
    }
    let dim = posterior.dim();
    let clusters_per_group = settings.clusters_per_group.max(1);
    let needed = settings.window_size.max(dim + 1);
    for (idx, chain) in chains.iter().enumerate() {
        let points = chain.post_burn_in(settings.skip_initial).len();
        if points < needed {
            return Err(ClusteringError::TooShort {
                chain: idx,
                points,
                needed,
            });
        }
    }

    let groups = group_chains(chains, settings.skip_initial, settings.rvalue_ceiling);
    log::info!("Grouped {} chains into {} groups", chains.len(), groups.len());

    let mut initial = Vec::with_capacity(groups.len() * clusters_per_group);
    for group in groups.iter() {
        let states: Vec<&State> = group
            .iter()
            .flat_map(|&chain| chains[chain].post_burn_in(settings.skip_initial))
            .collect();
        let window = states.len().div_ceil(clusters_per_group).max(dim + 1);
        for part in states.chunks(window) {
            if part.len() <= dim {
                continue;
            }
            let points: Vec<&[f64]> = part.iter().map(|state| state.point.as_slice()).collect();
            let (mut mean, mut covariance) = sample_mean_covariance(dim, &points);
            if settings.seed_with_local_modes {
                let mode = posterior
                    .find_mode(&mean)
                    .map_err(|err| ClusteringError::PosteriorFailure(Box::new(err)))?;
                if let Some(mode) = mode {
                    mean = mode.point;
                    if let Some(mode_covariance) = mode.covariance {
                        covariance = mode_covariance;
                    }
                }
            }
            initial.push(MixtureComponent::gaussian(1.0, mean, covariance)?);
        }
    }

    let windows: Vec<MixtureComponent> = chains
        .iter()
        .flat_map(|chain| patches(chain.post_burn_in(settings.skip_initial), settings.window_size))
        .collect();
    log::debug!("Clustering {} patches onto {} components", windows.len(), initial.len());

    let clustered = hierarchical_clustering(&windows, initial, settings.max_iterations)?;
    let mut mixture = match dof {
        None => clustered,
        Some(dof) => Mixture::new(
            clustered
                .components()
                .iter()
                .map(|c| MixtureComponent::student_t(c.weight(), c.mean().to_vec(), c.covariance().clone(), dof))
                .collect::<Result<Vec<_>, _>>()?,
        )?,
    };
    filter_components(&mut mixture, posterior, settings, rng)?;
    Ok(mixture)
}
