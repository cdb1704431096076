use anyhow::{anyhow, Result};
use faer::Mat;
use rand::Rng;
use thiserror::Error;

use crate::checkpoint::{Checkpoint, Table};
use crate::math::{
    draw_index, flatten, log_sum_exp, logaddexp, outer_lower, unflatten, weighted_mean_covariance,
};
use crate::proposal::{check_dof, CovarianceCore, ProposalError};
use crate::state::State;

#[derive(Error, Debug)]
pub enum MixtureError {
    #[error("Mixture has no components")]
    Empty,
    #[error("No live component left")]
    NoLiveComponents,
    #[error("Component {component} has dimension {got}, expected {expected}")]
    DimensionMismatch {
        component: usize,
        expected: usize,
        got: usize,
    },
    #[error("All components must share the same degrees of freedom")]
    MixedKinds,
    #[error(transparent)]
    Proposal(#[from] ProposalError),
}

/// One weighted Gaussian or Student-T component.
#[derive(Debug, Clone)]
pub struct MixtureComponent {
    weight: f64,
    mean: Vec<f64>,
    core: CovarianceCore,
    dof: Option<f64>,
}

impl MixtureComponent {
    pub fn gaussian(weight: f64, mean: Vec<f64>, covariance: Mat<f64>) -> Result<Self, ProposalError> {
        Self::new(weight, mean, covariance, None)
    }

    pub fn student_t(
        weight: f64,
        mean: Vec<f64>,
        covariance: Mat<f64>,
        dof: f64,
    ) -> Result<Self, ProposalError> {
        Self::new(weight, mean, covariance, Some(dof))
    }

    pub fn new(
        weight: f64,
        mean: Vec<f64>,
        covariance: Mat<f64>,
        dof: Option<f64>,
    ) -> Result<Self, ProposalError> {
        if covariance.nrows() != mean.len() {
            return Err(ProposalError::DimensionMismatch {
                expected: mean.len(),
                got: covariance.nrows(),
            });
        }
        let dof = dof.map(check_dof).transpose()?;
        let core = if weight > 0.0 {
            CovarianceCore::new(covariance)?
        } else {
            CovarianceCore::new_unchecked(covariance)
        };
        Ok(Self {
            weight: weight.max(0.0),
            mean,
            core,
            dof,
        })
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn covariance(&self) -> &Mat<f64> {
        self.core.covariance()
    }

    pub fn dof(&self) -> Option<f64> {
        self.dof
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub(crate) fn core(&self) -> &CovarianceCore {
        &self.core
    }

    pub fn is_alive(&self) -> bool {
        self.weight > 0.0
    }

    fn delta(&self, point: &[f64]) -> Vec<f64> {
        point.iter().zip(&self.mean).map(|(x, m)| x - m).collect()
    }

    /// Log density of the (unweighted) component at `point`.
    pub fn log_density(&self, point: &[f64]) -> f64 {
        if !self.core.is_valid() {
            return f64::NEG_INFINITY;
        }
        self.core.log_density(&self.delta(point), self.dof)
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        let mut point = vec![0f64; self.dim()];
        self.core.sample_delta(rng, self.dof, &mut point);
        point.iter_mut().zip(&self.mean).for_each(|(x, m)| *x += m);
        point
    }
}

/// Importance sampling density: a weighted sum of components.
///
/// Dead components have weight zero. They are never sampled and are not
/// adapted anymore, but they keep their index and are persisted.
#[derive(Debug, Clone)]
pub struct Mixture {
    components: Vec<MixtureComponent>,
}

impl Mixture {
    pub fn new(components: Vec<MixtureComponent>) -> Result<Self, MixtureError> {
        let first = components.first().ok_or(MixtureError::Empty)?;
        let dim = first.dim();
        let dof = first.dof;
        for (idx, component) in components.iter().enumerate() {
            if component.dim() != dim {
                return Err(MixtureError::DimensionMismatch {
                    component: idx,
                    expected: dim,
                    got: component.dim(),
                });
            }
            if component.dof != dof {
                return Err(MixtureError::MixedKinds);
            }
        }
        let mut mixture = Self { components };
        mixture.normalize()?;
        Ok(mixture)
    }

    /// Rescale the live weights to sum to one.
    pub fn normalize(&mut self) -> Result<(), MixtureError> {
        let total: f64 = self.components.iter().map(|c| c.weight).sum();
        if !(total > 0.0) {
            return Err(MixtureError::NoLiveComponents);
        }
        self.components.iter_mut().for_each(|c| c.weight /= total);
        Ok(())
    }

    pub fn dim(&self) -> usize {
        self.components[0].dim()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn components(&self) -> &[MixtureComponent] {
        &self.components
    }

    pub fn live_components(&self) -> usize {
        self.components.iter().filter(|c| c.is_alive()).count()
    }

    pub fn weights(&self) -> Vec<f64> {
        self.components.iter().map(|c| c.weight).collect()
    }

    pub fn dof(&self) -> Option<f64> {
        self.components[0].dof
    }

    pub fn kill(&mut self, component: usize) {
        if let Some(component) = self.components.get_mut(component) {
            component.weight = 0.0;
        }
    }

    /// `log w_c + log q_c(point)` for every component, `-inf` for dead ones.
    pub fn component_log_densities(&self, point: &[f64], out: &mut [f64]) {
        for (value, component) in out.iter_mut().zip(&self.components) {
            *value = if component.is_alive() {
                component.weight.ln() + component.log_density(point)
            } else {
                f64::NEG_INFINITY
            };
        }
    }

    pub fn log_density(&self, point: &[f64]) -> f64 {
        self.components
            .iter()
            .filter(|c| c.is_alive())
            .map(|c| c.weight.ln() + c.log_density(point))
            .fold(f64::NEG_INFINITY, logaddexp)
    }

    /// Draw a point, the state records the component it came from.
    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> State {
        let component = draw_index(&self.weights(), rng.random());
        self.draw_from(component, rng)
    }

    pub fn draw_from<R: Rng + ?Sized>(&self, component: usize, rng: &mut R) -> State {
        State::new(self.components[component].sample(rng), component)
    }

    /// Rao-Blackwellized update from weighted samples.
    ///
    /// `weights` are the normalized importance weights of `samples`. A
    /// component dies when its new weight drops below
    /// `dead_component_weight` or its effective number of samples below
    /// `dim + 1`, except that at least one component always survives.
    /// Returns the indices of the components that died.
    pub fn update(
        &mut self,
        samples: &[State],
        weights: &[f64],
        dead_component_weight: f64,
    ) -> Result<Vec<usize>, MixtureError> {
        let dim = self.dim();
        let n_components = self.components.len();

        // w_n ρ_c(x_n) for every sample that carries weight
        let mut responsibilities: Vec<(usize, Vec<f64>)> = Vec::new();
        let mut alpha = vec![0f64; n_components];
        let mut log_terms = vec![0f64; n_components];
        for (idx, (state, &weight)) in samples.iter().zip(weights).enumerate() {
            if !(weight > 0.0) {
                continue;
            }
            self.component_log_densities(&state.point, &mut log_terms);
            let total = log_sum_exp(&log_terms);
            if !total.is_finite() {
                continue;
            }
            let row: Vec<f64> = log_terms
                .iter()
                .map(|&term| weight * (term - total).exp())
                .collect();
            alpha.iter_mut().zip(&row).for_each(|(a, r)| *a += r);
            responsibilities.push((idx, row));
        }

        let effective: Vec<f64> = (0..n_components)
            .map(|c| {
                let sum_sq: f64 = responsibilities.iter().map(|(_, row)| row[c] * row[c]).sum();
                if sum_sq > 0.0 {
                    alpha[c] * alpha[c] / sum_sq
                } else {
                    0.0
                }
            })
            .collect();
        let starved =
            |c: usize| alpha[c] < dead_component_weight || effective[c] < (dim + 1) as f64;

        // The heaviest component outlives a chunk that would kill all of them.
        let live: Vec<usize> = (0..n_components)
            .filter(|&c| self.components[c].is_alive())
            .collect();
        let survivor = if live.iter().all(|&c| starved(c)) {
            live.iter()
                .copied()
                .max_by(|&a, &b| alpha[a].total_cmp(&alpha[b]))
        } else {
            None
        };
        if let Some(c) = survivor {
            log::warn!(
                "Keeping last component {}: weight {:.3e}, effective samples {:.1}",
                c,
                alpha[c],
                effective[c]
            );
        }

        let mut died = Vec::new();
        let mut updated = Vec::with_capacity(n_components);
        for (c, component) in self.components.iter().enumerate() {
            if !component.is_alive() {
                updated.push(None);
                continue;
            }
            let a = alpha[c];
            if starved(c) && survivor != Some(c) {
                log::debug!(
                    "Component {} dies: weight {:.3e}, effective samples {:.1}",
                    c,
                    a,
                    effective[c]
                );
                died.push(c);
                updated.push(None);
                continue;
            }
            if !(a > 0.0) {
                updated.push(Some((1.0, component.mean.clone(), component.covariance().clone())));
                continue;
            }

            let factors: Vec<f64> = responsibilities
                .iter()
                .map(|(idx, row)| {
                    let tau = match component.dof {
                        None => 1.0,
                        Some(nu) => {
                            let chi_sq = component
                                .core
                                .chi_squared(&component.delta(&samples[*idx].point));
                            (nu + dim as f64) / (nu + chi_sq)
                        }
                    };
                    row[c] * tau
                })
                .collect();
            let tau_total: f64 = factors.iter().sum();
            let (mean, mut covariance) = weighted_mean_covariance(
                dim,
                responsibilities
                    .iter()
                    .zip(&factors)
                    .map(|((idx, _), &f)| (samples[*idx].point.as_slice(), f)),
            );
            // Student-T scale matrices are normalized by Σ w ρ, not Σ w ρ τ
            let correction = tau_total / a;
            for i in 0..dim {
                for j in 0..dim {
                    covariance[(i, j)] *= correction;
                }
            }
            if effective[c] < (dim + 1) as f64 {
                // too few samples to estimate a covariance, only the mean moves
                covariance = component.covariance().clone();
            }
            updated.push(Some((a, mean, covariance)));
        }

        for (component, update) in self.components.iter_mut().zip(updated) {
            match update {
                Some((weight, mean, covariance)) => {
                    component.core = CovarianceCore::new(covariance)?;
                    component.mean = mean;
                    component.weight = weight;
                }
                None => component.weight = 0.0,
            }
        }
        self.normalize()?;
        Ok(died)
    }

    /// Write all components as one table.
    pub fn dump(&self, store: &mut dyn Checkpoint, path: &str) -> Result<()> {
        let dim = self.dim();
        let mut table = Table::new(&[("weight", 1), ("mean", dim), ("covariance", dim * dim)])
            .with_attribute("degrees of freedom", self.dof().unwrap_or(-1.0))
            .with_attribute("cholesky", 0.0);
        for component in self.components.iter() {
            table.push(&[
                &[component.weight],
                &component.mean,
                &flatten(component.covariance()),
            ])?;
        }
        store.write_table(path, &table)
    }

    pub fn load(store: &dyn Checkpoint, path: &str) -> Result<Self> {
        let table = store.read_table(path)?;
        let dim = table.field_width("mean")?;
        if table.field_width("covariance")? != dim * dim {
            return Err(anyhow!("Covariance field at '{}' does not match dimension {}", path, dim));
        }
        let dof = table.require_attribute("degrees of freedom")?;
        let dof = if dof > 0.0 { Some(dof) } else { None };
        let cholesky = table.attribute("cholesky").unwrap_or(0.0) == 1.0;

        let mut components = Vec::with_capacity(table.len());
        for row in 0..table.len() {
            let mut covariance = unflatten(table.get(row, "covariance")?, dim);
            if cholesky {
                covariance = outer_lower(&covariance);
            }
            components.push(MixtureComponent::new(
                table.scalar(row, "weight")?,
                table.get(row, "mean")?.to_vec(),
                covariance,
                dof,
            )?);
        }
        Ok(Mixture::new(components)?)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;
    use crate::checkpoint::MemoryCheckpoint;

    fn diag(values: &[f64]) -> Mat<f64> {
        let n = values.len();
        Mat::from_fn(n, n, |i, j| if i == j { values[i] } else { 0.0 })
    }

    fn two_components(dof: Option<f64>) -> Mixture {
        Mixture::new(vec![
            MixtureComponent::new(1.0, vec![-3.0, 0.0], diag(&[1.0, 1.0]), dof).unwrap(),
            MixtureComponent::new(3.0, vec![3.0, 1.0], diag(&[0.5, 2.0]), dof).unwrap(),
        ])
        .unwrap()
    }

    #[test]
    fn density_is_weighted_sum() {
        let mixture = two_components(None);
        assert_eq!(mixture.weights(), vec![0.25, 0.75]);
        let point = [0.5, 0.2];
        let direct = 0.25 * mixture.components()[0].log_density(&point).exp()
            + 0.75 * mixture.components()[1].log_density(&point).exp();
        assert_abs_diff_eq!(mixture.log_density(&point), direct.ln(), epsilon = 1e-12);

        let mut mixture = mixture;
        mixture.kill(1);
        mixture.normalize().unwrap();
        assert_abs_diff_eq!(
            mixture.log_density(&point),
            mixture.components()[0].log_density(&point),
            epsilon = 1e-12
        );
    }

    #[test]
    fn draws_follow_weights() {
        let mixture = two_components(Some(5.0));
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let n = 4000;
        let ones = (0..n).filter(|_| mixture.draw(&mut rng).component == 1).count();
        assert!((ones as f64 / n as f64 - 0.75).abs() < 0.03);
    }

    fn self_update(dof: Option<f64>) -> Mixture {
        let mut mixture = two_components(dof);
        let reference = mixture.clone();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let samples: Vec<State> = (0..40_000).map(|_| reference.draw(&mut rng)).collect();
        let weights = vec![1.0 / samples.len() as f64; samples.len()];
        let died = mixture.update(&samples, &weights, 1e-4).unwrap();
        assert!(died.is_empty());
        mixture
    }

    #[test]
    fn update_is_stable_on_own_samples() {
        for dof in [None, Some(10.0)] {
            let mixture = self_update(dof);
            assert_abs_diff_eq!(mixture.weights()[1], 0.75, epsilon = 0.02);
            let second = &mixture.components()[1];
            assert_abs_diff_eq!(second.mean()[0], 3.0, epsilon = 0.05);
            assert_abs_diff_eq!(second.covariance()[(1, 1)], 2.0, epsilon = 0.15);
            assert_abs_diff_eq!(second.covariance()[(0, 1)], 0.0, epsilon = 0.05);
        }
    }

    #[test]
    fn starved_component_dies() {
        let mut mixture = Mixture::new(vec![
            MixtureComponent::gaussian(0.5, vec![0.0], diag(&[1.0])).unwrap(),
            MixtureComponent::gaussian(0.5, vec![100.0], diag(&[1.0])).unwrap(),
        ])
        .unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let samples: Vec<State> = (0..1000).map(|_| mixture.draw_from(0, &mut rng)).collect();
        let weights = vec![1e-3; 1000];
        let died = mixture.update(&samples, &weights, 1e-4).unwrap();
        assert_eq!(died, vec![1]);
        assert_eq!(mixture.weights(), vec![1.0, 0.0]);
        assert_eq!(mixture.live_components(), 1);
        assert_eq!(mixture.components()[1].mean(), &[100.0]);
    }

    #[test]
    fn last_component_survives_starvation() {
        let mut mixture = Mixture::new(vec![
            MixtureComponent::gaussian(1.0, vec![4.0, 4.0], diag(&[1.0, 1.0])).unwrap(),
        ])
        .unwrap();
        let samples: Vec<State> = (0..10)
            .map(|k| State::new(vec![k as f64 * 0.1, 1.0], 0))
            .collect();
        let mut weights = vec![0.0; 10];
        weights[2] = 1.0;
        let died = mixture.update(&samples, &weights, 1e-3).unwrap();
        assert!(died.is_empty());
        assert_eq!(mixture.live_components(), 1);
        assert_eq!(mixture.weights(), vec![1.0]);
        let survivor = &mixture.components()[0];
        assert_abs_diff_eq!(survivor.mean()[0], 0.2, epsilon = 1e-12);
        assert_abs_diff_eq!(survivor.mean()[1], 1.0, epsilon = 1e-12);
        assert_eq!(survivor.covariance()[(0, 0)], 1.0);
        assert_eq!(survivor.covariance()[(0, 1)], 0.0);
    }

    #[test]
    fn dump_and_load() {
        let mut mixture = two_components(Some(4.0));
        mixture.kill(0);
        mixture.normalize().unwrap();
        let mut store = MemoryCheckpoint::new();
        mixture.dump(&mut store, "/data/0/components").unwrap();
        let loaded = Mixture::load(&store, "/data/0/components").unwrap();
        assert_eq!(loaded.weights(), mixture.weights());
        assert_eq!(loaded.dof(), Some(4.0));
        assert_eq!(loaded.components()[1].mean(), &[3.0, 1.0]);
        let point = [2.0, 2.0];
        assert_abs_diff_eq!(loaded.log_density(&point), mixture.log_density(&point), epsilon = 1e-12);
    }

    #[test]
    fn load_cholesky_factors() {
        let mut table = Table::new(&[("weight", 1), ("mean", 2), ("covariance", 4)])
            .with_attribute("degrees of freedom", -1.0)
            .with_attribute("cholesky", 1.0);
        table.push(&[&[1.0], &[0.0, 0.0], &[2.0, 0.0, 1.0, 1.0]]).unwrap();
        let mut store = MemoryCheckpoint::new();
        store.write_table("/c", &table).unwrap();
        let mixture = Mixture::load(&store, "/c").unwrap();
        let covariance = mixture.components()[0].covariance();
        assert_eq!(flatten(covariance), vec![4.0, 2.0, 2.0, 2.0]);
        assert_eq!(mixture.dof(), None);
    }

    #[test]
    fn mixed_kinds_are_rejected() {
        let result = Mixture::new(vec![
            MixtureComponent::gaussian(0.5, vec![0.0], diag(&[1.0])).unwrap(),
            MixtureComponent::student_t(0.5, vec![1.0], diag(&[1.0]), 3.0).unwrap(),
        ]);
        assert!(matches!(result, Err(MixtureError::MixedKinds)));
    }
}
