//! Population Monte Carlo: adaptive importance sampling with a mixture of
//! Gaussian or Student-T components.
//!
//! Every chunk draws samples from the current mixture, weights them by
//! `posterior / mixture density` and moves the mixture towards the
//! posterior with one Rao-Blackwellized update. Once the weights are close
//! to uniform (or the chunk budget is used up) a larger final chunk produces
//! the weighted sample that is reported.

use faer::Mat;
use itertools::Itertools;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

use crate::chain::ChainHistory;
use crate::checkpoint::{join, Checkpoint, Table, FORMAT_VERSION};
use crate::clustering::{bootstrap, ClusteringError, ClusteringSettings};
use crate::math::vector_dot;
use crate::mixture::{Mixture, MixtureComponent, MixtureError};
use crate::model::{LocalMode, Parameter, Posterior};
use crate::proposal::{GlobalLocal, ProposalError};
use crate::sampler_stats::{
    check_convergence, normalize_log_weights, ChunkStatistics, ConvergenceCriteria, Status,
};
use crate::state::State;
use crate::worker::{WorkerError, WorkerPool};

#[derive(Error, Debug)]
pub enum PmcError {
    #[error("Mixture has dimension {got}, the posterior has dimension {expected}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error(
        "Non-finite density at sample {index}: log posterior {log_posterior}, log proposal {log_proposal}"
    )]
    NonFinite {
        index: usize,
        log_posterior: f64,
        log_proposal: f64,
    },
    #[error("Every importance weight in chunk {0} is zero")]
    NoValidSamples(usize),
    #[error("No local mode to start from")]
    NoModes,
    #[error("Sampling has already finished")]
    Finished,
    #[error(transparent)]
    Proposal(#[from] ProposalError),
    #[error(transparent)]
    Mixture(#[from] MixtureError),
    #[error(transparent)]
    Clustering(#[from] ClusteringError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("Checkpoint access failed")]
    Checkpoint(#[from] anyhow::Error),
}

/// Settings for the PMC sampler
#[derive(Debug, Clone, Copy)]
pub struct PmcSettings {
    /// Samples per live component in every adaptation chunk.
    pub chunk_size: usize,
    /// Maximum number of adaptation chunks.
    pub chunks: usize,
    /// Number of samples drawn after adaptation.
    pub final_chunk_size: usize,
    pub seed: u64,
    /// Number of worker threads, 0 uses all available cores.
    pub num_workers: usize,
    /// Number of largest importance weights that are set to zero in every
    /// adaptation chunk.
    pub crop_highest_weights: usize,
    pub minimum_perplexity: f64,
    pub minimum_ess: f64,
    /// Number of chunks before convergence can be declared. Also the window
    /// over which the stability of the perplexity is measured.
    pub minimum_steps: usize,
    pub maximum_relative_std_deviation: f64,
    /// Components with less weight are removed from the mixture.
    pub dead_component_weight: f64,
    /// Store all samples of the adaptation chunks in the checkpoint.
    pub store_samples: bool,
    /// Use Student-T components with these degrees of freedom. Only applies
    /// to mixtures built from modes, chains or a GlobalLocal proposal.
    pub degrees_of_freedom: Option<f64>,
    /// Means of explicitly given components are moved by this fraction of a
    /// random draw from the component.
    pub perturbation: f64,
    /// Local modes closer than this, in units of the parameter ranges, are
    /// merged.
    pub mode_distance_threshold: f64,
}

impl Default for PmcSettings {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunks: 20,
            final_chunk_size: 100_000,
            seed: 0,
            num_workers: 0,
            crop_highest_weights: 0,
            minimum_perplexity: 0.9,
            minimum_ess: 0.7,
            minimum_steps: 3,
            maximum_relative_std_deviation: 0.05,
            dead_component_weight: 1e-3,
            store_samples: false,
            degrees_of_freedom: None,
            perturbation: 0.0,
            mode_distance_threshold: 0.05,
        }
    }
}

impl PmcSettings {
    fn criteria(&self) -> ConvergenceCriteria {
        ConvergenceCriteria {
            minimum_perplexity: self.minimum_perplexity,
            minimum_ess: self.minimum_ess,
            minimum_steps: self.minimum_steps,
            maximum_relative_std_deviation: self.maximum_relative_std_deviation,
        }
    }
}

/// Where the initial mixture comes from.
pub enum Initialization<'a> {
    /// Explicit components, means perturbed by `PmcSettings::perturbation`.
    Explicit(Vec<MixtureComponent>),
    /// Local mode searches from every start point, with equal weights.
    Modes(Vec<Vec<f64>>),
    /// Modes, local covariances and weights of a GlobalLocal proposal.
    GlobalLocal(&'a GlobalLocal),
    /// Hierarchical clustering of Markov chain histories.
    Clustering {
        chains: &'a [ChainHistory],
        settings: ClusteringSettings,
    },
    /// Continue from the components of an earlier run. `None` picks the
    /// last stored step.
    Checkpoint {
        source: &'a dyn Checkpoint,
        step: Option<usize>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    PreRun,
    Converged,
    Exhausted,
    Done,
}

impl Phase {
    fn code(self) -> f64 {
        match self {
            Phase::PreRun => 0.0,
            Phase::Converged => 1.0,
            Phase::Exhausted => 2.0,
            Phase::Done => 3.0,
        }
    }
}

/// One importance sample.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    pub point: Vec<f64>,
    pub component: usize,
    pub log_posterior: f64,
    /// `-inf` for samples outside the parameter bounds.
    pub log_weight: f64,
}

/// The weighted sample of the final chunk.
#[derive(Debug, Clone)]
pub struct PmcOutput {
    pub samples: Vec<SampleRecord>,
    /// Normalized importance weights.
    pub weights: Vec<f64>,
    pub statistics: ChunkStatistics,
    pub mixture: Mixture,
    pub converged: bool,
}

fn chunk_path(step: Option<usize>) -> String {
    match step {
        Some(step) => format!("/data/{}", step),
        None => "/data/final".to_string(),
    }
}

fn samples_table(dim: usize, samples: &[SampleRecord]) -> anyhow::Result<Table> {
    let mut table = Table::new(&[
        ("point", dim),
        ("component", 1),
        ("posterior", 1),
        ("log weight", 1),
    ]);
    for sample in samples {
        table.push(&[
            &sample.point,
            &[sample.component as f64],
            &[sample.log_posterior],
            &[sample.log_weight],
        ])?;
    }
    Ok(table)
}

/// Zero the `count` largest weights.
fn crop_highest(log_weights: &mut [f64], count: usize) {
    if count == 0 {
        return;
    }
    let highest: Vec<usize> = (0..log_weights.len())
        .filter(|&idx| log_weights[idx].is_finite())
        .sorted_by(|&a, &b| log_weights[b].total_cmp(&log_weights[a]))
        .take(count)
        .collect();
    for idx in highest {
        log_weights[idx] = f64::NEG_INFINITY;
    }
}

fn prior_covariance(parameters: &[Parameter]) -> Mat<f64> {
    let dim = parameters.len();
    Mat::from_fn(dim, dim, |i, j| {
        if i == j {
            parameters[i].prior.variance()
        } else {
            0.0
        }
    })
}

/// Euclidean distance in units of the parameter ranges.
fn rescaled_distance(a: &[f64], b: &[f64], parameters: &[Parameter]) -> f64 {
    let delta: Vec<f64> = a
        .iter()
        .zip(b)
        .zip(parameters)
        .map(|((x, y), parameter)| (x - y) / parameter.range())
        .collect();
    vector_dot(&delta, &delta).sqrt()
}

/// Keep the best of every group of modes closer than `threshold`.
fn deduplicate_modes(
    mut modes: Vec<LocalMode>,
    parameters: &[Parameter],
    threshold: f64,
) -> Vec<LocalMode> {
    modes.sort_by(|a, b| b.log_posterior.total_cmp(&a.log_posterior));
    let mut kept: Vec<LocalMode> = Vec::with_capacity(modes.len());
    for mode in modes {
        let duplicate = kept
            .iter()
            .any(|other| rescaled_distance(&other.point, &mode.point, parameters) < threshold);
        if duplicate {
            log::debug!("Merging duplicate mode at {:?}", mode.point);
        } else {
            kept.push(mode);
        }
    }
    kept
}

fn with_dof(mixture: Mixture, dof: Option<f64>) -> Result<Mixture, PmcError> {
    let Some(dof) = dof else {
        return Ok(mixture);
    };
    let components = mixture
        .components()
        .iter()
        .map(|c| MixtureComponent::student_t(c.weight(), c.mean().to_vec(), c.covariance().clone(), dof))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Mixture::new(components)?)
}

fn last_step(source: &dyn Checkpoint) -> anyhow::Result<Option<usize>> {
    Ok(source
        .list("/data")?
        .iter()
        .filter_map(|name| name.parse::<usize>().ok())
        .max())
}

/// Adaptive importance sampler.
///
/// All random numbers are drawn on the calling thread from one ChaCha8
/// stream, the posterior is evaluated on the worker pool.
pub struct PopulationMonteCarlo<P: Posterior, C: Checkpoint> {
    settings: PmcSettings,
    pool: WorkerPool<P>,
    mixture: Mixture,
    store: C,
    rng: ChaCha8Rng,
    history: Vec<ChunkStatistics>,
    phase: Phase,
    next_step: usize,
    chunks_done: usize,
}

impl<P: Posterior, C: Checkpoint> PopulationMonteCarlo<P, C> {
    pub fn new(
        posterior: P,
        initialization: Initialization<'_>,
        settings: PmcSettings,
        store: C,
    ) -> Result<Self, PmcError> {
        let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
        let mut pool = WorkerPool::new(&posterior, settings.num_workers)?;
        let dim = posterior.dim();
        let parameters = posterior.parameters().to_vec();

        let mut history = Vec::new();
        let mut next_step = 0;
        let mixture = match initialization {
            Initialization::Explicit(components) => {
                if let Some(component) = components.iter().find(|c| c.dim() != dim) {
                    return Err(PmcError::DimensionMismatch {
                        expected: dim,
                        got: component.dim(),
                    });
                }
                let components = components
                    .into_iter()
                    .map(|component| {
                        if settings.perturbation == 0.0 || !component.is_alive() {
                            return Ok(component);
                        }
                        let draw = component.sample(&mut rng);
                        let mean: Vec<f64> = component
                            .mean()
                            .iter()
                            .zip(&draw)
                            .map(|(m, x)| m + settings.perturbation * (x - m))
                            .collect();
                        MixtureComponent::new(
                            component.weight(),
                            mean,
                            component.covariance().clone(),
                            component.dof(),
                        )
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Mixture::new(components)?
            }
            Initialization::Modes(starts) => {
                if let Some(start) = starts.iter().find(|start| start.len() != dim) {
                    return Err(PmcError::DimensionMismatch {
                        expected: dim,
                        got: start.len(),
                    });
                }
                let found = pool.find_modes(&starts)?;
                let modes: Vec<LocalMode> = starts
                    .into_iter()
                    .zip(found)
                    .map(|(start, mode)| {
                        mode.unwrap_or_else(|| {
                            log::warn!("Local mode search unsupported, starting at {:?}", start);
                            LocalMode {
                                point: start,
                                log_posterior: f64::NEG_INFINITY,
                                covariance: None,
                            }
                        })
                    })
                    .collect();
                let modes =
                    deduplicate_modes(modes, &parameters, settings.mode_distance_threshold);
                if modes.is_empty() {
                    return Err(PmcError::NoModes);
                }
                log::info!("Starting from {} distinct local modes", modes.len());
                let components = modes
                    .into_iter()
                    .map(|mode| {
                        let covariance = mode
                            .covariance
                            .unwrap_or_else(|| prior_covariance(&parameters));
                        MixtureComponent::new(1.0, mode.point, covariance, settings.degrees_of_freedom)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Mixture::new(components)?
            }
            Initialization::GlobalLocal(global_local) => {
                let components = global_local
                    .modes()
                    .iter()
                    .zip(global_local.local_covariances())
                    .zip(global_local.weights())
                    .map(|((mode, covariance), &weight)| {
                        MixtureComponent::new(
                            weight,
                            mode.point.clone(),
                            covariance.clone(),
                            settings.degrees_of_freedom,
                        )
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Mixture::new(components)?
            }
            Initialization::Clustering {
                chains,
                settings: clustering,
            } => {
                let mut posterior = posterior.clone();
                let mixture = bootstrap(chains, &mut posterior, &clustering, None, &mut rng)?;
                with_dof(mixture, settings.degrees_of_freedom)?
            }
            Initialization::Checkpoint { source, step } => {
                let step = match step {
                    Some(step) => step,
                    None => last_step(source)?
                        .ok_or_else(|| anyhow::anyhow!("Checkpoint contains no step"))?,
                };
                let mixture = Mixture::load(source, &join(&chunk_path(Some(step)), "components"))?;
                for previous in 0..=step {
                    let path = join(&chunk_path(Some(previous)), "statistics");
                    if source.contains(&path) {
                        history.push(ChunkStatistics::from_table(&source.read_table(&path)?)?);
                    }
                }
                log::info!("Continuing from step {} of an earlier run", step);
                next_step = step + 1;
                mixture
            }
        };

        if mixture.dim() != dim {
            return Err(PmcError::DimensionMismatch {
                expected: dim,
                got: mixture.dim(),
            });
        }

        let mut sampler = Self {
            settings,
            pool,
            mixture,
            store,
            rng,
            history,
            phase: Phase::PreRun,
            next_step,
            chunks_done: 0,
        };
        let meta = Table::attributes_only()
            .with_attribute("version", FORMAT_VERSION)
            .with_attribute("dimension", dim as f64);
        sampler.store.write_table("/meta", &meta)?;
        Ok(sampler)
    }

    pub fn settings(&self) -> &PmcSettings {
        &self.settings
    }

    pub fn mixture(&self) -> &Mixture {
        &self.mixture
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Statistics of all adaptation chunks so far.
    pub fn statistics(&self) -> &[ChunkStatistics] {
        &self.history
    }

    pub fn store(&self) -> &C {
        &self.store
    }

    pub fn into_store(self) -> C {
        self.store
    }

    fn is_converged(&self) -> bool {
        check_convergence(&self.history, &self.settings.criteria())
    }

    fn write_status(&mut self, step: usize) -> anyhow::Result<()> {
        let status = Table::attributes_only()
            .with_attribute("step", step as f64)
            .with_attribute("converged", if self.is_converged() { 1.0 } else { 0.0 })
            .with_attribute("phase", self.phase.code());
        self.store.write_table("/status", &status)
    }

    /// Draw `n` samples from the mixture and weight them.
    fn draw_weighted(&mut self, n: usize) -> Result<Vec<SampleRecord>, PmcError> {
        let states: Vec<State> = (0..n).map(|_| self.mixture.draw(&mut self.rng)).collect();
        self.weigh(states, true)
    }

    /// Importance weights of `states` under the current posterior and
    /// mixture. Samples outside the bounds get weight zero. Non-finite
    /// densities inside the bounds are an error if `strict`, otherwise they
    /// are treated like samples outside the bounds.
    fn weigh(&mut self, states: Vec<State>, strict: bool) -> Result<Vec<SampleRecord>, PmcError> {
        let inside: Vec<usize> = (0..states.len())
            .filter(|&idx| self.pool.posterior().in_bounds(&states[idx].point))
            .collect();
        let points: Vec<&[f64]> = inside
            .iter()
            .map(|&idx| states[idx].point.as_slice())
            .collect();
        let values = self.pool.evaluate(&points)?;

        let mut log_posteriors = vec![f64::NEG_INFINITY; states.len()];
        for (&idx, value) in inside.iter().zip(values) {
            log_posteriors[idx] = value;
        }
        let mut in_bounds = vec![false; states.len()];
        for &idx in inside.iter() {
            in_bounds[idx] = true;
        }

        states
            .into_iter()
            .zip(log_posteriors)
            .zip(in_bounds)
            .enumerate()
            .map(|(index, ((state, log_posterior), inside))| {
                let log_weight = if inside {
                    let log_proposal = self.mixture.log_density(&state.point);
                    if log_posterior.is_finite() && log_proposal.is_finite() {
                        log_posterior - log_proposal
                    } else if strict {
                        return Err(PmcError::NonFinite {
                            index,
                            log_posterior,
                            log_proposal,
                        });
                    } else {
                        f64::NEG_INFINITY
                    }
                } else {
                    f64::NEG_INFINITY
                };
                Ok(SampleRecord {
                    point: state.point,
                    component: state.component,
                    log_posterior,
                    log_weight,
                })
            })
            .collect()
    }

    /// Run one adaptation chunk.
    pub fn step(&mut self) -> Result<Status, PmcError> {
        if self.phase == Phase::Done {
            return Err(PmcError::Finished);
        }
        let step = self.next_step;
        let live = self.mixture.live_components();
        let n = self.settings.chunk_size * live;
        let samples = self.draw_weighted(n)?;

        let mut log_weights: Vec<f64> = samples.iter().map(|s| s.log_weight).collect();
        crop_highest(&mut log_weights, self.settings.crop_highest_weights);
        let weights = normalize_log_weights(&log_weights).ok_or(PmcError::NoValidSamples(step))?;
        let statistics = ChunkStatistics::from_log_weights(step, &log_weights, &weights, live);

        let states: Vec<State> = samples
            .iter()
            .map(|s| State::evaluated(s.point.clone(), s.component, s.log_posterior))
            .collect();
        let died = self
            .mixture
            .update(&states, &weights, self.settings.dead_component_weight)?;
        if !died.is_empty() {
            log::info!(
                "Components {:?} died, {} live components left",
                died,
                self.mixture.live_components()
            );
        }

        self.history.push(statistics);
        let converged = self.is_converged();
        log::info!(
            "Step {}: {} samples, perplexity {:.4}, effective sample size {:.4}, log evidence {:.4}",
            step,
            n,
            statistics.perplexity,
            statistics.effective_sample_size,
            statistics.log_evidence
        );

        let prefix = chunk_path(Some(step));
        self.mixture
            .dump(&mut self.store, &join(&prefix, "components"))?;
        self.store
            .write_table(&join(&prefix, "statistics"), &statistics.to_table(converged)?)?;
        if self.settings.store_samples {
            let mut samples = samples;
            for (sample, &log_weight) in samples.iter_mut().zip(&log_weights) {
                sample.log_weight = log_weight;
            }
            let table = samples_table(self.mixture.dim(), &samples)?;
            self.store.write_table(&join(&prefix, "samples"), &table)?;
        }

        self.next_step += 1;
        self.chunks_done += 1;
        if converged {
            self.phase = Phase::Converged;
        }
        self.write_status(step)?;
        Ok(Status::new(&statistics, converged))
    }

    /// Adapt until convergence or until the chunk budget is used up.
    pub fn pre_run(&mut self) -> Result<Option<Status>, PmcError> {
        let mut status = None;
        while self.phase == Phase::PreRun {
            if self.chunks_done >= self.settings.chunks {
                log::warn!(
                    "No convergence after {} chunks, continuing with the final chunk",
                    self.chunks_done
                );
                self.phase = Phase::Exhausted;
                self.write_status(self.next_step.saturating_sub(1))?;
                break;
            }
            status = Some(self.step()?);
        }
        if self.phase == Phase::Converged {
            log::info!("Converged after {} chunks", self.chunks_done);
        }
        Ok(status)
    }

    /// Draw the final weighted sample from the current mixture.
    pub fn final_run(&mut self) -> Result<PmcOutput, PmcError> {
        if self.phase == Phase::Done {
            return Err(PmcError::Finished);
        }
        let converged = self.phase == Phase::Converged;
        let samples = self.draw_weighted(self.settings.final_chunk_size)?;
        let log_weights: Vec<f64> = samples.iter().map(|s| s.log_weight).collect();
        let weights =
            normalize_log_weights(&log_weights).ok_or(PmcError::NoValidSamples(self.next_step))?;
        let statistics = ChunkStatistics::from_log_weights(
            self.next_step,
            &log_weights,
            &weights,
            self.mixture.live_components(),
        );
        log::info!(
            "Final chunk: {} samples, perplexity {:.4}, effective sample size {:.4}",
            samples.len(),
            statistics.perplexity,
            statistics.effective_sample_size
        );

        let prefix = chunk_path(None);
        self.mixture
            .dump(&mut self.store, &join(&prefix, "components"))?;
        self.store
            .write_table(&join(&prefix, "statistics"), &statistics.to_table(converged)?)?;
        let table = samples_table(self.mixture.dim(), &samples)?;
        self.store.write_table(&join(&prefix, "samples"), &table)?;

        self.phase = Phase::Done;
        self.write_status(self.next_step)?;
        Ok(PmcOutput {
            samples,
            weights,
            statistics,
            mixture: self.mixture.clone(),
            converged,
        })
    }

    pub fn run(&mut self) -> Result<PmcOutput, PmcError> {
        self.pre_run()?;
        self.final_run()
    }

    /// Weight the samples stored by an earlier run again, under the current
    /// posterior and mixture, without drawing new ones.
    ///
    /// `step` selects the chunk, `None` the final one. Writes `/data/weights`
    /// and `/data/broken`. Samples whose densities are not finite count as
    /// broken.
    pub fn recompute_weights(
        &mut self,
        source: &dyn Checkpoint,
        step: Option<usize>,
    ) -> Result<Vec<SampleRecord>, PmcError> {
        let table = source.read_table(&join(&chunk_path(step), "samples"))?;
        let dim = table.field_width("point")?;
        if dim != self.mixture.dim() {
            return Err(PmcError::DimensionMismatch {
                expected: self.mixture.dim(),
                got: dim,
            });
        }
        let states = (0..table.len())
            .map(|row| {
                Ok(State::new(
                    table.get(row, "point")?.to_vec(),
                    table.scalar(row, "component")? as usize,
                ))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        let samples = self.weigh(states, false)?;

        let mut weights = Table::new(&[("posterior", 1), ("log weight", 1)]);
        let mut broken = Table::new(&[("broken", 1)]);
        for sample in samples.iter() {
            weights.push(&[&[sample.log_posterior], &[sample.log_weight]])?;
            let flag = if sample.log_weight.is_finite() { 0.0 } else { 1.0 };
            broken.push(&[&[flag]])?;
        }
        self.store.write_table("/data/weights", &weights)?;
        self.store.write_table("/data/broken", &broken)?;
        log::info!(
            "Recomputed {} weights, {} broken",
            samples.len(),
            samples.iter().filter(|s| !s.log_weight.is_finite()).count()
        );
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::checkpoint::MemoryCheckpoint;
    use crate::model::test_posteriors::GaussianMixture;
    use crate::proposal::{GlobalLocalSettings, Proposal};

    fn identity(dim: usize, scale: f64) -> Mat<f64> {
        Mat::from_fn(dim, dim, |i, j| if i == j { scale } else { 0.0 })
    }

    fn two_modes() -> GaussianMixture {
        GaussianMixture::new(vec![vec![-3.0, -3.0], vec![3.0, 3.0]], 1.0, 20.0)
    }

    fn settings() -> PmcSettings {
        PmcSettings {
            chunk_size: 500,
            chunks: 4,
            final_chunk_size: 2000,
            seed: 3,
            num_workers: 2,
            store_samples: true,
            ..Default::default()
        }
    }

    fn explicit() -> Initialization<'static> {
        Initialization::Explicit(vec![
            MixtureComponent::gaussian(0.5, vec![-2.5, -3.5], identity(2, 2.0)).unwrap(),
            MixtureComponent::gaussian(0.5, vec![3.5, 2.5], identity(2, 2.0)).unwrap(),
        ])
    }

    #[test]
    fn crop_removes_largest() {
        let mut log_weights = vec![0.0, 3.0, f64::NEG_INFINITY, 2.0, 1.0];
        crop_highest(&mut log_weights, 2);
        assert_eq!(
            log_weights,
            vec![0.0, f64::NEG_INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY, 1.0]
        );
    }

    #[test]
    fn duplicate_modes_are_merged() {
        let parameters = vec![Parameter::new("a", 0.0, 10.0), Parameter::new("b", 0.0, 10.0)];
        let mode = |x: f64, lp: f64| LocalMode {
            point: vec![x, x],
            log_posterior: lp,
            covariance: None,
        };
        let kept = deduplicate_modes(
            vec![mode(1.0, -2.0), mode(1.01, -1.0), mode(5.0, -3.0)],
            &parameters,
            0.05,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].point, vec![1.01, 1.01]);
        assert_eq!(kept[1].point, vec![5.0, 5.0]);
    }

    #[test]
    fn dimension_mismatch() {
        let init = Initialization::Explicit(vec![MixtureComponent::gaussian(
            1.0,
            vec![0.0; 3],
            identity(3, 1.0),
        )
        .unwrap()]);
        let result = PopulationMonteCarlo::new(two_modes(), init, settings(), MemoryCheckpoint::new());
        assert!(matches!(
            result,
            Err(PmcError::DimensionMismatch {
                expected: 2,
                got: 3
            })
        ));
    }

    #[test]
    fn chunks_are_persisted() {
        let mut pmc =
            PopulationMonteCarlo::new(two_modes(), explicit(), settings(), MemoryCheckpoint::new())
                .unwrap();
        let status = pmc.step().unwrap();
        assert_eq!(status.iteration, 0);
        assert!(status.perplexity > 0.0 && status.perplexity <= 1.0);

        let store = pmc.store();
        assert_eq!(store.read_table("/meta").unwrap().attribute("dimension"), Some(2.0));
        let components = store.read_table("/data/0/components").unwrap();
        assert_eq!(components.len(), 2);
        let samples = store.read_table("/data/0/samples").unwrap();
        assert_eq!(samples.len(), 1000);
        assert_eq!(samples.field_width("point").unwrap(), 2);
        let stored = store.read_table("/status").unwrap();
        assert_eq!(stored.attribute("step"), Some(0.0));
    }

    #[test]
    fn weights_are_normalized_and_mixture_adapts() {
        let mut pmc =
            PopulationMonteCarlo::new(two_modes(), explicit(), settings(), MemoryCheckpoint::new())
                .unwrap();
        for _ in 0..3 {
            pmc.step().unwrap();
        }
        let weights = pmc.mixture().weights();
        assert_abs_diff_eq!(weights.iter().sum::<f64>(), 1.0, epsilon = 1e-10);
        let mut means: Vec<Vec<f64>> = pmc
            .mixture()
            .components()
            .iter()
            .map(|c| c.mean().to_vec())
            .collect();
        means.sort_by(|a, b| a[0].total_cmp(&b[0]));
        for (mean, target) in means.iter().zip([-3.0, 3.0]) {
            assert_abs_diff_eq!(mean[0], target, epsilon = 0.3);
            assert_abs_diff_eq!(mean[1], target, epsilon = 0.3);
        }
    }

    #[test]
    fn run_finishes() {
        let mut pmc =
            PopulationMonteCarlo::new(two_modes(), explicit(), settings(), MemoryCheckpoint::new())
                .unwrap();
        let output = pmc.run().unwrap();
        assert_eq!(pmc.phase(), Phase::Done);
        assert_eq!(output.samples.len(), 2000);
        assert_abs_diff_eq!(output.weights.iter().sum::<f64>(), 1.0, epsilon = 1e-10);
        assert!(pmc.store().contains("/data/final/samples"));
        assert!(matches!(pmc.step(), Err(PmcError::Finished)));
        // Two unit Gaussians, the evidence is 1
        assert_abs_diff_eq!(output.statistics.log_evidence, 0.0, epsilon = 0.1);
    }

    #[test]
    fn modes_initialization() {
        let init = Initialization::Modes(vec![
            vec![-2.0, -2.0],
            vec![-3.5, -2.5],
            vec![2.0, 4.0],
        ]);
        let pmc = PopulationMonteCarlo::new(two_modes(), init, settings(), MemoryCheckpoint::new())
            .unwrap();
        assert_eq!(pmc.mixture().live_components(), 2);
    }

    #[test]
    fn student_t_from_global_local() {
        let covariance = identity(2, 1.0);
        let global_local = GlobalLocal::new(
            vec![
                State::evaluated(vec![-3.0, -3.0], 0, -1.0),
                State::evaluated(vec![3.0, 3.0], 1, -1.0),
            ],
            vec![
                Proposal::gaussian(covariance.clone()).unwrap(),
                Proposal::gaussian(covariance.clone()).unwrap(),
            ],
            vec![covariance.clone(), covariance],
            vec![0.3, 0.7],
            GlobalLocalSettings::default(),
        )
        .unwrap();
        let pmc = PopulationMonteCarlo::new(
            two_modes(),
            Initialization::GlobalLocal(&global_local),
            PmcSettings {
                degrees_of_freedom: Some(5.0),
                ..settings()
            },
            MemoryCheckpoint::new(),
        )
        .unwrap();
        assert_eq!(pmc.mixture().dof(), Some(5.0));
        assert_abs_diff_eq!(pmc.mixture().weights()[1], 0.7, epsilon = 1e-12);
    }

    #[test]
    fn continue_from_checkpoint() {
        let mut first =
            PopulationMonteCarlo::new(two_modes(), explicit(), settings(), MemoryCheckpoint::new())
                .unwrap();
        first.step().unwrap();
        first.step().unwrap();
        let store = first.into_store();

        let second = PopulationMonteCarlo::new(
            two_modes(),
            Initialization::Checkpoint {
                source: &store,
                step: None,
            },
            settings(),
            MemoryCheckpoint::new(),
        )
        .unwrap();
        assert_eq!(second.statistics().len(), 2);
        let stored = Mixture::load(&store, "/data/1/components").unwrap();
        assert_eq!(second.mixture().weights(), stored.weights());
    }

    /// Zero density on the positive half of the first axis.
    #[derive(Debug, Clone)]
    struct HalfPlane(GaussianMixture);

    impl Posterior for HalfPlane {
        type Err = Infallible;

        fn parameters(&self) -> &[Parameter] {
            self.0.parameters()
        }

        fn log_posterior(&mut self, point: &[f64]) -> Result<f64, Infallible> {
            if point[0] > 0.0 {
                Ok(f64::NEG_INFINITY)
            } else {
                self.0.log_posterior(point)
            }
        }
    }

    #[test]
    fn non_finite_posterior_in_bounds_fails() {
        let mut pmc = PopulationMonteCarlo::new(
            HalfPlane(two_modes()),
            explicit(),
            settings(),
            MemoryCheckpoint::new(),
        )
        .unwrap();
        match pmc.step() {
            Err(PmcError::NonFinite {
                log_posterior,
                log_proposal,
                ..
            }) => {
                assert_eq!(log_posterior, f64::NEG_INFINITY);
                assert!(log_proposal.is_finite());
            }
            other => panic!("expected a non-finite error, got {:?}", other),
        }
    }

    #[test]
    fn exhausted_budget_still_runs_final_chunk() {
        let settings = PmcSettings {
            chunks: 1,
            minimum_steps: 3,
            ..settings()
        };
        let mut pmc =
            PopulationMonteCarlo::new(two_modes(), explicit(), settings, MemoryCheckpoint::new())
                .unwrap();
        pmc.pre_run().unwrap();
        assert_eq!(pmc.phase(), Phase::Exhausted);
        assert_eq!(pmc.statistics().len(), 1);
        let status = pmc.store().read_table("/status").unwrap();
        assert_eq!(status.attribute("phase"), Some(Phase::Exhausted.code()));

        let output = pmc.final_run().unwrap();
        assert!(!output.converged);
        assert_eq!(pmc.phase(), Phase::Done);
        assert_eq!(output.samples.len(), 2000);
        assert!(pmc.store().contains("/data/final/samples"));
    }

    #[test]
    fn single_component_far_from_target() {
        for offset in [2.0, 4.0, 5.0] {
            let posterior = GaussianMixture::new(vec![vec![0.0, 0.0]], 1.0, 20.0);
            let init = Initialization::Explicit(vec![MixtureComponent::gaussian(
                1.0,
                vec![offset, offset],
                identity(2, 1.0),
            )
            .unwrap()]);
            let settings = PmcSettings {
                chunk_size: 2000,
                chunks: 5,
                ..settings()
            };
            let mut pmc =
                PopulationMonteCarlo::new(posterior, init, settings, MemoryCheckpoint::new())
                    .unwrap();
            let output = pmc.run().unwrap();
            assert_eq!(output.mixture.live_components(), 1);
            assert!(output.mixture.components()[0]
                .mean()
                .iter()
                .all(|m| m.abs() < offset));
        }
    }

    #[test]
    fn recompute_stored_weights() {
        let mut pmc =
            PopulationMonteCarlo::new(two_modes(), explicit(), settings(), MemoryCheckpoint::new())
                .unwrap();
        pmc.step().unwrap();
        let source = pmc.store().clone();
        let samples = pmc.recompute_weights(&source, Some(0)).unwrap();
        assert_eq!(samples.len(), 1000);
        let weights = pmc.store().read_table("/data/weights").unwrap();
        let broken = pmc.store().read_table("/data/broken").unwrap();
        assert_eq!(weights.len(), 1000);
        assert_eq!(broken.len(), 1000);
        assert!(samples.iter().all(|s| s.log_weight.is_finite()));
    }
}
