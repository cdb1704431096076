use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

use crate::model::Posterior;
use crate::proposal::{GlobalLocal, Proposal, ProposalError, ProposalFunction};
use crate::state::State;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Posterior evaluation failed")]
    PosteriorFailure(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Start point {0:?} is outside of the parameter bounds")]
    OutOfBounds(Vec<f64>),
    #[error("Posterior is not finite at the start point")]
    NonFinite,
    #[error(transparent)]
    Proposal(#[from] ProposalError),
}

/// Sequence of states visited by a chain.
#[derive(Debug, Clone, Default)]
pub struct ChainHistory {
    states: Vec<State>,
    accepted: usize,
}

impl ChainHistory {
    pub fn new(states: Vec<State>, accepted: usize) -> Self {
        Self { states, accepted }
    }

    pub fn states(&self) -> &[State] {
        &self.states
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Fraction of accepted proposals.
    pub fn efficiency(&self) -> f64 {
        if self.states.is_empty() {
            0.0
        } else {
            self.accepted as f64 / self.states.len() as f64
        }
    }

    /// The states after dropping the first `skip_initial` fraction.
    pub fn post_burn_in(&self, skip_initial: f64) -> &[State] {
        let skip = (skip_initial.clamp(0.0, 1.0) * self.states.len() as f64).floor() as usize;
        &self.states[skip..]
    }

    pub fn extend(&mut self, other: ChainHistory) {
        self.states.extend(other.states);
        self.accepted += other.accepted;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChainSettings {
    /// Number of steps between two proposal adaptations.
    pub prerun_chunk_size: usize,
    /// Maximum number of adaptations before giving up.
    pub prerun_chunks: usize,
    /// Target interval of the acceptance rate.
    pub efficiency_min: f64,
    pub efficiency_max: f64,
    pub seed: u64,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            prerun_chunk_size: 1000,
            prerun_chunks: 20,
            efficiency_min: 0.1,
            efficiency_max: 0.4,
            seed: 42,
        }
    }
}

/// Metropolis-Hastings chain with an adaptive proposal.
pub struct MarkovChain<P: Posterior> {
    posterior: P,
    proposal: Proposal,
    settings: ChainSettings,
    rng: ChaCha8Rng,
    current: State,
}

impl<P: Posterior> MarkovChain<P> {
    pub fn new(
        mut posterior: P,
        proposal: Proposal,
        start: State,
        settings: ChainSettings,
        chain: u64,
    ) -> Result<Self, ChainError> {
        if proposal.dim() != posterior.dim() {
            return Err(ProposalError::DimensionMismatch {
                expected: posterior.dim(),
                got: proposal.dim(),
            }
            .into());
        }
        if !posterior.in_bounds(&start.point) {
            return Err(ChainError::OutOfBounds(start.point));
        }
        let log_posterior = posterior
            .log_posterior(&start.point)
            .map_err(|err| ChainError::PosteriorFailure(Box::new(err)))?;
        if !log_posterior.is_finite() {
            return Err(ChainError::NonFinite);
        }

        let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
        rng.set_stream(chain);
        Ok(Self {
            posterior,
            proposal,
            settings,
            rng,
            current: State::evaluated(start.point, start.component, log_posterior),
        })
    }

    /// Start a chain with a [`GlobalLocal`] proposal at one of the history
    /// points of `cluster`.
    pub fn from_history(
        posterior: P,
        global_local: GlobalLocal,
        cluster: usize,
        settings: ChainSettings,
        chain: u64,
    ) -> Result<Self, ChainError> {
        let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
        rng.set_stream(chain);
        let start = global_local.draw_history_point(cluster, &mut rng)?;
        let mut sampler = Self::new(
            posterior,
            Proposal::GlobalLocal(global_local),
            start,
            settings,
            chain,
        )?;
        sampler.rng = rng;
        Ok(sampler)
    }

    pub fn current(&self) -> &State {
        &self.current
    }

    pub fn proposal(&self) -> &Proposal {
        &self.proposal
    }

    pub fn into_proposal(self) -> Proposal {
        self.proposal
    }

    /// One Metropolis-Hastings step. Returns whether the proposal was accepted.
    pub fn step(&mut self) -> Result<bool, ChainError> {
        let mut next = self.proposal.propose(&self.current, &mut self.rng);
        if !self.posterior.in_bounds(&next.point) {
            return Ok(false);
        }
        next.log_posterior = self
            .posterior
            .log_posterior(&next.point)
            .map_err(|err| ChainError::PosteriorFailure(Box::new(err)))?;
        if !next.log_posterior.is_finite() {
            return Ok(false);
        }

        let log_alpha = next.log_posterior - self.current.log_posterior
            + self.proposal.evaluate(&self.current, &next)
            - self.proposal.evaluate(&next, &self.current);
        let u: f64 = self.rng.random();
        if u.ln() < log_alpha {
            self.current = next;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn run(&mut self, steps: usize) -> Result<ChainHistory, ChainError> {
        let mut states = Vec::with_capacity(steps);
        let mut accepted = 0;
        for _ in 0..steps {
            if self.step()? {
                accepted += 1;
            }
            states.push(self.current.clone());
        }
        Ok(ChainHistory::new(states, accepted))
    }

    /// Alternate chunks of steps with proposal adaptation until the
    /// acceptance rate falls into the target interval.
    ///
    /// Returns the combined history and whether the target was reached.
    pub fn prerun(&mut self) -> Result<(ChainHistory, bool), ChainError> {
        let mut combined = ChainHistory::default();
        for chunk in 0..self.settings.prerun_chunks {
            let history = self.run(self.settings.prerun_chunk_size)?;
            let efficiency = history.efficiency();
            log::debug!("Pre-run chunk {}: efficiency {:.3}", chunk, efficiency);
            self.proposal.adapt(
                history.states(),
                efficiency,
                self.settings.efficiency_min,
                self.settings.efficiency_max,
            )?;
            combined.extend(history);
            if (self.settings.efficiency_min..=self.settings.efficiency_max).contains(&efficiency) {
                return Ok((combined, true));
            }
        }
        log::warn!(
            "Pre-run did not reach the target efficiency after {} chunks",
            self.settings.prerun_chunks
        );
        Ok((combined, false))
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use faer::Mat;

    use super::*;
    use crate::model::test_posteriors::GaussianMixture;

    fn chain(scale: f64) -> MarkovChain<GaussianMixture> {
        let posterior = GaussianMixture::new(vec![vec![1.0, -1.0]], 1.0, 20.0);
        let covariance = Mat::from_fn(2, 2, |i, j| if i == j { scale } else { 0.0 });
        let proposal = Proposal::gaussian(covariance).unwrap();
        MarkovChain::new(
            posterior,
            proposal,
            State::new(vec![0.0, 0.0], 0),
            ChainSettings {
                prerun_chunk_size: 500,
                ..Default::default()
            },
            0,
        )
        .unwrap()
    }

    #[test]
    fn samples_target() {
        let mut chain = chain(2.0);
        let (_, reached) = chain.prerun().unwrap();
        assert!(reached);
        let history = chain.run(20_000).unwrap();
        let mean: f64 = history.states().iter().map(|s| s.point[0]).sum::<f64>()
            / history.len() as f64;
        assert_abs_diff_eq!(mean, 1.0, epsilon = 0.15);
        assert!(history.states().iter().all(|s| s.is_evaluated()));
    }

    #[test]
    fn prerun_shrinks_a_wide_proposal() {
        let mut chain = chain(400.0);
        let before = chain.proposal().covariance().unwrap()[(0, 0)];
        chain.prerun().unwrap();
        let after = chain.proposal().covariance().unwrap()[(0, 0)];
        assert!(after < before);
    }

    #[test]
    fn start_outside_bounds() {
        let posterior = GaussianMixture::new(vec![vec![0.0]], 1.0, 1.0);
        let proposal = Proposal::gaussian(Mat::from_fn(1, 1, |_, _| 1.0)).unwrap();
        let result = MarkovChain::new(
            posterior,
            proposal,
            State::new(vec![3.0], 0),
            ChainSettings::default(),
            0,
        );
        assert!(matches!(result, Err(ChainError::OutOfBounds(_))));
    }

    #[test]
    fn start_from_global_local_history() {
        let posterior = GaussianMixture::new(vec![vec![-4.0, -4.0], vec![4.0, 4.0]], 1.0, 20.0);
        let mut histories = Vec::new();
        for (idx, center) in [-4.0, 4.0].into_iter().enumerate() {
            let proposal = Proposal::gaussian(Mat::from_fn(2, 2, |i, j| if i == j { 1.0 } else { 0.0 }))
                .unwrap();
            let mut chain = MarkovChain::new(
                posterior.clone(),
                proposal,
                State::new(vec![center, center], 0),
                ChainSettings::default(),
                idx as u64,
            )
            .unwrap();
            histories.push(chain.run(500).unwrap());
        }
        let global_local = GlobalLocal::from_chains(
            posterior.parameters(),
            &histories,
            &[vec![0], vec![1]],
            0.2,
            Default::default(),
        )
        .unwrap();

        let mut chain =
            MarkovChain::from_history(posterior, global_local, 1, ChainSettings::default(), 3)
                .unwrap();
        assert_eq!(chain.current().component, 1);
        assert!(chain.current().point.iter().all(|&x| x > 0.0));
        assert!(chain.current().is_evaluated());
        let history = chain.run(2000).unwrap();
        assert!(history.states().iter().any(|s| s.component == 0));
        assert!(history.states().iter().any(|s| s.component == 1));
    }

    #[test]
    fn burn_in_is_skipped() {
        let states = (0..10).map(|k| State::new(vec![k as f64], 0)).collect();
        let history = ChainHistory::new(states, 5);
        assert_eq!(history.post_burn_in(0.3).len(), 7);
        assert_eq!(history.post_burn_in(0.3)[0].point[0], 3.0);
        assert_eq!(history.efficiency(), 0.5);
    }
}
