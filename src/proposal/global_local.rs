use anyhow::{anyhow, Result};
use faer::Mat;
use rand::Rng;

use super::{
    kind, MultivariateGaussian, MultivariateSettings, Proposal, ProposalError, ProposalFunction,
};
use crate::adjacency::AdjacencyMatrix;
use crate::chain::ChainHistory;
use crate::checkpoint::{join, Checkpoint, Table};
use crate::math::{draw_index, flatten, sample_mean_covariance, unflatten};
use crate::model::Parameter;
use crate::state::State;

#[derive(Debug, Clone, Copy)]
pub struct GlobalLocalSettings {
    /// Probability to stay within the current component.
    pub local_jump_probability: f64,
    /// Step size of the weight update is `n^(-cooling_power)`.
    pub cooling_power: f64,
    /// Number of history points kept per component.
    pub history_points: usize,
    /// Maximum per-coordinate deviation for a point to count as the target
    /// of a long jump.
    pub jump_tolerance: f64,
}

impl Default for GlobalLocalSettings {
    fn default() -> Self {
        Self {
            local_jump_probability: 0.5,
            cooling_power: 0.5,
            history_points: 100,
            jump_tolerance: 1e-10,
        }
    }
}

/// Selected points of a chain history with sampling probabilities
/// proportional to their posterior.
#[derive(Debug, Clone, Default)]
pub struct HistoryPoints {
    states: Vec<State>,
    probabilities: Vec<f64>,
    cumulative: Vec<f64>,
}

impl HistoryPoints {
    /// Thin `states` evenly down to at most `count` points.
    pub fn from_states(states: &[State], count: usize) -> Self {
        let selected: Vec<State> = if states.len() <= count {
            states.to_vec()
        } else {
            let stride = states.len() as f64 / count as f64;
            (0..count)
                .map(|k| states[(k as f64 * stride) as usize].clone())
                .collect()
        };
        let max = selected
            .iter()
            .map(|state| state.log_posterior)
            .fold(f64::NEG_INFINITY, f64::max);
        let probabilities: Vec<f64> = selected
            .iter()
            .map(|state| (state.log_posterior - max).exp())
            .collect();
        Self::from_parts(selected, probabilities)
    }

    fn from_parts(states: Vec<State>, mut probabilities: Vec<f64>) -> Self {
        let total: f64 = probabilities.iter().sum();
        if total > 0.0 {
            probabilities.iter_mut().for_each(|p| *p /= total);
        }
        let mut cumulative: Vec<f64> = probabilities
            .iter()
            .scan(0.0, |acc, &p| {
                *acc += p;
                Some(*acc)
            })
            .collect();
        if let Some(last) = cumulative.last_mut() {
            *last = 1.0;
        }
        Self {
            states,
            probabilities,
            cumulative,
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn states(&self) -> &[State] {
        &self.states
    }

    pub fn probabilities(&self) -> &[f64] {
        &self.probabilities
    }

    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&State> {
        if self.states.is_empty() {
            return None;
        }
        let u: f64 = rng.random();
        let idx = self.cumulative.partition_point(|&c| c <= u);
        self.states.get(idx.min(self.states.len() - 1))
    }
}

/// Returns the sum of `weights`.
fn check_weights(settings: &GlobalLocalSettings, weights: &[f64]) -> Result<f64, ProposalError> {
    if !(0.0..=1.0).contains(&settings.local_jump_probability) {
        return Err(ProposalError::Malformed(format!(
            "local jump probability {} outside [0, 1]",
            settings.local_jump_probability
        )));
    }
    let total: f64 = weights.iter().sum();
    if weights.iter().any(|&w| !(w >= 0.0)) || !(total > 0.0) {
        return Err(ProposalError::Malformed(
            "weights must be non-negative with a positive sum".to_string(),
        ));
    }
    Ok(total)
}

/// Mixture of local random walks around several modes, combined with long
/// jumps that translate a point from one mode to another.
#[derive(Debug, Clone)]
pub struct GlobalLocal {
    settings: GlobalLocalSettings,
    weights: Vec<f64>,
    adaptations: usize,
    modes: Vec<State>,
    local_proposals: Vec<Proposal>,
    local_covariances: Vec<Mat<f64>>,
    history: Vec<HistoryPoints>,
    adjacency: AdjacencyMatrix,
}

impl GlobalLocal {
    pub fn new(
        modes: Vec<State>,
        local_proposals: Vec<Proposal>,
        local_covariances: Vec<Mat<f64>>,
        weights: Vec<f64>,
        settings: GlobalLocalSettings,
    ) -> Result<Self, ProposalError> {
        let components = modes.len();
        if components == 0 {
            return Err(ProposalError::Malformed("no components".to_string()));
        }
        if local_proposals.len() != components
            || local_covariances.len() != components
            || weights.len() != components
        {
            return Err(ProposalError::Malformed(format!(
                "{} modes, {} local proposals, {} covariances and {} weights",
                components,
                local_proposals.len(),
                local_covariances.len(),
                weights.len()
            )));
        }
        let dim = modes[0].dim();
        for proposal in local_proposals.iter() {
            if proposal.dim() != dim {
                return Err(ProposalError::DimensionMismatch {
                    expected: dim,
                    got: proposal.dim(),
                });
            }
        }
        let total = check_weights(&settings, &weights)?;

        let points: Vec<&[f64]> = modes.iter().map(|mode| mode.point.as_slice()).collect();
        let adjacency = AdjacencyMatrix::from_modes(&points)?;
        adjacency.check_unique(settings.jump_tolerance)?;

        Ok(Self {
            settings,
            weights: weights.iter().map(|w| w / total).collect(),
            adaptations: 0,
            modes,
            local_proposals,
            local_covariances,
            history: vec![HistoryPoints::default(); components],
            adjacency,
        })
    }

    /// One component per group of chains.
    ///
    /// The mode is the best point of the group's post burn-in history, the
    /// local proposal a Gaussian with the history's covariance. Nuisance
    /// coordinates are excluded from the jumps.
    pub fn from_chains(
        parameters: &[Parameter],
        chains: &[ChainHistory],
        groups: &[Vec<usize>],
        skip_initial: f64,
        settings: GlobalLocalSettings,
    ) -> Result<Self, ProposalError> {
        let dim = parameters.len();
        let mut modes = Vec::with_capacity(groups.len());
        let mut local_proposals = Vec::with_capacity(groups.len());
        let mut local_covariances = Vec::with_capacity(groups.len());
        let mut history = Vec::with_capacity(groups.len());

        for (cluster, group) in groups.iter().enumerate() {
            let mut states: Vec<State> = Vec::new();
            for &chain in group.iter() {
                let chain = chains.get(chain).ok_or_else(|| {
                    ProposalError::Malformed(format!("unknown chain {} in group {}", chain, cluster))
                })?;
                states.extend(chain.post_burn_in(skip_initial).iter().cloned());
            }
            if states.len() <= dim {
                return Err(ProposalError::Malformed(format!(
                    "group {} has {} post burn-in points in {} dimensions",
                    cluster,
                    states.len(),
                    dim
                )));
            }
            if let Some(state) = states.iter().find(|state| state.dim() != dim) {
                return Err(ProposalError::DimensionMismatch {
                    expected: dim,
                    got: state.dim(),
                });
            }
            states.iter_mut().for_each(|state| state.component = cluster);

            let best = states
                .iter()
                .max_by(|a, b| a.log_posterior.total_cmp(&b.log_posterior))
                .cloned()
                .ok_or_else(|| ProposalError::Malformed("empty group".to_string()))?;
            let points: Vec<&[f64]> = states.iter().map(|state| state.point.as_slice()).collect();
            let (_, covariance) = sample_mean_covariance(dim, &points);
            local_proposals.push(Proposal::Gaussian(MultivariateGaussian::new(
                covariance.clone(),
                MultivariateSettings::default(),
            )?));
            local_covariances.push(covariance);
            history.push(HistoryPoints::from_states(&states, settings.history_points));
            modes.push(best);
        }

        let weights = vec![1.0; modes.len()];
        let mut proposal = Self::new(modes, local_proposals, local_covariances, weights, settings)?;
        proposal.history = history;

        let significant: Vec<usize> = parameters
            .iter()
            .enumerate()
            .filter(|(_, parameter)| !parameter.nuisance)
            .map(|(idx, _)| idx)
            .collect();
        if significant.len() < dim {
            proposal.restrict_jumps(&significant)?;
        }
        Ok(proposal)
    }

    /// Only coordinates in `subset` take part in long jumps.
    pub fn restrict_jumps(&mut self, subset: &[usize]) -> Result<(), ProposalError> {
        self.adjacency.indices(subset);
        self.adjacency.check_unique(self.settings.jump_tolerance)
    }

    pub fn components(&self) -> usize {
        self.modes.len()
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn modes(&self) -> &[State] {
        &self.modes
    }

    pub fn local_proposals(&self) -> &[Proposal] {
        &self.local_proposals
    }

    pub fn local_covariances(&self) -> &[Mat<f64>] {
        &self.local_covariances
    }

    pub fn history(&self, cluster: usize) -> Option<&HistoryPoints> {
        self.history.get(cluster)
    }

    pub fn adjacency(&self) -> &AdjacencyMatrix {
        &self.adjacency
    }

    pub fn settings(&self) -> &GlobalLocalSettings {
        &self.settings
    }

    /// Draw one of the stored history points of `cluster`, see
    /// [`MarkovChain::from_history`](crate::MarkovChain::from_history).
    pub fn draw_history_point<R: Rng + ?Sized>(
        &self,
        cluster: usize,
        rng: &mut R,
    ) -> Result<State, ProposalError> {
        self.history
            .get(cluster)
            .and_then(|history| history.draw(rng))
            .cloned()
            .ok_or_else(|| ProposalError::Malformed(format!("no history points for {}", cluster)))
    }

    fn other_live(&self, from: usize) -> bool {
        self.weights
            .iter()
            .enumerate()
            .any(|(c, &w)| c != from && w > 0.0)
    }

    fn local_probability(&self, from: usize) -> f64 {
        if self.other_live(from) {
            self.settings.local_jump_probability
        } else {
            1.0
        }
    }

    /// Probability of each move type when starting in component `from`:
    /// the local move at index `from`, long jumps to `c` at index `c`.
    pub fn branch_weights(&self, from: usize) -> Vec<f64> {
        let p_local = self.local_probability(from);
        let rest = 1.0 - self.weights.get(from).copied().unwrap_or(0.0);
        self.weights
            .iter()
            .enumerate()
            .map(|(c, &w)| {
                if c == from {
                    p_local
                } else if w > 0.0 && rest > 0.0 {
                    (1.0 - p_local) * w / rest
                } else {
                    0.0
                }
            })
            .collect()
    }

    pub(crate) fn load(store: &dyn Checkpoint, prefix: &str) -> Result<Self> {
        let meta = store.read_table(&join(prefix, "meta"))?;
        let dim = meta.require_attribute("dimension")? as usize;

        let table = store.read_table(&join(prefix, "components"))?;
        let jumps = store.read_table(&join(prefix, "jump"))?;
        let settings = GlobalLocalSettings {
            local_jump_probability: table.require_attribute("local jump probability")?,
            cooling_power: table.require_attribute("cooling power")?,
            history_points: table.require_attribute("history points")? as usize,
            jump_tolerance: jumps.require_attribute("tolerance")?,
        };
        let adaptations = table.require_attribute("adaptations")? as usize;
        let weights = table.column("probability")?;
        let components = weights.len();

        let stored = (0..jumps.len())
            .map(|row| jumps.get(row, "jump").map(|jump| jump.to_vec()))
            .collect::<Result<Vec<_>>>()?;
        let adjacency = AdjacencyMatrix::from_jumps(components, dim, stored)?;
        check_weights(&settings, &weights)?;
        adjacency.check_unique(settings.jump_tolerance)?;

        let table = store.read_table(&join(prefix, "modes"))?;
        let modes = (0..table.len())
            .map(|row| {
                Ok(State::evaluated(
                    table.get(row, "point")?.to_vec(),
                    row,
                    table.scalar(row, "posterior")?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        if modes.len() != components {
            return Err(anyhow!(
                "{} modes for {} components at '{}'",
                modes.len(),
                components,
                prefix
            ));
        }

        let mut local_proposals = Vec::with_capacity(components);
        let mut local_covariances = Vec::with_capacity(components);
        let mut history = Vec::with_capacity(components);
        for cluster in 0..components {
            let name = cluster.to_string();
            local_proposals.push(Proposal::load(
                store,
                &join(&join(prefix, "local proposals"), &name),
            )?);
            let table = store.read_table(&join(&join(prefix, "local covariances"), &name))?;
            let values = table.get(0, "covariance")?;
            if values.len() != dim * dim {
                return Err(anyhow!("Local covariance {} is not {}x{}", cluster, dim, dim));
            }
            local_covariances.push(unflatten(values, dim));

            let path = join(&join(prefix, "history"), &name);
            let points = if store.contains(&path) {
                let table = store.read_table(&path)?;
                let mut states = Vec::with_capacity(table.len());
                for row in 0..table.len() {
                    states.push(State::evaluated(
                        table.get(row, "point")?.to_vec(),
                        cluster,
                        table.scalar(row, "posterior")?,
                    ));
                }
                HistoryPoints::from_parts(states, table.column("probability")?)
            } else {
                HistoryPoints::default()
            };
            history.push(points);
        }

        Ok(Self {
            settings,
            weights,
            adaptations,
            modes,
            local_proposals,
            local_covariances,
            history,
            adjacency,
        })
    }
}

impl ProposalFunction for GlobalLocal {
    fn dim(&self) -> usize {
        self.adjacency.dim()
    }

    fn evaluate(&self, x: &State, y: &State) -> f64 {
        let from = y.component;
        let to = x.component;
        if from >= self.components() || to >= self.components() {
            return f64::NEG_INFINITY;
        }
        let p_local = self.local_probability(from);

        // A point is either a local move or the exact target of one jump,
        // so at most one of the two terms contributes.
        if to == from {
            if p_local > 0.0 {
                return p_local.ln() + self.local_proposals[from].evaluate(x, y);
            }
            return f64::NEG_INFINITY;
        }

        let weight = self.weights[to];
        let rest = 1.0 - self.weights[from];
        if weight <= 0.0 || rest <= 0.0 || p_local >= 1.0 {
            return f64::NEG_INFINITY;
        }
        let hit = self
            .adjacency
            .lands_on(from, to, &y.point, &x.point, self.settings.jump_tolerance)
            .unwrap_or(false);
        if hit {
            ((1.0 - p_local) * weight / rest).ln()
        } else {
            f64::NEG_INFINITY
        }
    }

    fn propose<R: Rng + ?Sized>(&self, current: &State, rng: &mut R) -> State {
        let from = current.component.min(self.components() - 1);
        let u: f64 = rng.random();
        if u < self.local_probability(from) {
            let mut next = self.local_proposals[from].propose(current, rng);
            next.component = from;
            return next;
        }

        let to = loop {
            let candidate = draw_index(&self.weights, rng.random());
            if candidate != from {
                break candidate;
            }
        };
        let mut point = vec![0f64; self.dim()];
        match self.adjacency.apply(from, to, &current.point, &mut point) {
            Ok(()) => State::new(point, to),
            Err(_) => State::new(current.point.clone(), from),
        }
    }

    /// Robbins-Monro update of the component weights towards the fraction of
    /// `history` in each component.
    fn adapt(
        &mut self,
        history: &[State],
        _efficiency: f64,
        _efficiency_min: f64,
        _efficiency_max: f64,
    ) -> Result<(), ProposalError> {
        if history.is_empty() {
            return Ok(());
        }
        self.adaptations += 1;
        let gamma = (self.adaptations as f64).powf(-self.settings.cooling_power);

        let mut counts = vec![0usize; self.components()];
        for state in history.iter() {
            if let Some(count) = counts.get_mut(state.component) {
                *count += 1;
            }
        }
        let n = history.len() as f64;
        let updated: Vec<f64> = self
            .weights
            .iter()
            .zip(&counts)
            .map(|(&w, &count)| {
                if w > 0.0 {
                    (1.0 - gamma) * w + gamma * count as f64 / n
                } else {
                    0.0
                }
            })
            .collect();
        let total: f64 = updated.iter().sum();
        if total > 0.0 {
            self.weights = updated.iter().map(|w| w / total).collect();
        } else {
            log::warn!("No history point belongs to a live component, weights unchanged");
        }
        Ok(())
    }

    fn dump(&self, store: &mut dyn Checkpoint, prefix: &str) -> Result<()> {
        let dim = self.dim();
        store.write_table(
            &join(prefix, "meta"),
            &Table::attributes_only()
                .with_attribute("kind", kind::GLOBAL_LOCAL)
                .with_attribute("dimension", dim as f64),
        )?;

        let mut components = Table::new(&[("probability", 1)])
            .with_attribute("adaptations", self.adaptations as f64)
            .with_attribute("local jump probability", self.settings.local_jump_probability)
            .with_attribute("cooling power", self.settings.cooling_power)
            .with_attribute("history points", self.settings.history_points as f64);
        for &w in self.weights.iter() {
            components.push(&[&[w]])?;
        }
        store.write_table(&join(prefix, "components"), &components)?;

        let mut jumps = Table::new(&[("jump", dim)])
            .with_attribute("tolerance", self.settings.jump_tolerance);
        for jump in self.adjacency.stored() {
            jumps.push(&[jump])?;
        }
        store.write_table(&join(prefix, "jump"), &jumps)?;

        let mut modes = Table::new(&[("point", dim), ("posterior", 1)]);
        for mode in self.modes.iter() {
            modes.push(&[&mode.point, &[mode.log_posterior]])?;
        }
        store.write_table(&join(prefix, "modes"), &modes)?;

        for cluster in 0..self.components() {
            let name = cluster.to_string();
            let points = &self.history[cluster];
            if !points.is_empty() {
                let mut table = Table::new(&[
                    ("point", dim),
                    ("posterior", 1),
                    ("probability", 1),
                    ("cumulative", 1),
                ]);
                for ((state, &p), &c) in points
                    .states
                    .iter()
                    .zip(&points.probabilities)
                    .zip(&points.cumulative)
                {
                    table.push(&[&state.point, &[state.log_posterior], &[p], &[c]])?;
                }
                store.write_table(&join(&join(prefix, "history"), &name), &table)?;
            }

            self.local_proposals[cluster]
                .dump(store, &join(&join(prefix, "local proposals"), &name))?;

            let mut covariance = Table::new(&[("covariance", dim * dim)]);
            covariance.push(&[&flatten(&self.local_covariances[cluster])])?;
            store.write_table(&join(&join(prefix, "local covariances"), &name), &covariance)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, StandardNormal};

    use super::*;
    use crate::checkpoint::MemoryCheckpoint;
    use crate::model::Prior;

    fn identity() -> Mat<f64> {
        unflatten(&[1.0, 0.0, 0.0, 1.0], 2)
    }

    fn three_modes(p_local: f64) -> GlobalLocal {
        let modes = vec![
            State::evaluated(vec![0.0, 0.0], 0, -1.0),
            State::evaluated(vec![10.0, 0.0], 1, -2.0),
            State::evaluated(vec![0.0, 10.0], 2, -3.0),
        ];
        let proposals = (0..3).map(|_| Proposal::gaussian(identity()).unwrap()).collect();
        let covariances = vec![identity(); 3];
        let settings = GlobalLocalSettings {
            local_jump_probability: p_local,
            ..Default::default()
        };
        GlobalLocal::new(modes, proposals, covariances, vec![2.0, 1.0, 1.0], settings).unwrap()
    }

    #[test]
    fn branch_weights_are_a_distribution() {
        for p_local in [0.0, 0.3, 1.0] {
            let proposal = three_modes(p_local);
            for from in 0..3 {
                let branches = proposal.branch_weights(from);
                let total: f64 = branches.iter().sum();
                assert!(total <= 1.0 + 1e-12);
                assert_abs_diff_eq!(total, 1.0, epsilon = 1e-12);
                assert_abs_diff_eq!(branches[from], p_local);
            }
        }
    }

    #[test]
    fn long_jumps_land_on_translated_point() {
        let proposal = three_modes(0.0);
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let start = State::new(vec![0.5, -0.5], 0);
        let mut hits = [0usize; 3];
        for _ in 0..2000 {
            let next = proposal.propose(&start, &mut rng);
            assert_ne!(next.component, 0);
            hits[next.component] += 1;
            let expected = proposal.adjacency().jump(0, next.component).unwrap();
            assert_abs_diff_eq!(next.point[0], 0.5 + expected[0], epsilon = 1e-12);
            // weights 0.5, 0.25, 0.25 → conditional 0.5 each
            assert_abs_diff_eq!(proposal.evaluate(&next, &start), 0.5f64.ln(), epsilon = 1e-12);
        }
        assert!((hits[1] as f64 / 2000.0 - 0.5).abs() < 0.05);

        let back = State::new(vec![0.5, -0.5], 1);
        assert_eq!(proposal.evaluate(&back, &start), f64::NEG_INFINITY);
    }

    #[test]
    fn local_move_keeps_component() {
        let proposal = three_modes(1.0);
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        let start = State::new(vec![10.0, 0.0], 1);
        let next = proposal.propose(&start, &mut rng);
        assert_eq!(next.component, 1);
        let local = proposal.local_proposals()[1].evaluate(&next, &start);
        assert_abs_diff_eq!(proposal.evaluate(&next, &start), local, epsilon = 1e-12);
    }

    #[test]
    fn adapt_keeps_dead_components() {
        let mut proposal = three_modes(0.5);
        proposal.weights = vec![0.5, 0.5, 0.0];
        let history: Vec<State> = (0..10)
            .map(|k| State::new(vec![0.0, 0.0], if k < 8 { 0 } else { 2 }))
            .collect();
        proposal.adapt(&history, 0.2, 0.1, 0.4).unwrap();
        let weights = proposal.weights();
        assert_eq!(weights[2], 0.0);
        assert_abs_diff_eq!(weights.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert!(weights.iter().all(|&w| w >= 0.0));
        // γ = 1 on the first update
        assert_abs_diff_eq!(weights[0], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn only_remaining_component_moves_locally() {
        let mut proposal = three_modes(0.0);
        proposal.weights = vec![1.0, 0.0, 0.0];
        let mut rng = ChaCha8Rng::seed_from_u64(8);
        let start = State::new(vec![0.0, 0.0], 0);
        for _ in 0..20 {
            assert_eq!(proposal.propose(&start, &mut rng).component, 0);
        }
        assert_eq!(proposal.branch_weights(0), vec![1.0, 0.0, 0.0]);
    }

    fn chain(center: [f64; 2], rng: &mut ChaCha8Rng) -> ChainHistory {
        let states = (0..400)
            .map(|_| {
                let point: Vec<f64> = center
                    .iter()
                    .map(|c| c + Distribution::<f64>::sample(&StandardNormal, &mut *rng))
                    .collect();
                let lp = -0.5 * point.iter().zip(&center).map(|(x, c)| (x - c).powi(2)).sum::<f64>();
                State::evaluated(point, 0, lp)
            })
            .collect();
        ChainHistory::new(states, 200)
    }

    #[test]
    fn build_from_chains() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let chains = vec![
            chain([-5.0, -5.0], &mut rng),
            chain([-5.0, -5.0], &mut rng),
            chain([5.0, 5.0], &mut rng),
        ];
        let parameters = vec![
            Parameter::new("x", -20.0, 20.0),
            Parameter::new("n", -20.0, 20.0).nuisance(Prior::Uniform { min: -20.0, max: 20.0 }),
        ];
        let settings = GlobalLocalSettings {
            history_points: 50,
            ..Default::default()
        };
        let proposal =
            GlobalLocal::from_chains(&parameters, &chains, &[vec![0, 1], vec![2]], 0.2, settings)
                .unwrap();
        assert_eq!(proposal.components(), 2);
        assert_eq!(proposal.history(0).unwrap().len(), 50);
        assert!((proposal.modes()[1].point[0] - 5.0).abs() < 1.0);
        assert_eq!(proposal.adjacency().jump(0, 1).unwrap()[1], 0.0);
        assert!((proposal.local_covariances()[0][(0, 0)] - 1.0).abs() < 0.3);

        let start = proposal.draw_history_point(1, &mut rng).unwrap();
        assert_eq!(start.component, 1);
        assert!(proposal.draw_history_point(7, &mut rng).is_err());

        let mut store = MemoryCheckpoint::new();
        proposal.dump(&mut store, "/global").unwrap();
        let loaded = match Proposal::load(&store, "/global").unwrap() {
            Proposal::GlobalLocal(inner) => inner,
            other => panic!("unexpected proposal {:?}", other),
        };
        assert_eq!(loaded.weights(), proposal.weights());
        assert_eq!(loaded.adjacency(), proposal.adjacency());
        assert_eq!(loaded.history(1).unwrap().len(), 50);
        for _ in 0..20 {
            let x = proposal.propose(&start, &mut rng);
            assert_abs_diff_eq!(
                loaded.evaluate(&x, &start),
                proposal.evaluate(&x, &start),
                epsilon = 1e-9
            );
        }
    }

    #[test]
    fn reverse_jumps_between_distant_modes() {
        let modes = vec![
            State::evaluated(vec![0.3, 0.0], 0, -1.0),
            State::evaluated(vec![1e6 + 0.7, 3e6 + 0.1], 1, -1.0),
        ];
        let proposals = (0..2).map(|_| Proposal::gaussian(identity()).unwrap()).collect();
        let settings = GlobalLocalSettings {
            local_jump_probability: 0.0,
            ..Default::default()
        };
        let proposal =
            GlobalLocal::new(modes, proposals, vec![identity(); 2], vec![1.0, 1.0], settings)
                .unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(21);
        for _ in 0..100 {
            let point: Vec<f64> = [0.3, 0.0]
                .iter()
                .map(|c| c + Distribution::<f64>::sample(&StandardNormal, &mut rng))
                .collect();
            let start = State::new(point, 0);
            let next = proposal.propose(&start, &mut rng);
            assert_eq!(next.component, 1);
            assert_eq!(proposal.evaluate(&next, &start), 0.0);
            assert_eq!(proposal.evaluate(&start, &next), 0.0);
        }
    }

    #[test]
    fn load_rejects_inconsistent_tables() {
        let proposal = three_modes(0.5);
        let mut store = MemoryCheckpoint::new();
        proposal.dump(&mut store, "/g").unwrap();
        assert!(Proposal::load(&store, "/g").is_ok());

        let mut coinciding = store.clone();
        let mut jumps = Table::new(&[("jump", 2)]).with_attribute("tolerance", 1e-10);
        for jump in [[10.0, 0.0], [10.0, 0.0], [0.0, 0.0]] {
            jumps.push(&[&jump]).unwrap();
        }
        coinciding.write_table("/g/jump", &jumps).unwrap();
        assert!(Proposal::load(&coinciding, "/g").is_err());

        let mut negative = store.clone();
        let mut components = Table::new(&[("probability", 1)])
            .with_attribute("adaptations", 0.0)
            .with_attribute("local jump probability", 0.5)
            .with_attribute("cooling power", 0.5)
            .with_attribute("history points", 100.0);
        for w in [0.8, -0.3, 0.5] {
            components.push(&[&[w]]).unwrap();
        }
        negative.write_table("/g/components", &components).unwrap();
        assert!(Proposal::load(&negative, "/g").is_err());
    }

    #[test]
    fn history_points_follow_posterior() {
        let states = vec![
            State::evaluated(vec![0.0], 0, 0.0),
            State::evaluated(vec![1.0], 0, 2f64.ln()),
        ];
        let points = HistoryPoints::from_states(&states, 10);
        assert_abs_diff_eq!(points.probabilities()[1], 2.0 / 3.0, epsilon = 1e-12);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let ones = (0..3000)
            .filter(|_| points.draw(&mut rng).unwrap().point[0] == 1.0)
            .count();
        assert!((ones as f64 / 3000.0 - 2.0 / 3.0).abs() < 0.03);
    }
}
