use anyhow::{anyhow, Result};
use rand::Rng;

use super::{kind, Proposal, ProposalError, ProposalFunction};
use crate::checkpoint::{join, Checkpoint, Table};
use crate::model::{Parameter, Prior};
use crate::state::State;

/// A multivariate block over a subset of coordinates, with every remaining
/// (nuisance) coordinate drawn independently from its prior.
#[derive(Debug, Clone)]
pub struct BlockDecomposition {
    dim: usize,
    block: Box<Proposal>,
    block_indices: Vec<usize>,
    nuisance: Vec<(usize, Prior)>,
}

impl BlockDecomposition {
    pub fn new(
        dim: usize,
        block: Proposal,
        block_indices: Vec<usize>,
        nuisance: Vec<(usize, Prior)>,
    ) -> Result<Self, ProposalError> {
        if !block.is_multivariate() {
            return Err(ProposalError::Malformed(
                "block must be a multivariate proposal".to_string(),
            ));
        }
        if block.dim() != block_indices.len() {
            return Err(ProposalError::DimensionMismatch {
                expected: block_indices.len(),
                got: block.dim(),
            });
        }
        let mut seen = vec![false; dim];
        for idx in block_indices
            .iter()
            .copied()
            .chain(nuisance.iter().map(|&(idx, _)| idx))
        {
            match seen.get_mut(idx) {
                None => {
                    return Err(ProposalError::Malformed(format!(
                        "coordinate {} out of range for dimension {}",
                        idx, dim
                    )))
                }
                Some(true) => {
                    return Err(ProposalError::Malformed(format!(
                        "coordinate {} is assigned twice",
                        idx
                    )))
                }
                Some(flag) => *flag = true,
            }
        }
        if let Some(missing) = seen.iter().position(|&flag| !flag) {
            return Err(ProposalError::Malformed(format!(
                "coordinate {} is not covered by any block",
                missing
            )));
        }
        Ok(Self {
            dim,
            block: Box::new(block),
            block_indices,
            nuisance,
        })
    }

    /// Block over all non-nuisance parameters, nuisance parameters from
    /// their priors.
    pub fn from_parameters(parameters: &[Parameter], block: Proposal) -> Result<Self, ProposalError> {
        let block_indices = parameters
            .iter()
            .enumerate()
            .filter(|(_, parameter)| !parameter.nuisance)
            .map(|(idx, _)| idx)
            .collect();
        let nuisance = parameters
            .iter()
            .enumerate()
            .filter(|(_, parameter)| parameter.nuisance)
            .map(|(idx, parameter)| (idx, parameter.prior))
            .collect();
        Self::new(parameters.len(), block, block_indices, nuisance)
    }

    pub fn block(&self) -> &Proposal {
        &self.block
    }

    pub fn block_indices(&self) -> &[usize] {
        &self.block_indices
    }

    fn restrict(&self, state: &State) -> State {
        State::new(
            self.block_indices.iter().map(|&idx| state.point[idx]).collect(),
            state.component,
        )
    }

    pub(crate) fn load(store: &dyn Checkpoint, prefix: &str) -> Result<Self> {
        let meta = store.read_table(&join(prefix, "meta"))?;
        let dim = meta.require_attribute("dimension")? as usize;
        let indices = store.read_table(&join(prefix, "indices"))?;
        let block_indices = indices
            .column("index")?
            .into_iter()
            .map(|idx| idx as usize)
            .collect();
        let table = store.read_table(&join(prefix, "nuisance"))?;
        let mut nuisance = Vec::with_capacity(table.len());
        for row in 0..table.len() {
            let prior = Prior::from_row(table.get(row, "prior")?)
                .ok_or_else(|| anyhow!("Unknown prior in row {} of '{}'", row, prefix))?;
            nuisance.push((table.scalar(row, "index")? as usize, prior));
        }
        let block = Proposal::load(store, &join(prefix, "block"))?;
        Ok(Self::new(dim, block, block_indices, nuisance)?)
    }
}

impl ProposalFunction for BlockDecomposition {
    fn dim(&self) -> usize {
        self.dim
    }

    fn evaluate(&self, x: &State, y: &State) -> f64 {
        let block = self.block.evaluate(&self.restrict(x), &self.restrict(y));
        self.nuisance
            .iter()
            .fold(block, |acc, (idx, prior)| acc + prior.log_density(x.point[*idx]))
    }

    fn propose<R: Rng + ?Sized>(&self, current: &State, rng: &mut R) -> State {
        let mut point = current.point.clone();
        let proposed = self.block.propose(&self.restrict(current), rng);
        for (&idx, &value) in self.block_indices.iter().zip(&proposed.point) {
            point[idx] = value;
        }
        for (idx, prior) in self.nuisance.iter() {
            point[*idx] = prior.sample(rng);
        }
        State::new(point, current.component)
    }

    fn adapt(
        &mut self,
        history: &[State],
        efficiency: f64,
        efficiency_min: f64,
        efficiency_max: f64,
    ) -> Result<(), ProposalError> {
        let restricted: Vec<State> = history.iter().map(|state| self.restrict(state)).collect();
        self.block
            .adapt(&restricted, efficiency, efficiency_min, efficiency_max)
    }

    fn dump(&self, store: &mut dyn Checkpoint, prefix: &str) -> Result<()> {
        store.write_table(
            &join(prefix, "meta"),
            &Table::attributes_only()
                .with_attribute("kind", kind::BLOCK)
                .with_attribute("dimension", self.dim as f64),
        )?;
        let mut indices = Table::new(&[("index", 1)]);
        for &idx in self.block_indices.iter() {
            indices.push(&[&[idx as f64]])?;
        }
        store.write_table(&join(prefix, "indices"), &indices)?;

        let mut nuisance = Table::new(&[("index", 1), ("prior", 3)]);
        for (idx, prior) in self.nuisance.iter() {
            nuisance.push(&[&[*idx as f64], &prior.to_row()])?;
        }
        store.write_table(&join(prefix, "nuisance"), &nuisance)?;

        self.block.dump(store, &join(prefix, "block"))
    }
}
