mod block;
mod global_local;
mod multivariate;

use anyhow::{anyhow, Result};
use faer::Mat;
use rand::Rng;
use thiserror::Error;

pub use block::BlockDecomposition;
pub use global_local::{GlobalLocal, GlobalLocalSettings, HistoryPoints};
pub use multivariate::{
    CovarianceCore, MultivariateGaussian, MultivariateSettings, MultivariateStudentT,
};
pub(crate) use multivariate::check_dof;

use crate::checkpoint::{join, Checkpoint};
use crate::state::State;

#[derive(Error, Debug)]
pub enum ProposalError {
    #[error("Covariance matrix is singular, even without off-diagonal elements")]
    SingularCovariance,
    #[error("Invalid degrees of freedom: {0}")]
    InvalidDof(f64),
    #[error("Jump from component {0} to itself")]
    SelfJump(usize),
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("Jumps from component {origin} to {first} and {second} coincide")]
    DegenerateJumps {
        origin: usize,
        first: usize,
        second: usize,
    },
    #[error("Malformed proposal: {0}")]
    Malformed(String),
}

/// Values of the `kind` attribute in a proposal's `/meta` table.
pub(crate) mod kind {
    pub const GAUSSIAN: f64 = 0.0;
    pub const STUDENT_T: f64 = 1.0;
    pub const BLOCK: f64 = 2.0;
    pub const GLOBAL_LOCAL: f64 = 3.0;
}

/// A Markov kernel `q(x | y)` that can be sampled, evaluated and adapted.
pub trait ProposalFunction: Clone + Send + Sync + std::fmt::Debug {
    fn dim(&self) -> usize;

    /// `log q(x | y)`
    fn evaluate(&self, x: &State, y: &State) -> f64;

    fn propose<R: Rng + ?Sized>(&self, current: &State, rng: &mut R) -> State;

    /// Tune the proposal after a chunk of chain steps.
    ///
    /// `efficiency` is the acceptance rate observed on `history`, the scale
    /// is steered into `[efficiency_min, efficiency_max]`.
    fn adapt(
        &mut self,
        history: &[State],
        efficiency: f64,
        efficiency_min: f64,
        efficiency_max: f64,
    ) -> Result<(), ProposalError>;

    /// Persist the proposal under `prefix`.
    fn dump(&self, store: &mut dyn Checkpoint, prefix: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub enum Proposal {
    Gaussian(MultivariateGaussian),
    StudentT(MultivariateStudentT),
    Block(BlockDecomposition),
    GlobalLocal(GlobalLocal),
}

impl Proposal {
    pub fn gaussian(covariance: Mat<f64>) -> Result<Self, ProposalError> {
        Ok(Proposal::Gaussian(MultivariateGaussian::new(
            covariance,
            MultivariateSettings::default(),
        )?))
    }

    pub fn student_t(covariance: Mat<f64>, dof: f64) -> Result<Self, ProposalError> {
        Ok(Proposal::StudentT(MultivariateStudentT::new(
            covariance,
            dof,
            MultivariateSettings::default(),
        )?))
    }

    pub fn is_multivariate(&self) -> bool {
        matches!(self, Proposal::Gaussian(_) | Proposal::StudentT(_))
    }

    /// Proposal covariance of multivariate kernels.
    pub fn covariance(&self) -> Option<&Mat<f64>> {
        match self {
            Proposal::Gaussian(inner) => Some(inner.covariance()),
            Proposal::StudentT(inner) => Some(inner.covariance()),
            Proposal::Block(_) | Proposal::GlobalLocal(_) => None,
        }
    }

    /// Restore a proposal written with [`ProposalFunction::dump`].
    pub fn load(store: &dyn Checkpoint, prefix: &str) -> Result<Self> {
        let meta = store.read_table(&join(prefix, "meta"))?;
        let kind = meta.require_attribute("kind")?;
        if kind == kind::GAUSSIAN {
            Ok(Proposal::Gaussian(MultivariateGaussian::load(store, prefix)?))
        } else if kind == kind::STUDENT_T {
            Ok(Proposal::StudentT(MultivariateStudentT::load(store, prefix)?))
        } else if kind == kind::BLOCK {
            Ok(Proposal::Block(BlockDecomposition::load(store, prefix)?))
        } else if kind == kind::GLOBAL_LOCAL {
            Ok(Proposal::GlobalLocal(GlobalLocal::load(store, prefix)?))
        } else {
            Err(anyhow!("Unknown proposal kind {} at '{}'", kind, prefix))
        }
    }
}

impl ProposalFunction for Proposal {
    fn dim(&self) -> usize {
        match self {
            Proposal::Gaussian(inner) => inner.dim(),
            Proposal::StudentT(inner) => inner.dim(),
            Proposal::Block(inner) => inner.dim(),
            Proposal::GlobalLocal(inner) => inner.dim(),
        }
    }

    fn evaluate(&self, x: &State, y: &State) -> f64 {
        match self {
            Proposal::Gaussian(inner) => inner.evaluate(x, y),
            Proposal::StudentT(inner) => inner.evaluate(x, y),
            Proposal::Block(inner) => inner.evaluate(x, y),
            Proposal::GlobalLocal(inner) => inner.evaluate(x, y),
        }
    }

    fn propose<R: Rng + ?Sized>(&self, current: &State, rng: &mut R) -> State {
        match self {
            Proposal::Gaussian(inner) => inner.propose(current, rng),
            Proposal::StudentT(inner) => inner.propose(current, rng),
            Proposal::Block(inner) => inner.propose(current, rng),
            Proposal::GlobalLocal(inner) => inner.propose(current, rng),
        }
    }

    fn adapt(
        &mut self,
        history: &[State],
        efficiency: f64,
        efficiency_min: f64,
        efficiency_max: f64,
    ) -> Result<(), ProposalError> {
        match self {
            Proposal::Gaussian(inner) => {
                inner.adapt(history, efficiency, efficiency_min, efficiency_max)
            }
            Proposal::StudentT(inner) => {
                inner.adapt(history, efficiency, efficiency_min, efficiency_max)
            }
            Proposal::Block(inner) => inner.adapt(history, efficiency, efficiency_min, efficiency_max),
            Proposal::GlobalLocal(inner) => {
                inner.adapt(history, efficiency, efficiency_min, efficiency_max)
            }
        }
    }

    fn dump(&self, store: &mut dyn Checkpoint, prefix: &str) -> Result<()> {
        match self {
            Proposal::Gaussian(inner) => inner.dump(store, prefix),
            Proposal::StudentT(inner) => inner.dump(store, prefix),
            Proposal::Block(inner) => inner.dump(store, prefix),
            Proposal::GlobalLocal(inner) => inner.dump(store, prefix),
        }
    }
}

impl From<MultivariateGaussian> for Proposal {
    fn from(value: MultivariateGaussian) -> Self {
        Proposal::Gaussian(value)
    }
}

impl From<MultivariateStudentT> for Proposal {
    fn from(value: MultivariateStudentT) -> Self {
        Proposal::StudentT(value)
    }
}

impl From<BlockDecomposition> for Proposal {
    fn from(value: BlockDecomposition) -> Self {
        Proposal::Block(value)
    }
}

impl From<GlobalLocal> for Proposal {
    fn from(value: GlobalLocal) -> Self {
        Proposal::GlobalLocal(value)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;
    use crate::checkpoint::MemoryCheckpoint;
    use crate::math::unflatten;

    #[test]
    fn load_dispatches_on_kind() {
        let covariance = unflatten(&[1.0, 0.2, 0.2, 0.5], 2);
        let proposals = [
            Proposal::gaussian(covariance.clone()).unwrap(),
            Proposal::student_t(covariance, 4.0).unwrap(),
        ];
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let current = State::new(vec![0.3, -0.2], 0);
        for (idx, proposal) in proposals.iter().enumerate() {
            let prefix = format!("/proposal/{}", idx);
            let mut store = MemoryCheckpoint::new();
            proposal.dump(&mut store, &prefix).unwrap();
            let loaded = Proposal::load(&store, &prefix).unwrap();
            assert_eq!(
                std::mem::discriminant(proposal),
                std::mem::discriminant(&loaded)
            );
            let x = proposal.propose(&current, &mut rng);
            assert_abs_diff_eq!(
                proposal.evaluate(&x, &current),
                loaded.evaluate(&x, &current),
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut store = MemoryCheckpoint::new();
        store
            .write_table(
                "/p/meta",
                &crate::checkpoint::Table::attributes_only().with_attribute("kind", 17.0),
            )
            .unwrap();
        assert!(Proposal::load(&store, "/p").is_err());
    }
}
