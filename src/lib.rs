//! Population Monte Carlo sampling with adaptive mixture proposals.

pub(crate) mod math;

mod adjacency;
mod chain;
mod checkpoint;
mod clustering;
mod mixture;
mod model;
mod pmc;
mod proposal;
mod sampler_stats;
mod state;
mod worker;

pub use adjacency::AdjacencyMatrix;
pub use chain::{ChainError, ChainHistory, ChainSettings, MarkovChain};
pub use checkpoint::{join, Checkpoint, CsvCheckpoint, Field, MemoryCheckpoint, Table, FORMAT_VERSION};
pub use clustering::{
    bootstrap, filter_components, group_chains, hierarchical_clustering, kl_divergence, patches,
    rvalue, ClusteringError, ClusteringSettings,
};
pub use mixture::{Mixture, MixtureComponent, MixtureError};
pub use model::{test_posteriors, LocalMode, Parameter, Posterior, Prior};
pub use pmc::{
    Initialization, Phase, PmcError, PmcOutput, PmcSettings, PopulationMonteCarlo, SampleRecord,
};
pub use proposal::{
    BlockDecomposition, GlobalLocal, GlobalLocalSettings, HistoryPoints, MultivariateGaussian,
    MultivariateSettings, MultivariateStudentT, Proposal, ProposalError, ProposalFunction,
};
pub use sampler_stats::{
    check_convergence, effective_sample_size, log_evidence, normalize_log_weights, perplexity,
    ChunkStatistics, ConvergenceCriteria, Status,
};
pub use state::State;
pub use worker::{partition, WorkerError, WorkerPool};
