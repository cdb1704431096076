use std::f64::consts::PI;

use faer::Mat;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

/// Prior distribution of a single parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Prior {
    Uniform { min: f64, max: f64 },
    Gaussian { mean: f64, sigma: f64 },
}

impl Prior {
    pub fn mean(&self) -> f64 {
        match *self {
            Prior::Uniform { min, max } => 0.5 * (min + max),
            Prior::Gaussian { mean, .. } => mean,
        }
    }

    pub fn variance(&self) -> f64 {
        match *self {
            Prior::Uniform { min, max } => (max - min) * (max - min) / 12.0,
            Prior::Gaussian { sigma, .. } => sigma * sigma,
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match *self {
            Prior::Uniform { min, max } => min + (max - min) * rng.random::<f64>(),
            Prior::Gaussian { mean, sigma } => {
                let z: f64 = StandardNormal.sample(rng);
                mean + sigma * z
            }
        }
    }

    pub fn log_density(&self, x: f64) -> f64 {
        match *self {
            Prior::Uniform { min, max } => {
                if (min..=max).contains(&x) {
                    -(max - min).ln()
                } else {
                    f64::NEG_INFINITY
                }
            }
            Prior::Gaussian { mean, sigma } => {
                let z = (x - mean) / sigma;
                -0.5 * z * z - sigma.ln() - 0.5 * (2.0 * PI).ln()
            }
        }
    }

    pub(crate) fn kind(&self) -> f64 {
        match self {
            Prior::Uniform { .. } => 0.0,
            Prior::Gaussian { .. } => 1.0,
        }
    }

    pub(crate) fn to_row(self) -> [f64; 3] {
        match self {
            Prior::Uniform { min, max } => [self.kind(), min, max],
            Prior::Gaussian { mean, sigma } => [self.kind(), mean, sigma],
        }
    }

    pub(crate) fn from_row(row: &[f64]) -> Option<Self> {
        match row {
            [kind, a, b] if *kind == 0.0 => Some(Prior::Uniform { min: *a, max: *b }),
            [kind, a, b] if *kind == 1.0 => Some(Prior::Gaussian {
                mean: *a,
                sigma: *b,
            }),
            _ => None,
        }
    }
}

/// Descriptor of one coordinate of parameter space.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    /// Inclusive lower bound
    pub min: f64,
    /// Inclusive upper bound
    pub max: f64,
    /// Nuisance parameters are resampled from their prior by block proposals
    /// and excluded from long range jumps.
    pub nuisance: bool,
    pub prior: Prior,
}

impl Parameter {
    pub fn new(name: impl Into<String>, min: f64, max: f64) -> Self {
        Self {
            name: name.into(),
            min,
            max,
            nuisance: false,
            prior: Prior::Uniform { min, max },
        }
    }

    pub fn nuisance(mut self, prior: Prior) -> Self {
        self.nuisance = true;
        self.prior = prior;
        self
    }

    pub fn with_prior(mut self, prior: Prior) -> Self {
        self.prior = prior;
        self
    }

    pub fn contains(&self, x: f64) -> bool {
        (self.min..=self.max).contains(&x)
    }

    pub fn range(&self) -> f64 {
        self.max - self.min
    }
}

/// Result of a local optimization of the posterior.
#[derive(Debug, Clone)]
pub struct LocalMode {
    pub point: Vec<f64>,
    pub log_posterior: f64,
    /// Covariance estimate at the mode, typically the inverse Hessian.
    pub covariance: Option<Mat<f64>>,
}

/// The log-posterior density we want to sample from.
///
/// Every worker thread owns its own clone, so implementations are free to
/// keep mutable caches.
pub trait Posterior: Clone + Send {
    type Err: std::error::Error + Send + Sync + 'static;

    fn parameters(&self) -> &[Parameter];

    fn log_posterior(&mut self, point: &[f64]) -> Result<f64, Self::Err>;

    fn log_prior(&self, name: &str) -> Option<&Prior> {
        self.parameters()
            .iter()
            .find(|parameter| parameter.name == name)
            .map(|parameter| &parameter.prior)
    }

    /// Local optimization starting at `start`.
    ///
    /// Return `Ok(None)` if the posterior does not support optimization.
    fn find_mode(&mut self, _start: &[f64]) -> Result<Option<LocalMode>, Self::Err> {
        Ok(None)
    }

    fn dim(&self) -> usize {
        self.parameters().len()
    }

    fn in_bounds(&self, point: &[f64]) -> bool {
        point.len() == self.dim()
            && self
                .parameters()
                .iter()
                .zip(point)
                .all(|(parameter, &x)| parameter.contains(x))
    }
}

pub mod test_posteriors {
    use std::convert::Infallible;

    use faer::Mat;

    use super::{LocalMode, Parameter, Posterior};
    use crate::math::log_sum_exp;

    /// Equal-weight mixture of unit-covariance Gaussians in a box.
    #[derive(Debug, Clone)]
    pub struct GaussianMixture {
        parameters: Vec<Parameter>,
        means: Vec<Vec<f64>>,
        sigma: f64,
    }

    impl GaussianMixture {
        pub fn new(means: Vec<Vec<f64>>, sigma: f64, bound: f64) -> Self {
            let dim = means[0].len();
            let parameters = (0..dim)
                .map(|i| Parameter::new(format!("x{}", i), -bound, bound))
                .collect();
            Self {
                parameters,
                means,
                sigma,
            }
        }

        pub fn means(&self) -> &[Vec<f64>] {
            &self.means
        }
    }

    impl Posterior for GaussianMixture {
        type Err = Infallible;

        fn parameters(&self) -> &[Parameter] {
            &self.parameters
        }

        fn log_posterior(&mut self, point: &[f64]) -> Result<f64, Infallible> {
            let dim = point.len() as f64;
            let norm = -0.5 * dim * (2.0 * std::f64::consts::PI).ln()
                - dim * self.sigma.ln()
                - (self.means.len() as f64).ln();
            let terms: Vec<f64> = self
                .means
                .iter()
                .map(|mean| {
                    let chi_sq: f64 = point
                        .iter()
                        .zip(mean)
                        .map(|(x, m)| (x - m) * (x - m))
                        .sum::<f64>()
                        / (self.sigma * self.sigma);
                    norm - 0.5 * chi_sq
                })
                .collect();
            Ok(log_sum_exp(&terms))
        }

        fn find_mode(&mut self, start: &[f64]) -> Result<Option<LocalMode>, Infallible> {
            let nearest = self
                .means
                .iter()
                .min_by(|a, b| {
                    let da: f64 = a.iter().zip(start).map(|(x, y)| (x - y) * (x - y)).sum();
                    let db: f64 = b.iter().zip(start).map(|(x, y)| (x - y) * (x - y)).sum();
                    da.total_cmp(&db)
                })
                .cloned()
                .unwrap_or_else(|| start.to_vec());
            let dim = nearest.len();
            let log_posterior = self.log_posterior(&nearest)?;
            let variance = self.sigma * self.sigma;
            Ok(Some(LocalMode {
                point: nearest,
                log_posterior,
                covariance: Some(Mat::from_fn(dim, dim, |i, j| {
                    if i == j {
                        variance
                    } else {
                        0.0
                    }
                })),
            }))
        }
    }
}
