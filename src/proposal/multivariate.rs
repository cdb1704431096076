use std::f64::consts::PI;

use anyhow::{anyhow, Result};
use faer::Mat;
use rand::Rng;
use rand_distr::{ChiSquared, Distribution, StandardNormal};

use super::{kind, ProposalError, ProposalFunction};
use crate::checkpoint::{join, Checkpoint, Table};
use crate::math::{
    axpy_out, cholesky_lower, flatten, invert_lower, ln_gamma, lower_mul, lower_mul_norm_sq,
    sample_mean_covariance, unflatten,
};
use crate::state::State;

/// A covariance matrix together with its cached Cholesky factor.
#[derive(Debug, Clone)]
pub struct CovarianceCore {
    covariance: Mat<f64>,
    cholesky: Mat<f64>,
    cholesky_inverse: Mat<f64>,
    log_det: f64,
    cholesky_valid: bool,
}

impl CovarianceCore {
    /// Factorize `covariance`.
    ///
    /// If the matrix is not positive definite the off-diagonal elements are
    /// dropped and the factorization is tried once more.
    pub fn new(covariance: Mat<f64>) -> Result<Self, ProposalError> {
        let dim = covariance.nrows();
        if covariance.ncols() != dim {
            return Err(ProposalError::DimensionMismatch {
                expected: dim,
                got: covariance.ncols(),
            });
        }
        if let Some(cholesky) = cholesky_lower(&covariance) {
            return Ok(Self::from_factor(covariance, cholesky));
        }

        log::warn!("Covariance matrix is not positive definite, dropping off-diagonal elements");
        let diagonal = Mat::from_fn(dim, dim, |i, j| if i == j { covariance[(i, i)] } else { 0.0 });
        match cholesky_lower(&diagonal) {
            Some(cholesky) => Ok(Self::from_factor(diagonal, cholesky)),
            None => Err(ProposalError::SingularCovariance),
        }
    }

    /// Keep `covariance` even if it cannot be factorized.
    ///
    /// Used for components that are dead and never sampled from.
    pub(crate) fn new_unchecked(covariance: Mat<f64>) -> Self {
        match cholesky_lower(&covariance) {
            Some(cholesky) => Self::from_factor(covariance, cholesky),
            None => {
                let dim = covariance.nrows();
                Self {
                    covariance,
                    cholesky: Mat::zeros(dim, dim),
                    cholesky_inverse: Mat::zeros(dim, dim),
                    log_det: f64::NAN,
                    cholesky_valid: false,
                }
            }
        }
    }

    fn from_factor(covariance: Mat<f64>, cholesky: Mat<f64>) -> Self {
        let dim = covariance.nrows();
        let log_det = 2.0 * (0..dim).map(|i| cholesky[(i, i)].ln()).sum::<f64>();
        let cholesky_inverse = invert_lower(&cholesky);
        Self {
            covariance,
            cholesky,
            cholesky_inverse,
            log_det,
            cholesky_valid: true,
        }
    }

    pub fn dim(&self) -> usize {
        self.covariance.nrows()
    }

    pub fn covariance(&self) -> &Mat<f64> {
        &self.covariance
    }

    pub fn cholesky(&self) -> &Mat<f64> {
        &self.cholesky
    }

    pub fn log_det(&self) -> f64 {
        self.log_det
    }

    pub fn is_valid(&self) -> bool {
        self.cholesky_valid
    }

    /// `Σ⁻¹ = L⁻ᵀ L⁻¹`
    pub fn precision(&self) -> Mat<f64> {
        let dim = self.dim();
        let inverse = &self.cholesky_inverse;
        Mat::from_fn(dim, dim, |i, j| {
            (i.max(j)..dim)
                .map(|k| inverse[(k, i)] * inverse[(k, j)])
                .sum()
        })
    }

    /// Squared Mahalanobis distance `|L⁻¹ δ|²`.
    pub fn chi_squared(&self, delta: &[f64]) -> f64 {
        lower_mul_norm_sq(&self.cholesky_inverse, delta)
    }

    /// Log density of `δ` under a centered Gaussian or, with `dof`, Student-T
    /// distribution with this scale matrix.
    pub fn log_density(&self, delta: &[f64], dof: Option<f64>) -> f64 {
        let dim = self.dim() as f64;
        let chi_sq = self.chi_squared(delta);
        match dof {
            None => -0.5 * dim * (2.0 * PI).ln() - 0.5 * self.log_det - 0.5 * chi_sq,
            Some(nu) => {
                let norm = ln_gamma(0.5 * (nu + dim))
                    - ln_gamma(0.5 * nu)
                    - 0.5 * dim * (nu * PI).ln()
                    - 0.5 * self.log_det;
                norm - 0.5 * (nu + dim) * (chi_sq / nu).ln_1p()
            }
        }
    }

    /// Draw `δ` from the centered Gaussian or Student-T distribution.
    pub fn sample_delta<R: Rng + ?Sized>(&self, rng: &mut R, dof: Option<f64>, out: &mut [f64]) {
        let z: Vec<f64> = (0..self.dim())
            .map(|_| Distribution::<f64>::sample(&StandardNormal, &mut *rng))
            .collect();
        lower_mul(&self.cholesky, &z, out);
        if let Some(nu) = dof {
            if let Ok(chi_squared) = ChiSquared::new(nu) {
                let draw: f64 = chi_squared.sample(&mut *rng);
                let factor = (nu / draw).sqrt();
                out.iter_mut().for_each(|value| *value *= factor);
            }
        }
    }
}

pub(crate) fn check_dof(dof: f64) -> Result<f64, ProposalError> {
    if dof.is_finite() && dof > 0.0 {
        Ok(dof)
    } else {
        Err(ProposalError::InvalidDof(dof))
    }
}

/// Settings for the scale adaptation of random walk proposals.
#[derive(Debug, Clone, Copy)]
pub struct MultivariateSettings {
    /// Initial factor applied to the covariance estimate.
    pub scale: f64,
    /// Multiplicative step of the scale when the efficiency leaves the
    /// target interval.
    pub scale_factor: f64,
    pub scale_min: f64,
    pub scale_max: f64,
    /// Step size of the covariance estimate update is `n^(-cooling_power)`.
    pub cooling_power: f64,
}

impl Default for MultivariateSettings {
    fn default() -> Self {
        Self {
            scale: 1.0,
            scale_factor: 1.5,
            scale_min: 1e-4,
            scale_max: 1e4,
            cooling_power: 0.5,
        }
    }
}

/// Random walk around the current point with covariance `scale · Σ̂`.
#[derive(Debug, Clone)]
struct RandomWalk {
    estimate: Mat<f64>,
    scale: f64,
    adaptations: usize,
    settings: MultivariateSettings,
    core: CovarianceCore,
}

impl RandomWalk {
    fn new(covariance: Mat<f64>, settings: MultivariateSettings) -> Result<Self, ProposalError> {
        let scale = settings.scale.clamp(settings.scale_min, settings.scale_max);
        let core = CovarianceCore::new(scaled(&covariance, scale))?;
        let estimate = scaled(core.covariance(), 1.0 / scale);
        Ok(Self {
            estimate,
            scale,
            adaptations: 0,
            settings,
            core,
        })
    }

    fn dim(&self) -> usize {
        self.core.dim()
    }

    fn propose<R: Rng + ?Sized>(&self, current: &State, rng: &mut R, dof: Option<f64>) -> State {
        let mut delta = vec![0f64; self.dim()];
        self.core.sample_delta(rng, dof, &mut delta);
        let mut point = vec![0f64; self.dim()];
        axpy_out(&delta, &current.point, 1.0, &mut point);
        State::new(point, current.component)
    }

    fn evaluate(&self, x: &State, y: &State, dof: Option<f64>) -> f64 {
        let delta: Vec<f64> = x.point.iter().zip(&y.point).map(|(a, b)| a - b).collect();
        self.core.log_density(&delta, dof)
    }

    fn adapt(
        &mut self,
        history: &[State],
        efficiency: f64,
        efficiency_min: f64,
        efficiency_max: f64,
    ) -> Result<(), ProposalError> {
        let dim = self.dim();
        self.adaptations += 1;

        if history.len() > dim {
            let gamma = (self.adaptations as f64).powf(-self.settings.cooling_power);
            let points: Vec<&[f64]> = history.iter().map(|state| state.point.as_slice()).collect();
            let (_, sample) = sample_mean_covariance(dim, &points);
            // A chain that barely moved has a degenerate sample covariance.
            if cholesky_lower(&sample).is_some() {
                let estimate = &self.estimate;
                self.estimate = Mat::from_fn(dim, dim, |i, j| {
                    (1.0 - gamma) * estimate[(i, j)] + gamma * sample[(i, j)]
                });
            } else {
                log::debug!("Skipping covariance update, sample covariance is singular");
            }
        }

        if efficiency > efficiency_max {
            self.scale *= self.settings.scale_factor;
        } else if efficiency < efficiency_min {
            self.scale /= self.settings.scale_factor;
        }
        self.scale = self
            .scale
            .clamp(self.settings.scale_min, self.settings.scale_max);

        self.core = CovarianceCore::new(scaled(&self.estimate, self.scale))?;
        self.estimate = scaled(self.core.covariance(), 1.0 / self.scale);
        Ok(())
    }

    fn dump(
        &self,
        store: &mut dyn Checkpoint,
        prefix: &str,
        kind: f64,
        dof: Option<f64>,
    ) -> Result<()> {
        let dim = self.dim();
        store.write_table(
            &join(prefix, "meta"),
            &Table::attributes_only()
                .with_attribute("kind", kind)
                .with_attribute("dimension", dim as f64),
        )?;
        let mut table = Table::new(&[("covariance", dim * dim)])
            .with_attribute("scale", self.scale)
            .with_attribute("adaptations", self.adaptations as f64)
            .with_attribute("degrees of freedom", dof.unwrap_or(-1.0))
            .with_attribute("scale factor", self.settings.scale_factor)
            .with_attribute("scale min", self.settings.scale_min)
            .with_attribute("scale max", self.settings.scale_max)
            .with_attribute("cooling power", self.settings.cooling_power);
        table.push(&[&flatten(&self.estimate)])?;
        store.write_table(&join(prefix, "covariance"), &table)
    }

    fn load(store: &dyn Checkpoint, prefix: &str) -> Result<(Self, Option<f64>)> {
        let table = store.read_table(&join(prefix, "covariance"))?;
        let width = table.field_width("covariance")?;
        let dim = (width as f64).sqrt().round() as usize;
        if dim * dim != width {
            return Err(anyhow!("Covariance field of width {} is not square", width));
        }
        let estimate = unflatten(table.get(0, "covariance")?, dim);
        let settings = MultivariateSettings {
            scale: table.require_attribute("scale")?,
            scale_factor: table.require_attribute("scale factor")?,
            scale_min: table.require_attribute("scale min")?,
            scale_max: table.require_attribute("scale max")?,
            cooling_power: table.require_attribute("cooling power")?,
        };
        let mut walk = RandomWalk::new(estimate, settings)?;
        walk.adaptations = table.require_attribute("adaptations")? as usize;
        let dof = table.require_attribute("degrees of freedom")?;
        let dof = if dof > 0.0 { Some(dof) } else { None };
        Ok((walk, dof))
    }
}

fn scaled(matrix: &Mat<f64>, factor: f64) -> Mat<f64> {
    Mat::from_fn(matrix.nrows(), matrix.ncols(), |i, j| factor * matrix[(i, j)])
}

/// Gaussian random walk proposal.
#[derive(Debug, Clone)]
pub struct MultivariateGaussian {
    walk: RandomWalk,
}

impl MultivariateGaussian {
    pub fn new(covariance: Mat<f64>, settings: MultivariateSettings) -> Result<Self, ProposalError> {
        Ok(Self {
            walk: RandomWalk::new(covariance, settings)?,
        })
    }

    /// Covariance actually used for proposals, including the scale.
    pub fn covariance(&self) -> &Mat<f64> {
        self.walk.core.covariance()
    }

    pub fn scale(&self) -> f64 {
        self.walk.scale
    }

    pub fn adaptations(&self) -> usize {
        self.walk.adaptations
    }

    pub(crate) fn load(store: &dyn Checkpoint, prefix: &str) -> Result<Self> {
        let (walk, _) = RandomWalk::load(store, prefix)?;
        Ok(Self { walk })
    }
}

impl ProposalFunction for MultivariateGaussian {
    fn dim(&self) -> usize {
        self.walk.dim()
    }

    fn evaluate(&self, x: &State, y: &State) -> f64 {
        self.walk.evaluate(x, y, None)
    }

    fn propose<R: Rng + ?Sized>(&self, current: &State, rng: &mut R) -> State {
        self.walk.propose(current, rng, None)
    }

    fn adapt(
        &mut self,
        history: &[State],
        efficiency: f64,
        efficiency_min: f64,
        efficiency_max: f64,
    ) -> Result<(), ProposalError> {
        self.walk
            .adapt(history, efficiency, efficiency_min, efficiency_max)
    }

    fn dump(&self, store: &mut dyn Checkpoint, prefix: &str) -> Result<()> {
        self.walk.dump(store, prefix, kind::GAUSSIAN, None)
    }
}

/// Student-T random walk proposal.
#[derive(Debug, Clone)]
pub struct MultivariateStudentT {
    walk: RandomWalk,
    dof: f64,
}

impl MultivariateStudentT {
    pub fn new(
        covariance: Mat<f64>,
        dof: f64,
        settings: MultivariateSettings,
    ) -> Result<Self, ProposalError> {
        let dof = check_dof(dof)?;
        Ok(Self {
            walk: RandomWalk::new(covariance, settings)?,
            dof,
        })
    }

    pub fn covariance(&self) -> &Mat<f64> {
        self.walk.core.covariance()
    }

    pub fn dof(&self) -> f64 {
        self.dof
    }

    pub fn scale(&self) -> f64 {
        self.walk.scale
    }

    pub(crate) fn load(store: &dyn Checkpoint, prefix: &str) -> Result<Self> {
        let (walk, dof) = RandomWalk::load(store, prefix)?;
        let dof = dof.ok_or_else(|| anyhow!("Student-T proposal without degrees of freedom"))?;
        Ok(Self {
            walk,
            dof: check_dof(dof)?,
        })
    }
}

impl ProposalFunction for MultivariateStudentT {
    fn dim(&self) -> usize {
        self.walk.dim()
    }

    fn evaluate(&self, x: &State, y: &State) -> f64 {
        self.walk.evaluate(x, y, Some(self.dof))
    }

    fn propose<R: Rng + ?Sized>(&self, current: &State, rng: &mut R) -> State {
        self.walk.propose(current, rng, Some(self.dof))
    }

    fn adapt(
        &mut self,
        history: &[State],
        efficiency: f64,
        efficiency_min: f64,
        efficiency_max: f64,
    ) -> Result<(), ProposalError> {
        self.walk
            .adapt(history, efficiency, efficiency_min, efficiency_max)
    }

    fn dump(&self, store: &mut dyn Checkpoint, prefix: &str) -> Result<()> {
        self.walk.dump(store, prefix, kind::STUDENT_T, Some(self.dof))
    }
}
