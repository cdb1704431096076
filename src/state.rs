/// A point in parameter space together with the mixture component that
/// generated it.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub point: Vec<f64>,
    /// Index of the generating component, 0 for single-component proposals.
    pub component: usize,
    /// `NaN` until the posterior has been evaluated.
    pub log_posterior: f64,
}

impl State {
    pub fn new(point: Vec<f64>, component: usize) -> Self {
        Self {
            point,
            component,
            log_posterior: f64::NAN,
        }
    }

    pub fn evaluated(point: Vec<f64>, component: usize, log_posterior: f64) -> Self {
        Self {
            point,
            component,
            log_posterior,
        }
    }

    pub fn is_evaluated(&self) -> bool {
        !self.log_posterior.is_nan()
    }

    pub fn dim(&self) -> usize {
        self.point.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_is_unevaluated() {
        let state = State::new(vec![1.0, 2.0], 3);
        assert!(!state.is_evaluated());
        assert_eq!(state.dim(), 2);
        let state = State::evaluated(vec![1.0], 0, -2.5);
        assert!(state.is_evaluated());
    }
}
