use crate::math::axpy_out;
use crate::proposal::ProposalError;

/// Jump vectors between the modes of `C` components.
///
/// Only the `C·(C−1)/2` vectors from a smaller to a larger index are stored,
/// the reverse jumps are their negation.
#[derive(Debug, Clone, PartialEq)]
pub struct AdjacencyMatrix {
    components: usize,
    dim: usize,
    jumps: Vec<Vec<f64>>,
}

impl AdjacencyMatrix {
    /// Jump vectors `mode_j − mode_i` for every pair `i < j`.
    pub fn from_modes(modes: &[&[f64]]) -> Result<Self, ProposalError> {
        let dim = modes.first().map(|mode| mode.len()).unwrap_or(0);
        if let Some(bad) = modes.iter().find(|mode| mode.len() != dim) {
            return Err(ProposalError::DimensionMismatch {
                expected: dim,
                got: bad.len(),
            });
        }
        let components = modes.len();
        let mut jumps = Vec::with_capacity(components * components.saturating_sub(1) / 2);
        for i in 0..components {
            for j in (i + 1)..components {
                jumps.push(modes[j].iter().zip(modes[i]).map(|(b, a)| b - a).collect());
            }
        }
        Ok(Self {
            components,
            dim,
            jumps,
        })
    }

    /// Restore from the stored jump vectors, in pair order.
    pub fn from_jumps(
        components: usize,
        dim: usize,
        jumps: Vec<Vec<f64>>,
    ) -> Result<Self, ProposalError> {
        let expected = components * components.saturating_sub(1) / 2;
        if jumps.len() != expected {
            return Err(ProposalError::Malformed(format!(
                "expected {} jump vectors for {} components, got {}",
                expected,
                components,
                jumps.len()
            )));
        }
        if let Some(bad) = jumps.iter().find(|jump| jump.len() != dim) {
            return Err(ProposalError::DimensionMismatch {
                expected: dim,
                got: bad.len(),
            });
        }
        Ok(Self {
            components,
            dim,
            jumps,
        })
    }

    pub fn components(&self) -> usize {
        self.components
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn stored(&self) -> &[Vec<f64>] {
        &self.jumps
    }

    // Row-major position of (i, j), i < j, in the strict upper triangle.
    fn pair_index(&self, i: usize, j: usize) -> usize {
        i * (2 * self.components - i - 1) / 2 + (j - i - 1)
    }

    fn check_pair(&self, i: usize, j: usize) -> Result<(), ProposalError> {
        if i == j {
            return Err(ProposalError::SelfJump(i));
        }
        if i >= self.components || j >= self.components {
            return Err(ProposalError::Malformed(format!(
                "component index out of range: {} -> {} with {} components",
                i, j, self.components
            )));
        }
        Ok(())
    }

    /// The vector that moves mode `i` onto mode `j`.
    pub fn jump(&self, i: usize, j: usize) -> Result<Vec<f64>, ProposalError> {
        self.check_pair(i, j)?;
        if i < j {
            Ok(self.jumps[self.pair_index(i, j)].clone())
        } else {
            Ok(self.jumps[self.pair_index(j, i)].iter().map(|x| -x).collect())
        }
    }

    /// `out = point + jump(i, j)`
    pub(crate) fn apply(
        &self,
        i: usize,
        j: usize,
        point: &[f64],
        out: &mut [f64],
    ) -> Result<(), ProposalError> {
        self.check_pair(i, j)?;
        let (stored, sign) = if i < j {
            (&self.jumps[self.pair_index(i, j)], 1.0)
        } else {
            (&self.jumps[self.pair_index(j, i)], -1.0)
        };
        axpy_out(stored, point, sign, out);
        Ok(())
    }

    /// Whether `to` is the image of `from` under `jump(i, j)`.
    ///
    /// Each coordinate may deviate by `tolerance` relative to the magnitude
    /// of the point and the jump, so reversing a jump is always a hit.
    pub(crate) fn lands_on(
        &self,
        i: usize,
        j: usize,
        from: &[f64],
        to: &[f64],
        tolerance: f64,
    ) -> Result<bool, ProposalError> {
        self.check_pair(i, j)?;
        let (stored, sign) = if i < j {
            (&self.jumps[self.pair_index(i, j)], 1.0)
        } else {
            (&self.jumps[self.pair_index(j, i)], -1.0)
        };
        Ok(stored
            .iter()
            .zip(from)
            .zip(to)
            .all(|((&jump, &x), &y)| close(x + sign * jump, y, jump.abs() + x.abs(), tolerance)))
    }

    /// Zero every coordinate outside `subset` in all jump vectors.
    pub fn indices(&mut self, subset: &[usize]) {
        let mut keep = vec![false; self.dim];
        for &idx in subset.iter().filter(|&&idx| idx < self.dim) {
            keep[idx] = true;
        }
        for jump in self.jumps.iter_mut() {
            jump.iter_mut()
                .zip(&keep)
                .filter(|(_, &kept)| !kept)
                .for_each(|(value, _)| *value = 0.0);
        }
    }

    /// Fail if two jumps starting at the same component land on the same
    /// point, up to `tolerance` relative to the jump lengths in every
    /// coordinate.
    pub fn check_unique(&self, tolerance: f64) -> Result<(), ProposalError> {
        for origin in 0..self.components {
            let targets: Vec<usize> = (0..self.components).filter(|&c| c != origin).collect();
            for (a, &first) in targets.iter().enumerate() {
                let first_jump = self.jump(origin, first)?;
                for &second in targets[a + 1..].iter() {
                    let second_jump = self.jump(origin, second)?;
                    let coincide = first_jump
                        .iter()
                        .zip(&second_jump)
                        .all(|(&x, &y)| close(x, y, 0.0, tolerance));
                    if coincide {
                        return Err(ProposalError::DegenerateJumps {
                            origin,
                            first,
                            second,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// `|a − b| ≤ tolerance · (1 + max(|a|, |b|) + scale)`
fn close(a: f64, b: f64, scale: f64, tolerance: f64) -> bool {
    (a - b).abs() <= tolerance * (1.0 + a.abs().max(b.abs()) + scale)
}
