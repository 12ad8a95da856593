use okapi_core::{bail, Error, HostMatrix, Result};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use rand_distr::Normal;

/// Parameter initialization schemes, materialized on the host and uploaded
/// once at block construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    Uniform { low: f32, high: f32 },
    Normal { mean: f32, std: f32 },
    Const(f32),
}

impl Init {
    /// Uniform on ±1/sqrt(fan_in), the usual default for dense and
    /// recurrent weights.
    pub fn scaled_uniform(fan_in: usize) -> Self {
        let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
        Init::Uniform {
            low: -bound,
            high: bound,
        }
    }

    /// Materialize an `nrows` x `ncols` host matrix.
    pub fn build(&self, nrows: usize, ncols: usize, rng: &mut impl Rng) -> Result<HostMatrix> {
        let n = nrows * ncols;
        let data = match *self {
            Init::Const(v) => vec![v; n],
            Init::Uniform { low, high } => {
                if low >= high {
                    bail!("uniform init needs low < high, got [{low}, {high})");
                }
                let dist = Uniform::new(low, high);
                (0..n).map(|_| dist.sample(rng)).collect()
            }
            Init::Normal { mean, std } => {
                let dist = Normal::new(mean, std)
                    .map_err(|e| Error::msg(format!("normal init: {e}")))?;
                (0..n).map(|_| dist.sample(rng)).collect()
            }
        };
        HostMatrix::from_f32(nrows, ncols, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn uniform_stays_in_bounds() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(7);
        let m = Init::scaled_uniform(16).build(8, 8, &mut rng)?;
        let bound = 0.25;
        for &v in m.data().as_f32()? {
            assert!(v > -bound && v < bound);
        }
        Ok(())
    }

    #[test]
    fn degenerate_uniform_rejected() {
        let mut rng = StdRng::seed_from_u64(7);
        assert!(Init::Uniform { low: 1.0, high: 1.0 }
            .build(2, 2, &mut rng)
            .is_err());
    }
}
