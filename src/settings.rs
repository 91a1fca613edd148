use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{GapsError, Result};

/// Which factor matrix an operation addresses: `A` (features x patterns) or
/// `P` (patterns x samples).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    A,
    P,
}

/// Pins the leading patterns of one factor matrix to caller-supplied values.
/// For side `A` the block is features x k and fixes A's first k columns, for
/// side `P` it is k x samples and fixes P's first k rows. Fixed cells are
/// never proposed by the sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedPatterns {
    pub side: Side,
    pub values: Array2<f64>,
}

impl FixedPatterns {
    pub fn num_fixed(&self) -> usize {
        match self.side {
            Side::A => self.values.ncols(),
            Side::P => self.values.nrows(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapsSettings {
    pub num_patterns: usize,
    /// Calibration phase length in outer iterations.
    pub num_equil: u64,
    /// Cooling phase length. Runs at full temperature with frozen inner-loop
    /// counts, without recording history.
    pub num_equil_cool: u64,
    /// Sampling phase length, also the number of statistics updates.
    pub num_sample: u64,
    /// Sparsity parameter of the A side's atom prior.
    pub alpha_a: f64,
    pub alpha_p: f64,
    /// Cap on a single proposed mass, in units of the prior scale lambda.
    pub max_gibbs_mass_a: f64,
    pub max_gibbs_mass_p: f64,
    /// Non-negative values are used as-is. A negative value asks the engine
    /// to derive a seed from the clock: milliseconds since the Unix epoch
    /// reduced modulo 1000, so time-derived runs span only 1000 distinct
    /// streams. Pass an explicit seed for full control; the resolved value is
    /// reported in the result either way.
    pub seed: i64,
    /// Gates the periodic diagnostic lines.
    pub messages: bool,
    /// Restrict the likelihood to nonzero data entries (dropout zeros carry
    /// no signal).
    pub single_cell: bool,
    /// Outer iterations between diagnostic lines; 0 disables them.
    pub output_frequency: u64,
    /// Normalized snapshots to capture during sampling; 0 disables capture.
    pub num_snapshots: u64,
    pub fixed_patterns: Option<FixedPatterns>,
    /// When set, a checkpoint is written here every `checkpoint_interval`
    /// outer iterations, each write replacing the last.
    pub checkpoint_file: Option<PathBuf>,
    pub checkpoint_interval: u64,
}

impl Default for GapsSettings {
    fn default() -> Self {
        GapsSettings {
            num_patterns: 7,
            num_equil: 1000,
            num_equil_cool: 100,
            num_sample: 1000,
            alpha_a: 0.01,
            alpha_p: 0.01,
            max_gibbs_mass_a: 100.0,
            max_gibbs_mass_p: 100.0,
            seed: -1,
            messages: true,
            single_cell: false,
            output_frequency: 500,
            num_snapshots: 0,
            fixed_patterns: None,
            checkpoint_file: None,
            checkpoint_interval: 250,
        }
    }
}

impl GapsSettings {
    /// Checks the settings against the data before any sampler state is
    /// constructed.
    pub fn validate(&self, data: &Array2<f64>, uncertainty: &Array2<f64>) -> Result<()> {
        let (nrow, ncol) = data.dim();
        if nrow == 0 || ncol == 0 {
            return Err(invalid("data matrix has a zero dimension"));
        }
        if uncertainty.dim() != data.dim() {
            return Err(invalid(format!(
                "uncertainty shape {:?} does not match data shape {:?}",
                uncertainty.dim(),
                data.dim()
            )));
        }
        if data.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(invalid("data entries must be finite and non-negative"));
        }
        // the atom mass prior scales by 1 / mean(D)
        if data.iter().all(|v| *v == 0.0) {
            return Err(invalid("data matrix is entirely zero"));
        }
        if uncertainty.iter().any(|v| !v.is_finite() || *v <= 0.0) {
            return Err(invalid("uncertainty entries must be finite and positive"));
        }
        if self.num_patterns == 0 {
            return Err(invalid("pattern count must be at least 1"));
        }
        if self.num_equil == 0 || self.num_equil_cool == 0 || self.num_sample == 0 {
            return Err(invalid("phase lengths must all be at least 1"));
        }
        if self.alpha_a <= 0.0 || self.alpha_p <= 0.0 {
            return Err(invalid("alpha parameters must be positive"));
        }
        if self.max_gibbs_mass_a <= 0.0 || self.max_gibbs_mass_p <= 0.0 {
            return Err(invalid("max Gibbs mass must be positive"));
        }
        if self.checkpoint_file.is_some() && self.checkpoint_interval == 0 {
            return Err(invalid("checkpoint interval must be at least 1"));
        }
        if let Some(fixed) = &self.fixed_patterns {
            let k = fixed.num_fixed();
            if k == 0 {
                return Err(invalid("fixed pattern block is empty"));
            }
            if k >= self.num_patterns {
                return Err(invalid(
                    "fixed pattern count must leave at least one free pattern",
                ));
            }
            let expected = match fixed.side {
                Side::A => (nrow, k),
                Side::P => (k, ncol),
            };
            if fixed.values.dim() != expected {
                return Err(invalid(format!(
                    "fixed pattern block shape {:?} does not match expected {:?}",
                    fixed.values.dim(),
                    expected
                )));
            }
            if fixed.values.iter().any(|v| !v.is_finite() || *v < 0.0) {
                return Err(invalid(
                    "fixed pattern entries must be finite and non-negative",
                ));
            }
        }
        Ok(())
    }

    /// The seed the run will consume: the configured one, or a clock-derived
    /// value for negative inputs.
    pub fn resolve_seed(&self) -> u64 {
        if self.seed >= 0 {
            self.seed as u64
        } else {
            let ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis();
            (ms % 1000) as u64
        }
    }
}

/// The reference fallback when no uncertainty matrix is supplied:
/// 10% of each entry, floored at 0.1.
pub fn default_uncertainty(data: &Array2<f64>) -> Array2<f64> {
    data.mapv(|d| (0.1 * d).max(0.1))
}

fn invalid(msg: impl Into<String>) -> GapsError {
    GapsError::InvalidConfiguration(msg.into())
}
