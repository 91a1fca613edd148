use std::fmt;

use ndarray::{Array2, ArrayView2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::checkpoint;
use crate::error::Result;
use crate::gibbs::GibbsSampler;
use crate::schedule;
use crate::settings::{default_uncertainty, GapsSettings, Side};
use crate::statistics::{self, RunningStats, SnapshotSet};

/// Run phases, in order. CALIBRATION ramps the annealing temperature,
/// COOLING holds full temperature without recording anything, SAMPLING
/// feeds the statistics accumulator. A run never skips or re-enters a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Calibration,
    Cooling,
    Sampling,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Calibration => "calibration",
            Phase::Cooling => "cooling",
            Phase::Sampling => "sampling",
        })
    }
}

/// What gets recorded once per outer iteration in the phases that keep
/// history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub chi_sq: f64,
    pub atoms_a: u64,
    pub atoms_p: u64,
}

/// Per-iteration records for CALIBRATION and SAMPLING. COOLING never
/// contributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseHistory {
    pub calibration: Vec<IterationRecord>,
    pub sampling: Vec<IterationRecord>,
}

impl PhaseHistory {
    fn push(&mut self, phase: Phase, record: IterationRecord) {
        match phase {
            Phase::Calibration => self.calibration.push(record),
            Phase::Cooling => {}
            Phase::Sampling => self.sampling.push(record),
        }
    }

    /// Goodness-of-fit trace, calibration then sampling.
    pub fn chi_sq(&self) -> Vec<f64> {
        self.calibration
            .iter()
            .chain(&self.sampling)
            .map(|r| r.chi_sq)
            .collect()
    }
}

/// Contract between the driver and the proposal kernel, kept as a trait so
/// the driver is testable against a stub. Samplers serialize so the whole
/// run state can ride in a checkpoint.
pub trait FactorSampler: Serialize + DeserializeOwned {
    /// One atomic birth/death/move proposal cycle on one side under the
    /// current annealing temperature.
    fn update<R: Rng + ?Sized>(&mut self, side: Side, rng: &mut R);

    /// Metropolis-Hastings temperature in `[0, 1]`, affecting subsequent
    /// `update` calls only.
    fn set_temperature(&mut self, t: f64);

    /// Current atom count, integer-valued, as `f64` for scheduler
    /// arithmetic.
    fn total_atoms(&self, side: Side) -> f64;

    /// Chi-squared discrepancy between A*P and the data, shared by both
    /// sides.
    fn goodness_of_fit(&self) -> f64;

    fn matrix(&self, side: Side) -> ArrayView2<'_, f64>;

    /// Immutable copy of one matrix under the fixed reporting convention:
    /// P's pattern rows scaled to unit sum, A's columns scaled by the
    /// matching row sums.
    fn normalized(&self, side: Side) -> Array2<f64> {
        let (a, p) = statistics::normalized_pair(self.matrix(Side::A), self.matrix(Side::P));
        match side {
            Side::A => a,
            Side::P => p,
        }
    }
}

/// Everything a finished run reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapsResult {
    pub a_mean: Array2<f64>,
    pub a_std: Array2<f64>,
    pub p_mean: Array2<f64>,
    pub p_std: Array2<f64>,
    pub snapshots: SnapshotSet,
    pub history: PhaseHistory,
    /// Average goodness-of-fit over the sampling phase.
    pub mean_chi_sq: f64,
    /// The seed actually consumed, explicit or clock-derived.
    pub seed: u64,
}

/// The annealing state machine driving a sampler through CALIBRATION,
/// COOLING and SAMPLING. Owns the random stream and all accumulated state;
/// serializing the runner is the checkpoint body.
///
/// The random stream is consumed in a fixed order: within an iteration all
/// A-side proposals, then all P-side proposals, then (outside COOLING) the
/// scheduler's Poisson draws for A and P. The first iteration's inner counts
/// are drawn at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapsRunner<S> {
    rng: ChaCha8Rng,
    seed: u64,
    settings: GapsSettings,
    phase: Phase,
    /// Iterations completed within the current phase.
    phase_iter: u64,
    /// Iterations completed across all phases; drives checkpoint cadence.
    total_iter: u64,
    inner_a: u64,
    inner_p: u64,
    sampler: S,
    history: PhaseHistory,
    stats: RunningStats,
    snapshots: SnapshotSet,
}

impl GapsRunner<GibbsSampler> {
    /// Validates the input and builds a fresh run. A missing uncertainty
    /// matrix falls back to `max(0.1 * D, 0.1)`.
    pub fn new(
        data: Array2<f64>,
        uncertainty: Option<Array2<f64>>,
        settings: GapsSettings,
    ) -> Result<Self> {
        let uncertainty = uncertainty.unwrap_or_else(|| default_uncertainty(&data));
        settings.validate(&data, &uncertainty)?;
        let seed = settings.resolve_seed();
        let sampler = GibbsSampler::new(data, uncertainty, &settings);
        Ok(Self::with_sampler(sampler, settings, seed))
    }

    pub(crate) fn sampler_mut(&mut self) -> &mut GibbsSampler {
        &mut self.sampler
    }
}

impl<S: FactorSampler> GapsRunner<S> {
    pub(crate) fn with_sampler(sampler: S, settings: GapsSettings, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let inner_a = schedule::inner_steps(&mut rng, sampler.total_atoms(Side::A));
        let inner_p = schedule::inner_steps(&mut rng, sampler.total_atoms(Side::P));
        let a_shape = sampler.matrix(Side::A).dim();
        let p_shape = sampler.matrix(Side::P).dim();
        GapsRunner {
            rng,
            seed,
            phase: Phase::Calibration,
            phase_iter: 0,
            total_iter: 0,
            inner_a,
            inner_p,
            sampler,
            history: PhaseHistory::default(),
            stats: RunningStats::new(a_shape, p_shape),
            snapshots: SnapshotSet::default(),
            settings,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn settings(&self) -> &GapsSettings {
        &self.settings
    }

    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Sampling && self.phase_iter >= self.settings.num_sample
    }

    fn phase_len(&self) -> u64 {
        match self.phase {
            Phase::Calibration => self.settings.num_equil,
            Phase::Cooling => self.settings.num_equil_cool,
            Phase::Sampling => self.settings.num_sample,
        }
    }

    /// Temperature for iteration `i` of the current phase: a linear ramp
    /// reaching 1.0 roughly halfway through calibration, full temperature
    /// everywhere else.
    fn temperature(&self, i: u64) -> f64 {
        match self.phase {
            Phase::Calibration => {
                let ramp = (i + 2) as f64 / (self.settings.num_equil as f64 / 2.0);
                ramp.min(1.0)
            }
            Phase::Cooling | Phase::Sampling => 1.0,
        }
    }

    fn current_record(&self) -> IterationRecord {
        let chi_sq = self.sampler.goodness_of_fit();
        assert!(chi_sq.is_finite(), "non-finite goodness of fit");
        IterationRecord {
            chi_sq,
            atoms_a: self.sampler.total_atoms(Side::A) as u64,
            atoms_p: self.sampler.total_atoms(Side::P) as u64,
        }
    }

    fn due_snapshot(&self, done: u64) -> bool {
        let want = self.settings.num_snapshots;
        if want == 0 || self.snapshots.len() as u64 >= want {
            return false;
        }
        let interval = (self.settings.num_sample / want).max(1);
        done % interval == 0
    }

    fn report(&self, done: u64, record: IterationRecord) {
        let freq = self.settings.output_frequency;
        if !self.settings.messages || freq == 0 || done % freq != 0 {
            return;
        }
        info!(
            "{} {} of {}: chi2 {:.2}, atoms {} (A) {} (P)",
            self.phase,
            done,
            self.phase_len(),
            record.chi_sq,
            record.atoms_a,
            record.atoms_p
        );
    }

    /// One outer iteration: set the temperature, run the scheduled A-side
    /// then P-side updates, then the phase-dependent bookkeeping. Advances
    /// to the next phase once its configured length is reached. Stepping a
    /// completed run is a no-op, keeping the statistics counter at exactly
    /// the sampling length.
    pub fn step(&mut self) -> Result<()> {
        if self.is_complete() {
            return Ok(());
        }
        let i = self.phase_iter;
        self.sampler.set_temperature(self.temperature(i));
        for _ in 0..self.inner_a {
            self.sampler.update(Side::A, &mut self.rng);
        }
        for _ in 0..self.inner_p {
            self.sampler.update(Side::P, &mut self.rng);
        }

        match self.phase {
            Phase::Cooling => {}
            phase => {
                let record = self.current_record();
                if phase == Phase::Sampling {
                    self.stats.update(
                        self.sampler.matrix(Side::A),
                        self.sampler.matrix(Side::P),
                        record.chi_sq,
                    );
                    if self.due_snapshot(i + 1) {
                        let a = self.sampler.normalized(Side::A);
                        let p = self.sampler.normalized(Side::P);
                        self.snapshots.push(a, p);
                    }
                }
                self.history.push(phase, record);
                self.inner_a = schedule::inner_steps(&mut self.rng, record.atoms_a as f64);
                self.inner_p = schedule::inner_steps(&mut self.rng, record.atoms_p as f64);
                self.report(i + 1, record);
            }
        }

        self.phase_iter += 1;
        self.total_iter += 1;
        if self.phase_iter == self.phase_len() && self.phase != Phase::Sampling {
            self.advance_phase();
        }
        // after the transition, so a checkpoint taken at a phase boundary
        // restores into the next phase instead of replaying the old one
        if let Some(path) = &self.settings.checkpoint_file {
            if self.total_iter % self.settings.checkpoint_interval == 0 {
                checkpoint::save(path, self)?;
            }
        }
        Ok(())
    }

    /// Moves to the next phase and resets the per-phase counter. Phases only
    /// ever advance.
    fn advance_phase(&mut self) {
        self.phase = match self.phase {
            Phase::Calibration => Phase::Cooling,
            Phase::Cooling | Phase::Sampling => Phase::Sampling,
        };
        self.phase_iter = 0;
        debug!("entering {} phase", self.phase);
    }

    /// Runs to completion and assembles the result.
    pub fn run(mut self) -> Result<GapsResult> {
        while !self.is_complete() {
            self.step()?;
        }
        Ok(self.finish())
    }

    /// Assembles the result of a completed run.
    pub fn finish(self) -> GapsResult {
        assert!(self.is_complete(), "run still in progress");
        GapsResult {
            a_mean: self.stats.mean(Side::A),
            a_std: self.stats.std(Side::A),
            p_mean: self.stats.mean(Side::P),
            p_std: self.stats.std(Side::P),
            mean_chi_sq: self.stats.mean_chi_sq(),
            snapshots: self.snapshots,
            history: self.history,
            seed: self.seed,
        }
    }
}

/// One full factorization run with fresh state.
pub fn run(
    data: Array2<f64>,
    uncertainty: Option<Array2<f64>>,
    settings: GapsSettings,
) -> Result<GapsResult> {
    GapsRunner::new(data, uncertainty, settings)?.run()
}

/// Independent replicate runs executed in parallel, replicate `i` seeded
/// with `base + i` where `base` is the resolved seed. Results come back in
/// replicate order. Checkpointing is disabled per replicate since all
/// replicates would race on the one configured path.
pub fn run_ensemble(
    data: &Array2<f64>,
    uncertainty: Option<&Array2<f64>>,
    settings: &GapsSettings,
    replicates: usize,
) -> Result<Vec<GapsResult>> {
    let uncertainty = uncertainty
        .cloned()
        .unwrap_or_else(|| default_uncertainty(data));
    let mut settings = settings.clone();
    settings.checkpoint_file = None;
    settings.validate(data, &uncertainty)?;
    let base = settings.resolve_seed();

    (0..replicates)
        .into_par_iter()
        .map(|i| {
            let sampler = GibbsSampler::new(data.clone(), uncertainty.clone(), &settings);
            GapsRunner::with_sampler(sampler, settings.clone(), base.wrapping_add(i as u64)).run()
        })
        .collect()
}
