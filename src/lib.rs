//! Bayesian non-negative matrix factorization by atomic-domain Gibbs
//! sampling.
//!
//! A data matrix D with per-entry uncertainty S is decomposed into
//! non-negative factors A (features x patterns) and P (patterns x samples)
//! such that A*P approximates D. Factor mass lives in sparse atomic domains
//! and moves through birth/death/move proposals under a simulated annealing
//! schedule; a phase state machine (calibration, cooling, sampling) drives
//! the run, accumulates posterior statistics, and can checkpoint and resume
//! itself bit for bit. Entry points: [`run`], [`run_ensemble`], [`resume`],
//! and [`GapsRunner`] for stepping a run manually.

pub(crate) mod atomic;
pub(crate) mod checkpoint;
pub(crate) mod error;
pub(crate) mod gibbs;
pub(crate) mod math;
pub(crate) mod runner;
pub(crate) mod schedule;
pub(crate) mod settings;
pub(crate) mod statistics;

pub use checkpoint::resume;
pub use error::{GapsError, Result};
pub use gibbs::GibbsSampler;
pub use runner::{
    run, run_ensemble, FactorSampler, GapsResult, GapsRunner, IterationRecord, Phase, PhaseHistory,
};
pub use settings::{default_uncertainty, FixedPatterns, GapsSettings, Side};
pub use statistics::SnapshotSet;
