use rand::Rng;
use rand_distr::{Distribution, Poisson};

/// Lower bound on the Poisson mean, so nearly empty domains early in a run
/// still get enough proposal attempts to mix.
const STEP_FLOOR: f64 = 10.0;

/// Inner-loop repeat count for one matrix side in the next outer iteration:
/// Poisson distributed with mean `max(atoms, 10)`. Matrices holding more
/// atoms need proportionally more proposals per iteration.
pub(crate) fn inner_steps<R: Rng + ?Sized>(rng: &mut R, atoms: f64) -> u64 {
    let mean = atoms.max(STEP_FLOOR);
    let steps = Poisson::new(mean).expect("positive Poisson mean").sample(rng);
    steps as u64
}
