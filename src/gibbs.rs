use ndarray::{s, Array2, ArrayView2};
use rand::Rng;
use rand_distr::{Distribution, Exp};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::atomic::AtomicDomain;
use crate::error::{GapsError, Result};
use crate::math::{self, GibbsTerms, EPSILON};
use crate::runner::FactorSampler;
use crate::settings::{GapsSettings, Side};

/// Per-side sampler parameters. `lambda` is the atom mass prior rate,
/// `alpha * sqrt(num_patterns / mean(D))`; `max_mass` caps a single Gibbs
/// draw and is the configured cap divided by `lambda`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct SideParams {
    alpha: f64,
    lambda: f64,
    max_mass: f64,
    /// Leading patterns excluded from proposals.
    fixed: usize,
}

/// The joint factorization model: both factor matrices, their atomic
/// domains, and the cached estimate A*P. All mutation goes through proposal
/// moves; the matrices are bin sums of their domains.
///
/// Row-major primaries (`data`, `sigma`, `est`) serve the A side's
/// row-contiguous kernels; transposed copies serve the P side the same way,
/// so both sides run identical contiguous-slice arithmetic. Both layouts are
/// updated on every accepted change.
///
/// The data and uncertainty matrices are skipped by serde: a checkpoint
/// stores sampler state only and the caller re-supplies the data on restore
/// (`attach_data`). The cached estimate does ride along, since recomputing
/// it would not reproduce its accumulated rounding bit for bit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GibbsSampler {
    #[serde(skip)]
    data: Array2<f64>,
    #[serde(skip)]
    sigma: Array2<f64>,
    est: Array2<f64>,
    #[serde(skip)]
    data_t: Array2<f64>,
    #[serde(skip)]
    sigma_t: Array2<f64>,
    est_t: Array2<f64>,
    /// features x patterns
    a: Array2<f64>,
    /// patterns x features, weight rows for the P side
    a_t: Array2<f64>,
    /// patterns x samples, weight rows for the A side
    p: Array2<f64>,
    domain_a: AtomicDomain,
    domain_p: AtomicDomain,
    side_a: SideParams,
    side_p: SideParams,
    annealing_temp: f64,
    single_cell: bool,
    num_patterns: usize,
}

impl GibbsSampler {
    /// Builds the initial model state. The settings must already have been
    /// validated against `data` and `uncertainty`.
    pub fn new(data: Array2<f64>, uncertainty: Array2<f64>, settings: &GapsSettings) -> Self {
        let data = standard_layout(data);
        let uncertainty = standard_layout(uncertainty);
        let (nrow, ncol) = data.dim();
        let k = settings.num_patterns;

        let mean_d = data.sum() / (nrow * ncol) as f64;
        let lambda_a = settings.alpha_a * (k as f64 / mean_d).sqrt();
        let lambda_p = settings.alpha_p * (k as f64 / mean_d).sqrt();

        let (fixed_a, fixed_p) = match &settings.fixed_patterns {
            Some(f) if f.side == Side::A => (f.num_fixed(), 0),
            Some(f) => (0, f.num_fixed()),
            None => (0, 0),
        };

        let mut a = Array2::zeros((nrow, k));
        let mut p = Array2::zeros((k, ncol));
        if let Some(f) = &settings.fixed_patterns {
            match f.side {
                Side::A => a.slice_mut(s![.., ..fixed_a]).assign(&f.values),
                Side::P => p.slice_mut(s![..fixed_p, ..]).assign(&f.values),
            }
        }
        let est = a.dot(&p);

        GibbsSampler {
            // `.t()` alone yields column-major views; the kernels slice rows
            // contiguously, so the transposes are rebuilt in standard layout
            data_t: data.t().as_standard_layout().into_owned(),
            sigma_t: uncertainty.t().as_standard_layout().into_owned(),
            est_t: est.t().as_standard_layout().into_owned(),
            a_t: a.t().as_standard_layout().into_owned(),
            domain_a: AtomicDomain::new((nrow * (k - fixed_a)) as u64),
            domain_p: AtomicDomain::new(((k - fixed_p) * ncol) as u64),
            side_a: SideParams {
                alpha: settings.alpha_a,
                lambda: lambda_a,
                max_mass: settings.max_gibbs_mass_a / lambda_a,
                fixed: fixed_a,
            },
            side_p: SideParams {
                alpha: settings.alpha_p,
                lambda: lambda_p,
                max_mass: settings.max_gibbs_mass_p / lambda_p,
                fixed: fixed_p,
            },
            annealing_temp: 0.0,
            single_cell: settings.single_cell,
            num_patterns: k,
            data,
            sigma: uncertainty,
            est,
            a,
            p,
        }
    }

    /// Reattaches the data matrices after a checkpoint restore, rejecting a
    /// shape that does not match the restored factor matrices. The
    /// uncertainty matrix must already be validated against the data.
    pub(crate) fn attach_data(
        &mut self,
        data: Array2<f64>,
        uncertainty: Array2<f64>,
    ) -> Result<()> {
        let expected = (self.a.nrows(), self.p.ncols());
        if data.dim() != expected {
            return Err(GapsError::InvalidConfiguration(format!(
                "checkpoint was taken for a {:?} data matrix, got {:?}",
                expected,
                data.dim()
            )));
        }
        let data = standard_layout(data);
        let uncertainty = standard_layout(uncertainty);
        self.data_t = data.t().as_standard_layout().into_owned();
        self.sigma_t = uncertainty.t().as_standard_layout().into_owned();
        self.data = data;
        self.sigma = uncertainty;
        Ok(())
    }

    fn side_params(&self, side: Side) -> &SideParams {
        match side {
            Side::A => &self.side_a,
            Side::P => &self.side_p,
        }
    }

    fn domain(&self, side: Side) -> &AtomicDomain {
        match side {
            Side::A => &self.domain_a,
            Side::P => &self.domain_p,
        }
    }

    fn domain_mut(&mut self, side: Side) -> &mut AtomicDomain {
        match side {
            Side::A => &mut self.domain_a,
            Side::P => &mut self.domain_p,
        }
    }

    /// Matrix cell owning a domain position, mapped row-major over the free
    /// region of the side's matrix.
    fn cell_of(&self, side: Side, pos: u64) -> (usize, usize) {
        match side {
            Side::A => {
                let bin = self.domain_a.bin_of(pos) as usize;
                let free = self.num_patterns - self.side_a.fixed;
                (bin / free, self.side_a.fixed + bin % free)
            }
            Side::P => {
                let bin = self.domain_p.bin_of(pos) as usize;
                let ncol = self.data.ncols();
                (self.side_p.fixed + bin / ncol, bin % ncol)
            }
        }
    }

    /// Conditional terms for a mass change at one cell, over the affected
    /// residual row. For side A the cell is (feature, pattern), for side P it
    /// is (pattern, sample) and the transposed layouts are used.
    fn terms_at(&self, side: Side, cell: (usize, usize)) -> GibbsTerms {
        let (w, d, sg, e) = match side {
            Side::A => (
                row(&self.p, cell.1),
                row(&self.data, cell.0),
                row(&self.sigma, cell.0),
                row(&self.est, cell.0),
            ),
            Side::P => (
                row(&self.a_t, cell.0),
                row(&self.data_t, cell.1),
                row(&self.sigma_t, cell.1),
                row(&self.est_t, cell.1),
            ),
        };
        if self.single_cell {
            math::gibbs_terms_sparse(w, d, sg, e)
        } else {
            math::gibbs_terms(w, d, sg, e)
        }
    }

    /// Joint terms for moving a mass between two cells of one side. When
    /// both cells share a residual row the change couples through it;
    /// otherwise the two contributions are independent.
    fn move_terms(&self, side: Side, from: (usize, usize), to: (usize, usize)) -> GibbsTerms {
        let shared = match side {
            Side::A => (from.0 == to.0).then(|| {
                (
                    row(&self.p, to.1),
                    row(&self.p, from.1),
                    row(&self.data, from.0),
                    row(&self.sigma, from.0),
                    row(&self.est, from.0),
                )
            }),
            Side::P => (from.1 == to.1).then(|| {
                (
                    row(&self.a_t, to.0),
                    row(&self.a_t, from.0),
                    row(&self.data_t, from.1),
                    row(&self.sigma_t, from.1),
                    row(&self.est_t, from.1),
                )
            }),
        };
        match shared {
            Some((w_add, w_sub, d, sg, e)) => {
                if self.single_cell {
                    math::gibbs_terms_diff_sparse(w_add, w_sub, d, sg, e)
                } else {
                    math::gibbs_terms_diff(w_add, w_sub, d, sg, e)
                }
            }
            None => {
                let add = self.terms_at(side, to);
                let sub = self.terms_at(side, from);
                GibbsTerms {
                    s: add.s + sub.s,
                    s_mu: add.s_mu - sub.s_mu,
                }
            }
        }
    }

    /// Applies a mass delta to one cell: the factor matrix, its transposed
    /// copy, and both layouts of the cached estimate. The cell floors at
    /// zero and the estimate takes the same delta the cell actually took.
    fn apply_change(&mut self, side: Side, cell: (usize, usize), delta: f64) {
        match side {
            Side::A => {
                let (r, c) = cell;
                let old = self.a[(r, c)];
                let value = (old + delta).max(0.0);
                self.a[(r, c)] = value;
                self.a_t[(c, r)] = value;
                let w = self.p.row(c);
                let est_row = self
                    .est
                    .row_mut(r)
                    .into_slice()
                    .expect("row-major estimate");
                math::axpy(w.to_slice().expect("row-major weights"), est_row, value - old);
                self.est_t.column_mut(r).scaled_add(value - old, &w);
            }
            Side::P => {
                let (r, c) = cell;
                let old = self.p[(r, c)];
                let value = (old + delta).max(0.0);
                self.p[(r, c)] = value;
                let w = self.a_t.row(r);
                let est_t_row = self
                    .est_t
                    .row_mut(c)
                    .into_slice()
                    .expect("row-major estimate");
                math::axpy(w.to_slice().expect("row-major weights"), est_t_row, value - old);
                self.est.column_mut(c).scaled_add(value - old, &w);
            }
        }
    }

    /// Temperature-scaled draw from the truncated normal conditional of a
    /// single mass, `None` when the conditional carries no signal or puts
    /// essentially all weight below zero.
    fn gibbs_mass<R: Rng + ?Sized>(
        &self,
        terms: GibbsTerms,
        lambda: f64,
        cap: f64,
        rng: &mut R,
    ) -> Option<f64> {
        let t = terms.scaled(self.annealing_temp);
        if t.s < EPSILON {
            return None;
        }
        let mean = (t.s_mu - lambda) / t.s;
        let sd = 1.0 / t.s.sqrt();
        let norm = Normal::new(mean, sd).ok()?;
        let p_lower = norm.cdf(0.0);
        if p_lower >= 1.0 - EPSILON {
            return None;
        }
        let u = p_lower + rng.random::<f64>() * (1.0 - p_lower);
        Some(norm.inverse_cdf(u).clamp(0.0, cap))
    }

    fn birth<R: Rng + ?Sized>(&mut self, side: Side, rng: &mut R) {
        let pos = self.domain(side).random_free_position(rng);
        let cell = self.cell_of(side, pos);
        let terms = self.terms_at(side, cell);
        let params = *self.side_params(side);

        let mass = if terms.s > EPSILON {
            self.gibbs_mass(terms, params.lambda, params.max_mass, rng)
        } else {
            // no signal along this row yet, draw from the prior
            Some(Exp::new(params.lambda).expect("positive rate").sample(rng))
        };
        if let Some(mass) = mass.filter(|m| *m >= EPSILON) {
            self.domain_mut(side).insert(pos, mass);
            self.apply_change(side, cell, mass);
        }
    }

    /// Removes a uniformly chosen atom, then offers it a rebirth at the same
    /// position with a freshly drawn mass; the rebirth stands when the
    /// tempered likelihood gain beats a uniform draw.
    fn death<R: Rng + ?Sized>(&mut self, side: Side, rng: &mut R) {
        let (pos, mass) = self.domain(side).random_atom(rng);
        self.domain_mut(side).remove(pos);
        let cell = self.cell_of(side, pos);
        self.apply_change(side, cell, -mass);

        let terms = self.terms_at(side, cell);
        let params = *self.side_params(side);
        let rebirth = if terms.s > EPSILON {
            match self.gibbs_mass(terms, params.lambda, params.max_mass, rng) {
                Some(m) if m >= EPSILON => m,
                _ => mass,
            }
        } else {
            mass
        };
        if terms.delta_ll(rebirth) * self.annealing_temp >= rng.random::<f64>().ln() {
            self.domain_mut(side).insert(pos, rebirth);
            self.apply_change(side, cell, rebirth);
        }
    }

    fn move_atom<R: Rng + ?Sized>(&mut self, side: Side, rng: &mut R) {
        let (pos, mass) = self.domain(side).random_atom(rng);
        let (lo, hi) = self.domain(side).neighborhood(pos);
        let new_pos = rng.random_range(lo..=hi);
        if new_pos == pos {
            return;
        }
        let from = self.cell_of(side, pos);
        let to = self.cell_of(side, new_pos);
        if from == to {
            self.domain_mut(side).move_atom(pos, new_pos);
            return;
        }
        let terms = self.move_terms(side, from, to);
        if terms.delta_ll(mass) * self.annealing_temp >= rng.random::<f64>().ln() {
            self.domain_mut(side).move_atom(pos, new_pos);
            self.apply_change(side, from, -mass);
            self.apply_change(side, to, mass);
        }
    }
}

impl FactorSampler for GibbsSampler {
    /// One proposal cycle on one side. An empty domain always proposes a
    /// birth; otherwise birth/death (balanced against the atom count prior)
    /// or a move.
    fn update<R: Rng + ?Sized>(&mut self, side: Side, rng: &mut R) {
        let n = self.domain(side).num_atoms();
        if n == 0 {
            self.birth(side, rng);
            return;
        }
        let u1: f64 = rng.random();
        let bd_prob = if n < 2 { 2.0 / 3.0 } else { 0.5 };
        if u1 <= bd_prob {
            let params = self.side_params(side);
            let prior_atoms = params.alpha * self.domain(side).num_bins() as f64;
            let death_prob = n as f64 / (n as f64 + prior_atoms);
            if rng.random::<f64>() < death_prob {
                self.death(side, rng);
            } else {
                self.birth(side, rng);
            }
        } else {
            self.move_atom(side, rng);
        }
    }

    fn set_temperature(&mut self, t: f64) {
        debug_assert!((0.0..=1.0).contains(&t));
        self.annealing_temp = t;
    }

    fn total_atoms(&self, side: Side) -> f64 {
        self.domain(side).num_atoms() as f64
    }

    fn goodness_of_fit(&self) -> f64 {
        let d = flat(&self.data);
        let sg = flat(&self.sigma);
        let e = flat(&self.est);
        if self.single_cell {
            math::weighted_sq_residual_sparse(d, sg, e)
        } else {
            math::weighted_sq_residual(d, sg, e)
        }
    }

    fn matrix(&self, side: Side) -> ArrayView2<'_, f64> {
        match side {
            Side::A => self.a.view(),
            Side::P => self.p.view(),
        }
    }
}

/// Row-major copy of a caller-supplied matrix when it arrived in any other
/// layout; the kernels slice rows contiguously.
fn standard_layout(m: Array2<f64>) -> Array2<f64> {
    if m.is_standard_layout() {
        m
    } else {
        m.as_standard_layout().into_owned()
    }
}

fn row(m: &Array2<f64>, r: usize) -> &[f64] {
    m.row(r).to_slice().expect("row-major layout")
}

fn flat(m: &Array2<f64>) -> &[f64] {
    m.as_slice().expect("row-major layout")
}
