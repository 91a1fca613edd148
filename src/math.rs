use itertools::izip;
use multiversion::multiversion;

/// Values below this are treated as zero mass / zero precision.
pub(crate) const EPSILON: f64 = 1.0e-10;

/// Coefficients of the log likelihood change for a mass delta at one matrix
/// cell: `delta_ll(m) = m * s_mu - m^2 * s / 2`, where `s` is the conditional
/// precision and `s_mu` the precision-weighted residual along the affected
/// row of the estimate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct GibbsTerms {
    pub s: f64,
    pub s_mu: f64,
}

impl GibbsTerms {
    pub(crate) fn scaled(self, temperature: f64) -> GibbsTerms {
        GibbsTerms {
            s: self.s * temperature,
            s_mu: self.s_mu * temperature,
        }
    }

    pub(crate) fn delta_ll(&self, mass: f64) -> f64 {
        mass * self.s_mu - mass * mass * self.s / 2.0
    }
}

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn gibbs_terms(w: &[f64], data: &[f64], sigma: &[f64], est: &[f64]) -> GibbsTerms {
    let n = w.len();
    assert!(data.len() == n);
    assert!(sigma.len() == n);
    assert!(est.len() == n);

    let mut s = 0f64;
    let mut s_mu = 0f64;
    izip!(w, data, sigma, est).for_each(|(w, d, sg, e)| {
        let prec = 1.0 / (sg * sg);
        s += w * w * prec;
        s_mu += w * (d - e) * prec;
    });
    GibbsTerms { s, s_mu }
}

/// Same as [`gibbs_terms`] but skips entries where the data is exactly zero,
/// the single cell treatment of dropout zeros.
#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn gibbs_terms_sparse(
    w: &[f64],
    data: &[f64],
    sigma: &[f64],
    est: &[f64],
) -> GibbsTerms {
    let n = w.len();
    assert!(data.len() == n);
    assert!(sigma.len() == n);
    assert!(est.len() == n);

    let mut s = 0f64;
    let mut s_mu = 0f64;
    izip!(w, data, sigma, est).for_each(|(w, d, sg, e)| {
        if *d != 0.0 {
            let prec = 1.0 / (sg * sg);
            s += w * w * prec;
            s_mu += w * (d - e) * prec;
        }
    });
    GibbsTerms { s, s_mu }
}

/// Terms for moving one mass within a single residual row: the effective
/// weight is `w_add - w_sub` elementwise.
#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn gibbs_terms_diff(
    w_add: &[f64],
    w_sub: &[f64],
    data: &[f64],
    sigma: &[f64],
    est: &[f64],
) -> GibbsTerms {
    let n = w_add.len();
    assert!(w_sub.len() == n);
    assert!(data.len() == n);
    assert!(sigma.len() == n);
    assert!(est.len() == n);

    let mut s = 0f64;
    let mut s_mu = 0f64;
    izip!(w_add, w_sub, data, sigma, est).for_each(|(wa, ws, d, sg, e)| {
        let w = wa - ws;
        let prec = 1.0 / (sg * sg);
        s += w * w * prec;
        s_mu += w * (d - e) * prec;
    });
    GibbsTerms { s, s_mu }
}

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn gibbs_terms_diff_sparse(
    w_add: &[f64],
    w_sub: &[f64],
    data: &[f64],
    sigma: &[f64],
    est: &[f64],
) -> GibbsTerms {
    let n = w_add.len();
    assert!(w_sub.len() == n);
    assert!(data.len() == n);
    assert!(sigma.len() == n);
    assert!(est.len() == n);

    let mut s = 0f64;
    let mut s_mu = 0f64;
    izip!(w_add, w_sub, data, sigma, est).for_each(|(wa, ws, d, sg, e)| {
        if *d != 0.0 {
            let w = wa - ws;
            let prec = 1.0 / (sg * sg);
            s += w * w * prec;
            s_mu += w * (d - e) * prec;
        }
    });
    GibbsTerms { s, s_mu }
}

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn weighted_sq_residual(data: &[f64], sigma: &[f64], est: &[f64]) -> f64 {
    let n = data.len();
    assert!(sigma.len() == n);
    assert!(est.len() == n);

    izip!(data, sigma, est)
        .map(|(d, sg, e)| {
            let r = (d - e) / sg;
            r * r
        })
        .sum()
}

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn weighted_sq_residual_sparse(data: &[f64], sigma: &[f64], est: &[f64]) -> f64 {
    let n = data.len();
    assert!(sigma.len() == n);
    assert!(est.len() == n);

    izip!(data, sigma, est)
        .map(|(d, sg, e)| {
            if *d == 0.0 {
                0.0
            } else {
                let r = (d - e) / sg;
                r * r
            }
        })
        .sum()
}

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn axpy(x: &[f64], y: &mut [f64], a: f64) {
    let n = x.len();
    assert!(y.len() == n);

    izip!(x, y).for_each(|(x, y)| {
        *y += a * x;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn terms_by_hand() {
        let w = [2.0, 0.0, 1.0];
        let data = [4.0, 5.0, 6.0];
        let sigma = [1.0, 2.0, 0.5];
        let est = [3.0, 3.0, 3.0];

        let t = gibbs_terms(&w, &data, &sigma, &est);
        // s = 4/1 + 0 + 1/0.25, s_mu = 2*1/1 + 0 + 1*3/0.25
        assert_eq!(t.s, 8.0);
        assert_eq!(t.s_mu, 14.0);
    }

    #[test]
    fn sparse_skips_zero_data() {
        let w = [1.0, 1.0];
        let data = [0.0, 2.0];
        let sigma = [1.0, 1.0];
        let est = [5.0, 1.0];

        let t = gibbs_terms_sparse(&w, &data, &sigma, &est);
        assert_eq!(t.s, 1.0);
        assert_eq!(t.s_mu, 1.0);

        assert_eq!(weighted_sq_residual_sparse(&data, &sigma, &est), 1.0);
        assert_eq!(weighted_sq_residual(&data, &sigma, &est), 26.0);
    }

    #[test]
    fn delta_ll_at_zero_mass() {
        let t = GibbsTerms { s: 3.0, s_mu: 2.0 };
        assert_eq!(t.delta_ll(0.0), 0.0);
        // the quadratic peaks at s_mu / s
        let peak = t.s_mu / t.s;
        assert!(t.delta_ll(peak) > t.delta_ll(peak + 0.1));
        assert!(t.delta_ll(peak) > t.delta_ll(peak - 0.1));
    }

    #[test]
    fn scaling_by_temperature() {
        let t = GibbsTerms { s: 3.0, s_mu: 2.0 };
        let half = t.scaled(0.5);
        assert_eq!(half.s, 1.5);
        assert_eq!(half.s_mu, 1.0);
    }

    #[test]
    fn axpy_accumulates() {
        let x = [1.0, 2.0, 3.0];
        let mut y = [1.0, 1.0, 1.0];
        axpy(&x, &mut y, 2.0);
        assert_eq!(y, [3.0, 5.0, 7.0]);
    }

    proptest! {
        #[test]
        fn sparse_matches_dense_on_positive_data(
            w in prop::collection::vec(0.0f64..5.0, 1..20),
            data in prop::collection::vec(0.1f64..5.0, 1..20),
        ) {
            let n = w.len().min(data.len());
            let sigma = vec![0.7; n];
            let est = vec![0.3; n];
            let dense = gibbs_terms(&w[..n], &data[..n], &sigma, &est);
            let sparse = gibbs_terms_sparse(&w[..n], &data[..n], &sigma, &est);
            prop_assert_eq!(dense, sparse);
        }

        #[test]
        fn doubling_weights_quadruples_precision(
            w in prop::collection::vec(0.0f64..5.0, 1..20),
        ) {
            let n = w.len();
            let data = vec![2.0; n];
            let sigma = vec![0.5; n];
            let est = vec![1.5; n];
            let doubled: Vec<f64> = w.iter().map(|v| v * 2.0).collect();
            let base = gibbs_terms(&w, &data, &sigma, &est);
            let scaled = gibbs_terms(&doubled, &data, &sigma, &est);
            // power of two scaling is exact: s is quadratic in w, s_mu linear
            prop_assert_eq!(scaled.s, 4.0 * base.s);
            prop_assert_eq!(scaled.s_mu, 2.0 * base.s_mu);
        }

        #[test]
        fn diff_matches_elementwise_difference(
            w1 in prop::collection::vec(0.0f64..5.0, 8),
            w2 in prop::collection::vec(0.0f64..5.0, 8),
        ) {
            let data = vec![2.0; 8];
            let sigma = vec![0.5; 8];
            let est = vec![1.0; 8];
            let w: Vec<f64> = w1.iter().zip(&w2).map(|(a, b)| a - b).collect();
            let direct = gibbs_terms(&w, &data, &sigma, &est);
            let diff = gibbs_terms_diff(&w1, &w2, &data, &sigma, &est);
            prop_assert!((direct.s - diff.s).abs() < 1e-9);
            prop_assert!((direct.s_mu - diff.s_mu).abs() < 1e-9);
        }

        #[test]
        fn residual_is_nonnegative(
            data in prop::collection::vec(0.0f64..10.0, 1..30),
        ) {
            let n = data.len();
            let sigma = vec![1.3; n];
            let est = vec![0.9; n];
            prop_assert!(weighted_sq_residual(&data, &sigma, &est) >= 0.0);
        }
    }
}
