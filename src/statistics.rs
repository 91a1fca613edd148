use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::settings::Side;

/// Rescales a factorization pair to the reporting convention: every pattern
/// row of P is divided by its row sum and the matching column of A is
/// multiplied by the same factor, leaving the product A*P unchanged. Rows
/// summing to zero are left as they are.
pub(crate) fn normalized_pair(
    a: ArrayView2<f64>,
    p: ArrayView2<f64>,
) -> (Array2<f64>, Array2<f64>) {
    let mut a_out = a.to_owned();
    let mut p_out = p.to_owned();
    for j in 0..p.nrows() {
        let scale = p.row(j).sum();
        if scale != 0.0 {
            p_out.row_mut(j).mapv_inplace(|v| v / scale);
            a_out.column_mut(j).mapv_inplace(|v| v * scale);
        }
    }
    (a_out, p_out)
}

/// Element-wise running sums and sums of squares of the normalized factor
/// matrices, plus the goodness-of-fit total, updated once per sampling
/// iteration. Means and standard deviations are recomputed from the sums on
/// request, never rescaled incrementally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    a_sum: Array2<f64>,
    a_sum_sq: Array2<f64>,
    p_sum: Array2<f64>,
    p_sum_sq: Array2<f64>,
    chi_sq_sum: f64,
    updates: u64,
}

impl RunningStats {
    pub fn new(a_shape: (usize, usize), p_shape: (usize, usize)) -> Self {
        RunningStats {
            a_sum: Array2::zeros(a_shape),
            a_sum_sq: Array2::zeros(a_shape),
            p_sum: Array2::zeros(p_shape),
            p_sum_sq: Array2::zeros(p_shape),
            chi_sq_sum: 0.0,
            updates: 0,
        }
    }

    pub(crate) fn update(&mut self, a: ArrayView2<f64>, p: ArrayView2<f64>, chi_sq: f64) {
        let (a_norm, p_norm) = normalized_pair(a, p);
        self.a_sum += &a_norm;
        self.a_sum_sq += &a_norm.mapv(|v| v * v);
        self.p_sum += &p_norm;
        self.p_sum_sq += &p_norm.mapv(|v| v * v);
        self.chi_sq_sum += chi_sq;
        self.updates += 1;
    }

    /// Number of sampling iterations folded in so far.
    pub fn counter(&self) -> u64 {
        self.updates
    }

    pub fn mean(&self, side: Side) -> Array2<f64> {
        assert!(self.updates > 0, "statistics queried before any update");
        let (sum, _) = self.side(side);
        sum / self.updates as f64
    }

    /// Population standard deviation, with the radicand clamped at zero to
    /// absorb floating point cancellation.
    pub fn std(&self, side: Side) -> Array2<f64> {
        assert!(self.updates > 0, "statistics queried before any update");
        let n = self.updates as f64;
        let (sum, sum_sq) = self.side(side);
        let mean = sum / n;
        let mut out = sum_sq / n;
        out.zip_mut_with(&mean, |v, m| *v = (*v - m * m).max(0.0).sqrt());
        out
    }

    pub fn mean_chi_sq(&self) -> f64 {
        assert!(self.updates > 0, "statistics queried before any update");
        self.chi_sq_sum / self.updates as f64
    }

    fn side(&self, side: Side) -> (&Array2<f64>, &Array2<f64>) {
        match side {
            Side::A => (&self.a_sum, &self.a_sum_sq),
            Side::P => (&self.p_sum, &self.p_sum_sq),
        }
    }
}

/// Append-only sequence of normalized matrix copies captured during
/// sampling, in capture order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSet {
    pub a: Vec<Array2<f64>>,
    pub p: Vec<Array2<f64>>,
}

impl SnapshotSet {
    /// Appends one already-normalized pair.
    pub(crate) fn push(&mut self, a: Array2<f64>, p: Array2<f64>) {
        self.a.push(a);
        self.p.push(p);
    }

    pub fn len(&self) -> usize {
        debug_assert!(self.a.len() == self.p.len());
        self.a.len()
    }

    pub fn is_empty(&self) -> bool {
        self.a.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use pretty_assertions::assert_eq;

    #[test]
    fn normalization_preserves_the_product() {
        let a = array![[1.0, 2.0], [0.5, 1.5], [3.0, 0.0]];
        let p = array![[2.0, 1.0, 1.0], [0.5, 0.25, 0.25]];
        let (a_n, p_n) = normalized_pair(a.view(), p.view());

        for row in p_n.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
        }
        let before = a.dot(&p);
        let after = a_n.dot(&p_n);
        for (x, y) in before.iter().zip(after.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-12);
        }
    }

    #[test]
    fn zero_pattern_rows_stay_untouched() {
        let a = array![[1.0, 2.0]];
        let p = array![[0.0, 0.0], [1.0, 3.0]];
        let (a_n, p_n) = normalized_pair(a.view(), p.view());
        assert_eq!(p_n.row(0).to_vec(), vec![0.0, 0.0]);
        assert_eq!(a_n[(0, 0)], 1.0);
        assert_abs_diff_eq!(p_n.row(1).sum(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn counter_and_mean_by_hand() {
        // P rows already sum to one, so normalization is the identity here.
        let p = array![[0.5, 0.5]];
        let a1 = array![[2.0], [4.0]];
        let a2 = array![[4.0], [8.0]];

        let mut stats = RunningStats::new((2, 1), (1, 2));
        stats.update(a1.view(), p.view(), 10.0);
        stats.update(a2.view(), p.view(), 20.0);

        assert_eq!(stats.counter(), 2);
        assert_eq!(stats.mean(Side::A), array![[3.0], [6.0]]);
        assert_eq!(stats.mean(Side::P), p);
        assert_abs_diff_eq!(stats.mean_chi_sq(), 15.0, epsilon = 1e-12);

        // std of {2, 4} is 1, of {4, 8} is 2
        let std = stats.std(Side::A);
        assert_abs_diff_eq!(std[(0, 0)], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(std[(1, 0)], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn identical_updates_have_zero_std() {
        let p = array![[1.0]];
        let a = array![[3.0], [5.0]];
        let mut stats = RunningStats::new((2, 1), (1, 1));
        stats.update(a.view(), p.view(), 1.0);
        stats.update(a.view(), p.view(), 1.0);
        assert_eq!(stats.std(Side::A), Array2::zeros((2, 1)));
        assert_eq!(stats.std(Side::P), Array2::zeros((1, 1)));
    }

    #[test]
    fn snapshots_keep_capture_order() {
        let p1 = array![[1.0, 0.0]];
        let p2 = array![[0.0, 2.0]];
        let a = array![[1.0]];

        let mut set = SnapshotSet::default();
        assert!(set.is_empty());
        let (a_n, p_n) = normalized_pair(a.view(), p1.view());
        set.push(a_n, p_n);
        let (a_n, p_n) = normalized_pair(a.view(), p2.view());
        set.push(a_n, p_n);
        assert_eq!(set.len(), 2);
        assert_eq!(set.p[0], array![[1.0, 0.0]]);
        assert_eq!(set.p[1], array![[0.0, 1.0]]);
        assert_eq!(set.a[1], array![[2.0]]);
    }
}
