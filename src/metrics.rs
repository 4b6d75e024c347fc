//! Weighted one-dimensional distribution moments.
//!
//! Derived statistics are `None` when undefined for the accumulated input
//! (no weight, a single effective entry, ...). Callers decide the fallback.

use serde::{Deserialize, Serialize};

/// Running sums of a weighted 1D distribution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Dbn1D {
    pub sum_w: f64,
    pub sum_w2: f64,
    pub sum_wx: f64,
    pub sum_wx2: f64,
    pub num_entries: f64,
}

impl Dbn1D {
    pub fn fill(&mut self, x: f64, w: f64) {
        self.sum_w += w;
        self.sum_w2 += w * w;
        self.sum_wx += w * x;
        self.sum_wx2 += w * x * x;
        self.num_entries += 1.0;
    }

    /// Scale all weights by `factor`. Entry counts are unchanged.
    pub fn scale_w(&mut self, factor: f64) {
        self.sum_w *= factor;
        self.sum_w2 *= factor * factor;
        self.sum_wx *= factor;
        self.sum_wx2 *= factor;
    }

    pub fn merge(&mut self, other: &Dbn1D) {
        self.sum_w += other.sum_w;
        self.sum_w2 += other.sum_w2;
        self.sum_wx += other.sum_wx;
        self.sum_wx2 += other.sum_wx2;
        self.num_entries += other.num_entries;
    }

    /// Effective number of entries, `sumW^2 / sumW2`.
    pub fn eff_num_entries(&self) -> f64 {
        if self.sum_w2 == 0.0 {
            return 0.0;
        }
        self.sum_w * self.sum_w / self.sum_w2
    }

    pub fn mean(&self) -> Option<f64> {
        if self.sum_w == 0.0 {
            return None;
        }
        finite(self.sum_wx / self.sum_w)
    }

    /// Weighted sample variance with the effective-entries correction.
    pub fn variance(&self) -> Option<f64> {
        if self.eff_num_entries() <= 1.0 {
            return None;
        }
        let num = self.sum_wx2 * self.sum_w - self.sum_wx * self.sum_wx;
        let den = self.sum_w * self.sum_w - self.sum_w2;
        if den == 0.0 {
            return None;
        }
        finite((num / den).max(0.0))
    }

    pub fn std_dev(&self) -> Option<f64> {
        self.variance().map(f64::sqrt)
    }

    pub fn std_err(&self) -> Option<f64> {
        let n = self.eff_num_entries();
        if n == 0.0 {
            return None;
        }
        self.variance().and_then(|v| finite((v / n).sqrt()))
    }

    pub fn rms(&self) -> Option<f64> {
        if self.sum_w == 0.0 {
            return None;
        }
        finite((self.sum_wx2 / self.sum_w).sqrt())
    }
}

fn finite(v: f64) -> Option<f64> {
    v.is_finite().then_some(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_distribution_has_no_moments() {
        let d = Dbn1D::default();
        assert_eq!(d.mean(), None);
        assert_eq!(d.variance(), None);
        assert_eq!(d.std_err(), None);
        assert_eq!(d.rms(), None);
        assert_eq!(d.eff_num_entries(), 0.0);
    }

    #[test]
    fn single_entry_has_mean_but_no_variance() {
        let mut d = Dbn1D::default();
        d.fill(3.0, 1.0);
        assert_eq!(d.mean(), Some(3.0));
        assert_eq!(d.variance(), None);
        assert_eq!(d.rms(), Some(3.0));
    }

    #[test]
    fn unit_weights_match_sample_statistics() {
        let mut d = Dbn1D::default();
        for x in [1.0, 2.0, 3.0, 4.0] {
            d.fill(x, 1.0);
        }
        assert_eq!(d.mean(), Some(2.5));
        let var = d.variance().unwrap();
        assert!((var - 5.0 / 3.0).abs() < 1e-12);
        assert!((d.std_err().unwrap() - (var / 4.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn scaling_weights_keeps_mean() {
        let mut d = Dbn1D::default();
        d.fill(1.0, 1.0);
        d.fill(5.0, 1.0);
        d.scale_w(0.5);
        assert_eq!(d.sum_w, 1.0);
        assert_eq!(d.sum_w2, 0.5);
        assert_eq!(d.mean(), Some(3.0));
        assert_eq!(d.num_entries, 2.0);
    }
}
