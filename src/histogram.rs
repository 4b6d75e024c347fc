//! Aggregation containers produced by analyses and stored in result files.

use crate::metrics::Dbn1D;
use std::collections::BTreeMap;

pub type Annotations = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq)]
pub struct HistoBin1D {
    pub low: f64,
    pub high: f64,
    pub dbn: Dbn1D,
}

impl HistoBin1D {
    pub fn width(&self) -> f64 {
        self.high - self.low
    }

    pub fn midpoint(&self) -> f64 {
        (self.low + self.high) / 2.0
    }

    /// Weighted mean position inside the bin, or the midpoint when empty.
    pub fn focus(&self) -> f64 {
        self.dbn.mean().unwrap_or_else(|| self.midpoint())
    }
}

/// Binned distribution with under/overflow and a total distribution.
#[derive(Debug, Clone, PartialEq)]
pub struct Histo1D {
    pub path: String,
    pub annotations: Annotations,
    pub bins: Vec<HistoBin1D>,
    pub underflow: Dbn1D,
    pub overflow: Dbn1D,
    pub total: Dbn1D,
}

impl Histo1D {
    /// Book `nbins` equal-width bins over `[low, high)`.
    pub fn new(path: impl Into<String>, nbins: usize, low: f64, high: f64) -> Self {
        let width = (high - low) / nbins.max(1) as f64;
        let bins = (0..nbins.max(1))
            .map(|i| HistoBin1D {
                low: low + width * i as f64,
                high: if i + 1 == nbins.max(1) {
                    high
                } else {
                    low + width * (i + 1) as f64
                },
                dbn: Dbn1D::default(),
            })
            .collect();
        Self::with_bins(path, bins)
    }

    pub fn with_bins(path: impl Into<String>, bins: Vec<HistoBin1D>) -> Self {
        let path = path.into();
        let mut annotations = Annotations::new();
        annotations.insert("Path".into(), path.clone());
        annotations.insert("Type".into(), "Histo1D".into());
        Self {
            path,
            annotations,
            bins,
            underflow: Dbn1D::default(),
            overflow: Dbn1D::default(),
            total: Dbn1D::default(),
        }
    }

    pub fn low(&self) -> f64 {
        self.bins.first().map(|b| b.low).unwrap_or(0.0)
    }

    pub fn high(&self) -> f64 {
        self.bins.last().map(|b| b.high).unwrap_or(0.0)
    }

    pub fn fill(&mut self, x: f64, w: f64) {
        self.total.fill(x, w);
        if x < self.low() {
            self.underflow.fill(x, w);
            return;
        }
        match self.bins.iter_mut().find(|b| x >= b.low && x < b.high) {
            Some(bin) => bin.dbn.fill(x, w),
            None => self.overflow.fill(x, w),
        }
    }

    /// Sum of weights, optionally including under/overflow.
    pub fn integral(&self, include_overflows: bool) -> f64 {
        if include_overflows {
            return self.total.sum_w;
        }
        self.bins.iter().map(|b| b.dbn.sum_w).sum()
    }

    pub fn scale_w(&mut self, factor: f64) {
        for bin in &mut self.bins {
            bin.dbn.scale_w(factor);
        }
        self.underflow.scale_w(factor);
        self.overflow.scale_w(factor);
        self.total.scale_w(factor);
    }

    /// Rescale so the integral including overflows equals `target`.
    ///
    /// Returns false (and leaves the histogram untouched) when the integral is
    /// zero, since there is nothing to normalize.
    pub fn normalize(&mut self, target: f64) -> bool {
        let integral = self.integral(true);
        if integral == 0.0 || !integral.is_finite() {
            return false;
        }
        self.scale_w(target / integral);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point2D {
    pub x: f64,
    pub y: f64,
    pub x_err_minus: f64,
    pub x_err_plus: f64,
    pub y_err_minus: f64,
    pub y_err_plus: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scatter2D {
    pub path: String,
    pub annotations: Annotations,
    pub points: Vec<Point2D>,
}

impl Scatter2D {
    pub fn new(path: impl Into<String>, points: Vec<Point2D>) -> Self {
        let path = path.into();
        let mut annotations = Annotations::new();
        annotations.insert("Path".into(), path.clone());
        annotations.insert("Type".into(), "Scatter2D".into());
        Self {
            path,
            annotations,
            points,
        }
    }
}

/// Any object a result file can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisObject {
    Histo1D(Histo1D),
    Scatter2D(Scatter2D),
}

impl AnalysisObject {
    pub fn path(&self) -> &str {
        match self {
            AnalysisObject::Histo1D(h) => &h.path,
            AnalysisObject::Scatter2D(s) => &s.path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_routes_to_bins_and_overflows() {
        let mut h = Histo1D::new("/T/h", 4, 0.0, 4.0);
        h.fill(-1.0, 1.0);
        h.fill(0.5, 1.0);
        h.fill(3.999, 1.0);
        h.fill(4.0, 1.0);
        assert_eq!(h.underflow.sum_w, 1.0);
        assert_eq!(h.bins[0].dbn.sum_w, 1.0);
        assert_eq!(h.bins[3].dbn.sum_w, 1.0);
        assert_eq!(h.overflow.sum_w, 1.0);
        assert_eq!(h.integral(true), 4.0);
        assert_eq!(h.integral(false), 2.0);
    }

    #[test]
    fn normalize_scales_total_to_target() {
        let mut h = Histo1D::new("/T/h", 2, 0.0, 2.0);
        for x in [0.5, 0.5, 1.5, 1.5] {
            h.fill(x, 1.0);
        }
        assert!(h.normalize(1.0));
        assert!((h.integral(true) - 1.0).abs() < 1e-12);
        assert!((h.bins[0].dbn.sum_w - 0.5).abs() < 1e-12);
        assert_eq!(h.total.num_entries, 4.0);
    }

    #[test]
    fn normalize_empty_histogram_is_noop() {
        let mut h = Histo1D::new("/T/h", 2, 0.0, 2.0);
        assert!(!h.normalize(1.0));
        assert_eq!(h.integral(true), 0.0);
    }

    #[test]
    fn focus_falls_back_to_midpoint() {
        let h = Histo1D::new("/T/h", 1, 2.0, 4.0);
        assert_eq!(h.bins[0].focus(), 3.0);
    }
}
