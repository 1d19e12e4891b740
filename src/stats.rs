/// Single-pass moments over one window. Missing values enter as NaN and
/// propagate through every aggregate.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WindowMoments {
    pub(crate) n: usize,
    pub(crate) sum: f64,
    pub(crate) min: f64,
    pub(crate) max: f64,
}

impl WindowMoments {
    #[inline]
    pub(crate) fn mean(self) -> f64 {
        self.sum / self.n as f64
    }
}

pub(crate) fn collect_window_moments(values: impl Iterator<Item = f64>) -> Option<WindowMoments> {
    let mut n = 0_usize;
    let mut sum = 0.0;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for value in values {
        n += 1;
        sum += value;
        if value.is_nan() || min.is_nan() {
            min = f64::NAN;
            max = f64::NAN;
        } else {
            min = min.min(value);
            max = max.max(value);
        }
    }
    if n == 0 {
        return None;
    }
    Some(WindowMoments { n, sum, min, max })
}

/// Bessel-corrected standard deviation from a sum of squared deviations.
#[inline]
pub(crate) fn sample_std(sum_sq_dev: f64, n: usize) -> f64 {
    if n <= 1 {
        return 0.0;
    }
    (sum_sq_dev / (n as f64 - 1.0)).sqrt()
}
