//! Special functions needed by the hurdle-gamma machinery.
//!
//! The fitter needs the digamma and trigamma functions for Minka's
//! fixed-point update, and the classifier needs the gamma density. All three
//! are computed with the standard recurrence-shift plus asymptotic-series
//! approach: shift the argument up until the asymptotic expansion is
//! accurate, accumulating the recurrence terms, then apply the series.

use std::f64::consts::PI;

/// Natural log of the gamma function, ln Γ(x), for x > 0.
///
/// Uses the recurrence ln Γ(x) = ln Γ(x+1) − ln x to shift x above 12, then
/// Stirling's series with Bernoulli corrections. Accurate to well beyond
/// 1e-10 absolute error over the fitter's operating range.
pub fn ln_gamma(x: f64) -> f64 {
    if x <= 0.0 {
        return f64::INFINITY;
    }

    let mut x = x;
    let mut shift = 0.0;
    while x < 12.0 {
        shift -= x.ln();
        x += 1.0;
    }

    let inv_x = 1.0 / x;
    let inv_x2 = inv_x * inv_x;
    let correction = inv_x * (1.0 / 12.0 - inv_x2 * (1.0 / 360.0 - inv_x2 / 1260.0));

    shift + (x - 0.5) * x.ln() - x + 0.5 * (2.0 * PI).ln() + correction
}

/// Digamma function ψ(x) = d/dx ln Γ(x), for x > 0.
pub fn digamma(x: f64) -> f64 {
    if x <= 0.0 {
        return f64::NAN;
    }

    let mut x = x;
    let mut result = 0.0;
    while x < 12.0 {
        result -= 1.0 / x;
        x += 1.0;
    }

    let inv_x = 1.0 / x;
    let inv_x2 = inv_x * inv_x;
    result + x.ln() - 0.5 * inv_x - inv_x2 / 12.0 + inv_x2 * inv_x2 / 120.0
        - inv_x2 * inv_x2 * inv_x2 / 252.0
}

/// Trigamma function ψ′(x), for x > 0.
pub fn trigamma(x: f64) -> f64 {
    if x <= 0.0 {
        return f64::NAN;
    }

    let mut x = x;
    let mut result = 0.0;
    while x < 12.0 {
        result += 1.0 / (x * x);
        x += 1.0;
    }

    // Asymptotic series: 1/x + 1/(2x²) + 1/(6x³) − 1/(30x⁵) + 1/(42x⁷)
    let inv_x = 1.0 / x;
    let inv_x2 = inv_x * inv_x;
    result
        + inv_x * (1.0 + inv_x * (0.5 + inv_x * (1.0 / 6.0 - inv_x2 * (1.0 / 30.0 - inv_x2 / 42.0))))
}

/// Log of the gamma density with shape/scale parameterization.
///
/// Returns −∞ for non-positive x (the hurdle layer handles the point mass at
/// zero separately).
pub fn gamma_log_pdf(x: f64, shape: f64, scale: f64) -> f64 {
    if x <= 0.0 || shape <= 0.0 || scale <= 0.0 {
        return f64::NEG_INFINITY;
    }
    (shape - 1.0) * x.ln() - x / scale - ln_gamma(shape) - shape * scale.ln()
}

/// Gamma density with shape/scale parameterization. Evaluated in log space
/// for stability at the extreme scales seen with base-pair length data.
pub fn gamma_pdf(x: f64, shape: f64, scale: f64) -> f64 {
    let lp = gamma_log_pdf(x, shape, scale);
    if lp.is_nan() { f64::NAN } else { lp.exp() }
}
