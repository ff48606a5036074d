//! Common Utilities
//!
//! Numeric helpers used across the CSI engine

use tracing::trace;

/// Convert a linear power ratio to decibels
pub fn linear_to_db(value: f64) -> f64 {
    10.0 * value.log10()
}

/// Convert decibels to a linear power ratio
pub fn db_to_linear(value_db: f64) -> f64 {
    10.0_f64.powf(value_db / 10.0)
}

/// Round to a fixed number of decimal places
pub fn round_to_decimals(value: f64, decimals: i32) -> f64 {
    let scale = 10.0_f64.powi(decimals);
    (value * scale).round() / scale
}

/// Ceiling division for unsigned integers
pub fn ceil_div(numerator: usize, denominator: usize) -> usize {
    (numerator + denominator - 1) / denominator
}

/// Binomial coefficient C(n, k), zero when k > n
pub fn n_choose_k(n: usize, k: usize) -> u64 {
    if k > n {
        return 0;
    }
    let k = k.min(n - k);
    let mut result = 1u64;
    for i in 0..k {
        // C(n, i) * (n - i) is always divisible by (i + 1)
        result = result * (n - i) as u64 / (i + 1) as u64;
    }
    result
}

/// All k-element subsets of 0..n in lexicographic order
pub fn combinations(n: usize, k: usize) -> Vec<Vec<usize>> {
    let mut result = Vec::with_capacity(n_choose_k(n, k) as usize);
    if k > n {
        return result;
    }
    let mut current: Vec<usize> = (0..k).collect();
    loop {
        result.push(current.clone());

        // Find the rightmost element that can still be incremented
        let mut i = k;
        loop {
            if i == 0 {
                trace!("Enumerated {} combinations of {} choose {}", result.len(), n, k);
                return result;
            }
            i -= 1;
            if current[i] < n - k + i {
                break;
            }
        }
        current[i] += 1;
        for j in i + 1..k {
            current[j] = current[j - 1] + 1;
        }
    }
}

/// Mean of the finite values of an iterator, `None` when there are none
pub fn finite_mean<I: IntoIterator<Item = f64>>(values: I) -> Option<f64> {
    let (sum, count) = values
        .into_iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

/// Index of the first maximum of a sequence of optional scores
///
/// `None` entries never win. Ties keep the earliest index.
pub fn first_max_index<I: IntoIterator<Item = Option<f64>>>(scores: I) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (idx, score) in scores.into_iter().enumerate() {
        if let Some(score) = score {
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((idx, score)),
            }
        }
    }
    best.map(|(idx, _)| idx)
}
