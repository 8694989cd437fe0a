use ndarray::ArrayView1;
use crate::error::{ExperimentError, Result};

/// Harrell's C-index with tie handling
///
/// A pair (i, j) is comparable when i had the event and j was still at risk
/// after t_i. Higher risk for i is concordant; tied risk counts half.
pub fn harrell_c_index(
    risk_scores: ArrayView1<f64>,
    times: ArrayView1<f64>,
    events: &[bool],
) -> Result<f64> {
    let n = risk_scores.len();
    if n != times.len() || n != events.len() {
        return Err(ExperimentError::invalid_dimensions(
            "risk scores, times, and events must have same length"
        ));
    }

    let mut concordant = 0.0;
    let mut discordant = 0.0;
    let mut tied_risk = 0.0;

    for i in 0..n {
        if !events[i] {
            continue;
        }

        for j in 0..n {
            if i == j {
                continue;
            }

            if times[j] > times[i] || (!events[j] && times[j] >= times[i]) {
                if risk_scores[i] > risk_scores[j] {
                    concordant += 1.0;
                } else if risk_scores[i] < risk_scores[j] {
                    discordant += 1.0;
                } else {
                    tied_risk += 1.0;
                }
            }
        }
    }

    let total_pairs = concordant + discordant + tied_risk;
    if total_pairs == 0.0 {
        return Err(ExperimentError::numerical_error(
            "no comparable pairs for C-index calculation"
        ));
    }

    Ok((concordant + 0.5 * tied_risk) / total_pairs)
}

/// C-index for one cause; failures from other causes count as censored
pub fn cause_specific_c_index(
    risk_scores: ArrayView1<f64>,
    times: ArrayView1<f64>,
    events: ArrayView1<usize>,
    cause: usize,
) -> Result<f64> {
    let indicator: Vec<bool> = events.iter().map(|&e| e == cause).collect();
    harrell_c_index(risk_scores, times, &indicator)
}

/// Mean and population standard deviation, skipping NaN entries
pub fn mean_and_std(values: &[f64]) -> Option<(f64, f64)> {
    let finite: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if finite.is_empty() {
        return None;
    }
    let mean = finite.iter().sum::<f64>() / finite.len() as f64;
    let variance = finite.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / finite.len() as f64;
    Some((mean, variance.sqrt()))
}
