//! Classification loss and prediction helpers.

use super::Var;
use crate::{MAMLError, Result};
use ndarray::{Array2, Axis};

/// Mean cross-entropy between row-wise logits `[n, classes]` and integer
/// targets.
///
/// Computed as `logsumexp(z) - z[y]` on max-shifted logits. The row maxima
/// enter as constants; the shift cancels out of the function, so every order
/// of derivative is still exact.
pub fn cross_entropy<'g>(logits: Var<'g>, targets: &[usize]) -> Result<Var<'g>> {
    let (n, classes) = logits.shape();
    if n == 0 {
        return Err(MAMLError::InvalidInput("cross_entropy on an empty batch".to_string()));
    }
    if targets.len() != n {
        return Err(MAMLError::ShapeMismatch(format!(
            "cross_entropy: {} targets for {} rows of logits",
            targets.len(),
            n
        )));
    }

    let mut one_hot = Array2::zeros((n, classes));
    for (row, &target) in targets.iter().enumerate() {
        if target >= classes {
            return Err(MAMLError::InvalidInput(format!(
                "label {target} out of range for {classes} classes"
            )));
        }
        one_hot[[row, target]] = 1.0;
    }

    let graph = logits.graph();
    let row_max = logits
        .data()
        .map_axis(Axis(1), |row| row.fold(f64::NEG_INFINITY, |a, &b| a.max(b)))
        .insert_axis(Axis(1));
    let shifted = logits.sub(graph.constant(row_max).broadcast_cols(classes)?)?;

    let log_norm = shifted.exp().sum_cols().ln();
    let picked = shifted.mul(graph.constant(one_hot))?.sum_cols();

    Ok(log_norm.sub(picked)?.sum().scale(1.0 / n as f64))
}

/// Row-wise softmax of a logits matrix
pub fn softmax_rows(logits: &Array2<f64>) -> Array2<f64> {
    let mut probs = logits.clone();
    for mut row in probs.rows_mut() {
        let max = row.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
        row.mapv_inplace(|x| (x - max).exp());
        let total = row.sum();
        row.mapv_inplace(|x| x / total);
    }
    probs
}

/// Index of the largest entry of each row; the first maximum wins ties
pub fn argmax_rows(scores: &Array2<f64>) -> Vec<usize> {
    scores
        .rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |(best, best_val), (idx, &val)| {
                    if val > best_val {
                        (idx, val)
                    } else {
                        (best, best_val)
                    }
                })
                .0
        })
        .collect()
}
