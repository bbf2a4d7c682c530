//! Classification metrics for the evaluate stage.

use serde::Serialize;

pub fn accuracy(truth: &[usize], predicted: &[usize]) -> f64 {
    if truth.is_empty() {
        return 0.0;
    }
    let correct = truth
        .iter()
        .zip(predicted)
        .filter(|(t, p)| t == p)
        .count();
    correct as f64 / truth.len() as f64
}

/// `matrix[true][predicted]` counts.
pub fn confusion_matrix(truth: &[usize], predicted: &[usize], n_classes: usize) -> Vec<Vec<u64>> {
    let n = truth
        .iter()
        .chain(predicted)
        .map(|c| c + 1)
        .max()
        .unwrap_or(0)
        .max(n_classes);
    let mut matrix = vec![vec![0u64; n]; n];
    for (&t, &p) in truth.iter().zip(predicted) {
        matrix[t][p] += 1;
    }
    matrix
}

/// Support-weighted precision, recall and F1 over the classes present in
/// `truth`. Undefined ratios count as zero.
pub fn precision_recall_f1_weighted(truth: &[usize], predicted: &[usize]) -> (f64, f64, f64) {
    let matrix = confusion_matrix(truth, predicted, 0);
    let total = truth.len() as f64;
    if total == 0.0 {
        return (0.0, 0.0, 0.0);
    }

    let (mut precision, mut recall, mut f1) = (0.0, 0.0, 0.0);
    for class in 0..matrix.len() {
        let support: u64 = matrix[class].iter().sum();
        if support == 0 {
            continue;
        }
        let tp = matrix[class][class] as f64;
        let predicted_pos: u64 = matrix.iter().map(|row| row[class]).sum();

        let p = if predicted_pos == 0 { 0.0 } else { tp / predicted_pos as f64 };
        let r = tp / support as f64;
        let f = if p + r == 0.0 { 0.0 } else { 2.0 * p * r / (p + r) };

        let weight = support as f64 / total;
        precision += weight * p;
        recall += weight * r;
        f1 += weight * f;
    }
    (precision, recall, f1)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EvaluationReport {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub confusion_matrix: Vec<Vec<u64>>,
}

impl EvaluationReport {
    pub fn compute(truth: &[usize], predicted: &[usize], n_classes: usize) -> Self {
        let (precision, recall, f1_score) = precision_recall_f1_weighted(truth, predicted);
        Self {
            accuracy: accuracy(truth, predicted),
            precision,
            recall,
            f1_score,
            confusion_matrix: confusion_matrix(truth, predicted, n_classes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weighted_scores_match_hand_computation() {
        let truth = [0, 0, 1, 1, 1, 2];
        let pred = [0, 1, 1, 1, 2, 2];
        // class 0: p=1, r=0.5; class 1: p=2/3, r=2/3; class 2: p=0.5, r=1
        let (p, r, f) = precision_recall_f1_weighted(&truth, &pred);
        let expect_p = (2.0 * 1.0 + 3.0 * (2.0 / 3.0) + 1.0 * 0.5) / 6.0;
        let expect_r = (2.0 * 0.5 + 3.0 * (2.0 / 3.0) + 1.0 * 1.0) / 6.0;
        let f0 = 2.0 * 1.0 * 0.5 / 1.5;
        let f1c = 2.0 / 3.0;
        let f2 = 2.0 * 0.5 / 1.5;
        let expect_f = (2.0 * f0 + 3.0 * f1c + 1.0 * f2) / 6.0;
        assert!((p - expect_p).abs() < 1e-12);
        assert!((r - expect_r).abs() < 1e-12);
        assert!((f - expect_f).abs() < 1e-12);
        assert!((accuracy(&truth, &pred) - 4.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn class_never_predicted_has_zero_precision() {
        let (p, _, _) = precision_recall_f1_weighted(&[0, 1], &[0, 0]);
        // class 0: p=0.5, class 1: p=0
        assert!((p - 0.25).abs() < 1e-12);
    }

    #[test]
    fn confusion_matrix_rows_are_truth() {
        let m = confusion_matrix(&[0, 1, 1], &[1, 1, 0], 3);
        assert_eq!(m, vec![vec![0, 1, 0], vec![1, 1, 0], vec![0, 0, 0]]);
    }
}
