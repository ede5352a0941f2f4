//! Validation metrics for fusion training.
//!
//! Everything is derived from a multi-class confusion matrix over predicted
//! and ground-truth class indices.

/// Confusion-matrix-derived validation metrics.
#[derive(Debug, Clone)]
pub struct ValidationMetrics {
    pub accuracy: f64,
    pub precision: Vec<f64>,
    pub recall: Vec<f64>,
    pub f1: Vec<f64>,
    pub macro_f1: f64,
    /// `confusion[actual][predicted]`
    pub confusion: Vec<Vec<usize>>,
}

/// Compute metrics for `num_classes` classes.
///
/// Indices outside `0..num_classes` are ignored.
pub fn compute_validation_metrics(predictions: &[u32], labels: &[u32], num_classes: usize) -> ValidationMetrics {
    assert_eq!(
        predictions.len(),
        labels.len(),
        "predictions and labels must have same length"
    );

    let mut confusion = vec![vec![0usize; num_classes]; num_classes];
    for (&pred, &label) in predictions.iter().zip(labels.iter()) {
        let (pred, label) = (pred as usize, label as usize);
        if pred < num_classes && label < num_classes {
            confusion[label][pred] += 1;
        }
    }

    let total: usize = confusion.iter().flatten().sum();
    let correct: usize = (0..num_classes).map(|c| confusion[c][c]).sum();
    let accuracy = ratio(correct, total);

    let mut precision = Vec::with_capacity(num_classes);
    let mut recall = Vec::with_capacity(num_classes);
    let mut f1 = Vec::with_capacity(num_classes);
    for c in 0..num_classes {
        let tp = confusion[c][c];
        let predicted: usize = confusion.iter().map(|row| row[c]).sum();
        let actual: usize = confusion[c].iter().sum();
        let p = ratio(tp, predicted);
        let r = ratio(tp, actual);
        precision.push(p);
        recall.push(r);
        f1.push(if p + r > 0.0 { 2.0 * p * r / (p + r) } else { 0.0 });
    }
    let macro_f1 = if num_classes > 0 {
        f1.iter().sum::<f64>() / num_classes as f64
    } else {
        0.0
    };

    ValidationMetrics {
        accuracy,
        precision,
        recall,
        f1,
        macro_f1,
        confusion,
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den > 0 {
        num as f64 / den as f64
    } else {
        0.0
    }
}

impl std::fmt::Display for ValidationMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "acc={:.4} macro_f1={:.4}", self.accuracy, self.macro_f1)?;
        for (c, f1) in self.f1.iter().enumerate() {
            write!(f, " f1[{c}]={f1:.4}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_predictions() {
        let preds = vec![0, 1, 2, 2];
        let m = compute_validation_metrics(&preds, &preds, 3);
        assert!((m.accuracy - 1.0).abs() < 1e-9);
        assert!((m.macro_f1 - 1.0).abs() < 1e-9);
        assert_eq!(m.confusion[2][2], 2);
    }

    #[test]
    fn test_all_wrong() {
        let preds = vec![1, 2, 0];
        let labels = vec![0, 1, 2];
        let m = compute_validation_metrics(&preds, &labels, 3);
        assert!(m.accuracy.abs() < 1e-9);
        assert!(m.macro_f1.abs() < 1e-9);
        assert_eq!(m.confusion[0][1], 1);
    }

    #[test]
    fn test_mixed() {
        // actual 0: 2 right, 1 as class 2; actual 1: 1 right; actual 2: 1 right, 1 as class 0
        let labels = vec![0, 0, 0, 1, 2, 2];
        let preds = vec![0, 0, 2, 1, 2, 0];
        let m = compute_validation_metrics(&preds, &labels, 3);
        assert_eq!(m.confusion, vec![vec![2, 0, 1], vec![0, 1, 0], vec![1, 0, 1]]);
        assert!((m.accuracy - 4.0 / 6.0).abs() < 1e-9);
        assert!((m.precision[0] - 2.0 / 3.0).abs() < 1e-9);
        assert!((m.recall[0] - 2.0 / 3.0).abs() < 1e-9);
        assert!((m.precision[2] - 0.5).abs() < 1e-9);
        assert!((m.recall[2] - 0.5).abs() < 1e-9);
        let expected_macro = (2.0 / 3.0 + 1.0 + 0.5) / 3.0;
        assert!((m.macro_f1 - expected_macro).abs() < 1e-9);
    }

    #[test]
    fn test_empty() {
        let m = compute_validation_metrics(&[], &[], 3);
        assert!(m.accuracy.abs() < 1e-9);
        assert!(m.macro_f1.abs() < 1e-9);
    }

    #[test]
    fn test_display() {
        let m = compute_validation_metrics(&[0, 1], &[0, 1], 2);
        assert_eq!(m.to_string(), "acc=1.0000 macro_f1=1.0000 f1[0]=1.0000 f1[1]=1.0000");
    }
}
