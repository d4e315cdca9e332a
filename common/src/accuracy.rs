use crate::error::{LengthMismatchError, ServiceError};
use serde::{Deserialize, Serialize};

/// Hit/total counters for one classify pass. Failed requests count towards
/// `total` and `errors` but never towards `hits`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccuracyAccumulator {
    hits: u64,
    total: u64,
    errors: u64,
}

impl AccuracyAccumulator {
    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn errors(&self) -> u64 {
        self.errors
    }

    /// Valid predictions that named the wrong label.
    pub fn wrong(&self) -> u64 {
        self.total - self.hits - self.errors
    }

    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.hits as f64 / self.total as f64
    }

    fn record(&mut self, predicted: &Result<String, ServiceError>, expected: u8) {
        self.total += 1;
        match predicted {
            Ok(label) if *label == expected.to_string() => self.hits += 1,
            Ok(_) => {}
            Err(_) => self.errors += 1,
        }
    }
}

/// Pairs predictions with expected labels by position.
pub fn aggregate(
    predicted: &[Result<String, ServiceError>],
    expected: &[u8],
) -> Result<AccuracyAccumulator, LengthMismatchError> {
    if predicted.len() != expected.len() {
        return Err(LengthMismatchError {
            predicted: predicted.len(),
            expected: expected.len(),
        });
    }

    let mut acc = AccuracyAccumulator::default();
    for (prediction, &label) in predicted.iter().zip(expected) {
        acc.record(prediction, label);
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(labels: &[&str]) -> Vec<Result<String, ServiceError>> {
        labels.iter().map(|l| Ok(l.to_string())).collect()
    }

    #[test]
    fn all_correct_is_one() {
        let acc = aggregate(&ok(&["0", "1", "7"]), &[0, 1, 7]).unwrap();
        assert_eq!(acc.accuracy(), 1.0);
        assert_eq!((acc.hits(), acc.total()), (3, 3));
    }

    #[test]
    fn all_wrong_is_zero() {
        let acc = aggregate(&ok(&["1", "0", "07"]), &[0, 1, 7]).unwrap();
        assert_eq!(acc.accuracy(), 0.0);
        assert_eq!(acc.wrong(), 3);
    }

    #[test]
    fn errors_are_misses_and_still_counted() {
        let mut predicted = ok(&["0", "1", "x", "3"]);
        predicted[2] = Err(ServiceError::Network("reset".into()));
        let acc = aggregate(&predicted, &[0, 1, 2, 3]).unwrap();
        assert_eq!(acc.total(), 4);
        assert_eq!(acc.hits(), 3);
        assert_eq!(acc.errors(), 1);
        assert_eq!(acc.wrong(), 0);
        assert_eq!(acc.accuracy(), 0.75);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let err = aggregate(&ok(&["0"]), &[0, 1]).unwrap_err();
        assert_eq!(err, LengthMismatchError { predicted: 1, expected: 2 });
    }

    #[test]
    fn empty_input_has_zero_accuracy() {
        let acc = aggregate(&[], &[]).unwrap();
        assert_eq!(acc.total(), 0);
        assert_eq!(acc.accuracy(), 0.0);
    }
}
