//! Stratified fairness metrics
//!
//! Confusion counts are kept separately for the two sensitive strata
//! (`S = 0` "female", `S = 1` "male"). Every metric is a ratio; a zero
//! denominator makes that metric `None` for the pass instead of failing it.

use serde::{Deserialize, Serialize};
use tracing::debug;
use std::fmt;

/// Binary confusion counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionCounts {
    pub tp: u64,
    pub fp: u64,
    pub tn: u64,
    pub fn_: u64,
}

impl ConfusionCounts {
    pub fn record(&mut self, predicted: bool, actual: bool) {
        match (predicted, actual) {
            (true, true) => self.tp += 1,
            (true, false) => self.fp += 1,
            (false, false) => self.tn += 1,
            (false, true) => self.fn_ += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.tp + self.fp + self.tn + self.fn_
    }

    pub fn merged(&self, other: &Self) -> Self {
        Self {
            tp: self.tp + other.tp,
            fp: self.fp + other.fp,
            tn: self.tn + other.tn,
            fn_: self.fn_ + other.fn_,
        }
    }

    /// `TP / (TP + (FP + FN) / 2)`
    pub fn f1(&self) -> Option<f32> {
        ratio(self.tp as f32, self.tp as f32 + (self.fp + self.fn_) as f32 / 2.0)
    }

    pub fn accuracy(&self) -> Option<f32> {
        ratio((self.tp + self.tn) as f32, self.total() as f32)
    }

    pub fn true_positive_rate(&self) -> Option<f32> {
        ratio(self.tp as f32, (self.tp + self.fn_) as f32)
    }

    pub fn false_positive_rate(&self) -> Option<f32> {
        ratio(self.fp as f32, (self.fp + self.tn) as f32)
    }

    /// Share of examples predicted positive
    pub fn positive_rate(&self) -> Option<f32> {
        ratio((self.tp + self.fp) as f32, self.total() as f32)
    }
}

fn ratio(num: f32, den: f32) -> Option<f32> {
    if den == 0.0 {
        None
    } else {
        Some(num / den)
    }
}

/// Confusion counts per sensitive stratum
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StratifiedConfusion {
    /// `S = 0`
    pub female: ConfusionCounts,
    /// `S = 1`
    pub male: ConfusionCounts,
}

impl StratifiedConfusion {
    /// Tally hard predictions against labels, split by sensitive value
    pub fn from_predictions(predictions: &[f32], labels: &[f32], sensitive: &[f32]) -> Self {
        let mut out = Self::default();
        for ((p, y), s) in predictions.iter().zip(labels).zip(sensitive) {
            let stratum = if *s == 0.0 { &mut out.female } else { &mut out.male };
            stratum.record(*p > 0.5, *y > 0.5);
        }
        out
    }

    pub fn overall(&self) -> ConfusionCounts {
        self.female.merged(&self.male)
    }
}

/// Fairness and accuracy summary of one client's evaluation pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FairnessReport {
    pub f1: Option<f32>,
    pub f1_female: Option<f32>,
    pub f1_male: Option<f32>,
    pub accuracy: Option<f32>,
    pub female_accuracy: Option<f32>,
    pub male_accuracy: Option<f32>,
    /// Average odds difference
    pub aod: Option<f32>,
    /// Equal opportunity difference
    pub eod: Option<f32>,
    /// Statistical parity difference
    pub spd: Option<f32>,
}

impl FairnessReport {
    pub fn from_confusion(counts: &StratifiedConfusion) -> Self {
        let f = &counts.female;
        let m = &counts.male;

        let f_tpr = f.true_positive_rate();
        let m_tpr = m.true_positive_rate();
        // A female stratum with no negatives counts as a zero false positive rate
        let f_fpr = if f.fp == 0 && f.tn == 0 {
            Some(0.0)
        } else {
            f.false_positive_rate()
        };
        let m_fpr = m.false_positive_rate();

        let eod = f_tpr.zip(m_tpr).map(|(a, b)| a - b);
        let aod = eod
            .zip(f_fpr.zip(m_fpr).map(|(a, b)| a - b))
            .map(|(tpr_gap, fpr_gap)| (tpr_gap + fpr_gap) / 2.0);
        let spd = f
            .positive_rate()
            .zip(m.positive_rate())
            .map(|(a, b)| a - b);

        let report = Self {
            f1: counts.overall().f1(),
            f1_female: f.f1(),
            f1_male: m.f1(),
            accuracy: counts.overall().accuracy(),
            female_accuracy: f.accuracy(),
            male_accuracy: m.accuracy(),
            aod,
            eod,
            spd,
        };
        report.log_skipped();
        report
    }

    /// Names of the metrics that could not be computed
    pub fn skipped(&self) -> Vec<&'static str> {
        [
            ("f1", self.f1),
            ("f1_female", self.f1_female),
            ("f1_male", self.f1_male),
            ("accuracy", self.accuracy),
            ("female_accuracy", self.female_accuracy),
            ("male_accuracy", self.male_accuracy),
            ("aod", self.aod),
            ("eod", self.eod),
            ("spd", self.spd),
        ]
        .into_iter()
        .filter(|(_, v)| v.is_none())
        .map(|(name, _)| name)
        .collect()
    }

    fn log_skipped(&self) {
        let skipped = self.skipped();
        if !skipped.is_empty() {
            debug!("fairness metrics skipped (zero denominator): {:?}", skipped);
        }
    }

    /// Present metrics as `(name, value)` pairs
    pub fn scalars(&self) -> Vec<(&'static str, f32)> {
        [
            ("f1", self.f1),
            ("f1_female", self.f1_female),
            ("f1_male", self.f1_male),
            ("accuracy", self.accuracy),
            ("female_accuracy", self.female_accuracy),
            ("male_accuracy", self.male_accuracy),
            ("aod", self.aod),
            ("eod", self.eod),
            ("spd", self.spd),
        ]
        .into_iter()
        .filter_map(|(name, v)| v.map(|v| (name, v)))
        .collect()
    }
}

impl fmt::Display for FairnessReport {
    /// Every metric as `name=value`, `n/a` where a ratio was undefined
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = [
            ("female_acc", self.female_accuracy),
            ("male_acc", self.male_accuracy),
            ("f1", self.f1),
            ("f1_female", self.f1_female),
            ("f1_male", self.f1_male),
            ("aod", self.aod),
            ("eod", self.eod),
            ("spd", self.spd),
        ];
        for (i, (name, value)) in fields.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            match value {
                Some(v) => write!(f, "{}={:.4}", name, v)?,
                None => write!(f, "{}=n/a", name)?,
            }
        }
        Ok(())
    }
}
