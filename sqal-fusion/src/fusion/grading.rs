//! Composite scoring and grade thresholds
//!
//! `composite = Σ(sub_score_i × confidence_i) / Σ(confidence_i)`
//!
//! When every contributing confidence is zero the weights fall back to equal
//! shares and the composite is flagged unweighted.

use sqal_common::config::FusionConfig;
use sqal_common::types::{unit_interval, ModalityAnalysis};
use sqal_common::Grade;

/// Slack applied at each cut point so decimal boundaries survive rounding
pub const GRADE_TOLERANCE: f64 = 1e-9;

/// Fixed cut points mapping composite score to grade
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradeTable {
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

impl GradeTable {
    pub fn from_config(config: &FusionConfig) -> Self {
        Self {
            a: config.grade_a,
            b: config.grade_b,
            c: config.grade_c,
        }
    }

    pub fn grade(&self, score: f64) -> Grade {
        let score = score + GRADE_TOLERANCE;
        if score >= self.a {
            Grade::A
        } else if score >= self.b {
            Grade::B
        } else if score >= self.c {
            Grade::C
        } else {
            Grade::Reject
        }
    }
}

impl Default for GradeTable {
    fn default() -> Self {
        Self::from_config(&FusionConfig::default())
    }
}

/// Numeric outcome of combining a set of analyses
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Composite {
    pub score: f64,
    /// Largest pairwise sub-score gap (0 for a single analysis)
    pub disagreement: f64,
    /// Every confidence was zero; equal weights were used
    pub unweighted: bool,
}

/// Combine analyses into a composite score
///
/// Returns `None` for an empty set. Callers pass analyses in canonical
/// modality order so the floating-point sums are reproducible.
pub fn combine(analyses: &[&ModalityAnalysis]) -> Option<Composite> {
    if analyses.is_empty() {
        return None;
    }

    let total_confidence: f64 = analyses.iter().map(|a| a.confidence).sum();
    let (score, unweighted) = if total_confidence > 0.0 {
        let weighted: f64 = analyses.iter().map(|a| a.sub_score * a.confidence).sum();
        (weighted / total_confidence, false)
    } else {
        let sum: f64 = analyses.iter().map(|a| a.sub_score).sum();
        (sum / analyses.len() as f64, true)
    };

    let max = analyses.iter().map(|a| a.sub_score).fold(f64::MIN, f64::max);
    let min = analyses.iter().map(|a| a.sub_score).fold(f64::MAX, f64::min);

    Some(Composite {
        score: unit_interval(score),
        disagreement: max - min,
        unweighted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqal_common::{Modality, SampleId};
    use std::collections::BTreeMap;

    fn analysis(modality: Modality, sub_score: f64, confidence: f64) -> ModalityAnalysis {
        ModalityAnalysis::new(
            SampleId::from("S-1"),
            "sensor",
            modality,
            BTreeMap::new(),
            sub_score,
            confidence,
        )
    }

    #[test]
    fn test_grade_table_boundaries() {
        let table = GradeTable::default();
        assert_eq!(table.grade(1.0), Grade::A);
        assert_eq!(table.grade(0.85), Grade::A);
        assert_eq!(table.grade(0.849), Grade::B);
        assert_eq!(table.grade(0.60), Grade::B);
        assert_eq!(table.grade(0.5999999999999999), Grade::B);
        assert_eq!(table.grade(0.59), Grade::C);
        assert_eq!(table.grade(0.40), Grade::C);
        assert_eq!(table.grade(0.39), Grade::Reject);
        assert_eq!(table.grade(0.0), Grade::Reject);
    }

    #[test]
    fn test_confidence_weighted_average() {
        let depth = analysis(Modality::DepthArray, 0.8, 0.75);
        let spectral = analysis(Modality::Spectral, 0.4, 0.25);
        let composite = combine(&[&depth, &spectral]).unwrap();

        assert!((composite.score - 0.7).abs() < 1e-12);
        assert!((composite.disagreement - 0.4).abs() < 1e-12);
        assert!(!composite.unweighted);
    }

    #[test]
    fn test_single_analysis_gets_full_weight() {
        let spectral = analysis(Modality::Spectral, 0.72, 0.3);
        let composite = combine(&[&spectral]).unwrap();
        assert!((composite.score - 0.72).abs() < 1e-12);
        assert_eq!(composite.disagreement, 0.0);
    }

    #[test]
    fn test_zero_confidence_falls_back_to_equal_weights() {
        let depth = analysis(Modality::DepthArray, 0.6, 0.0);
        let spectral = analysis(Modality::Spectral, 0.2, 0.0);
        let composite = combine(&[&depth, &spectral]).unwrap();
        assert!((composite.score - 0.4).abs() < 1e-12);
        assert!(composite.unweighted);
    }

    #[test]
    fn test_empty_set_has_no_composite() {
        assert!(combine(&[]).is_none());
    }
}
