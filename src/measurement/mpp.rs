//! Maximum power point extraction and compliance derivation.
//!
//! These are pure functions over already-acquired samples so the orchestrator's
//! numeric decisions can be tested without any hardware.

use serde::{Deserialize, Serialize};

use super::sample::Sample;

/// Below this short-circuit current magnitude (A) the curve is treated as dark.
pub const DARK_CURVE_ISC_THRESHOLD: f64 = 5e-6;

/// Compliance (A) used for dark curves, which need headroom more than sensitivity.
pub const DARK_CURVE_COMPLIANCE: f64 = 1e-5;

/// Result of [`which_max_power`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MaxPowerPoint {
    /// Signed power at the selected sample.
    pub pmax: f64,
    /// Voltage at the selected sample.
    pub vmpp: f64,
    /// Current at the selected sample.
    pub impp: f64,
    /// Index of the selected sample.
    pub index: usize,
}

/// Find the sample with the largest power magnitude.
///
/// Sign-aware: works for illuminated curves (power delivered, `V*I < 0` in the
/// instrument's convention) as well as dark or forward-biased ones. On exact ties
/// the first occurrence wins. Samples with a non-finite power are ignored.
pub fn which_max_power(samples: &[Sample]) -> Option<MaxPowerPoint> {
    let mut best: Option<(usize, f64)> = None;
    for (index, sample) in samples.iter().enumerate() {
        let power = sample.power();
        if !power.is_finite() {
            continue;
        }
        match best {
            Some((_, best_power)) if power.abs() <= best_power.abs() => {}
            _ => best = Some((index, power)),
        }
    }
    best.map(|(index, pmax)| MaxPowerPoint {
        pmax,
        vmpp: samples[index].voltage,
        impp: samples[index].current,
        index,
    })
}

/// Compliance for the phases following a sweep: twice the magnitude of the last
/// swept current, unless overridden. Never below [`DARK_CURVE_COMPLIANCE`], so a
/// sweep ending at zero current still leaves a usable limit.
pub fn compliance_after_sweep(last_current: f64, override_value: Option<f64>) -> f64 {
    override_value.unwrap_or_else(|| (2.0 * last_current).abs().max(DARK_CURVE_COMPLIANCE))
}

/// Compliance for the phases following the short-circuit dwell.
///
/// An explicit override always wins. Otherwise a dark curve (|Isc| below
/// [`DARK_CURVE_ISC_THRESHOLD`]) gets [`DARK_CURVE_COMPLIANCE`], and anything else
/// gets twice |Isc|.
pub fn compliance_after_isc(isc: f64, override_value: Option<f64>) -> f64 {
    match override_value {
        Some(value) => value,
        None if isc.abs() < DARK_CURVE_ISC_THRESHOLD => DARK_CURVE_COMPLIANCE,
        None => (2.0 * isc).abs(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::StatusWord;

    fn curve(points: &[(f64, f64)]) -> Vec<Sample> {
        points
            .iter()
            .enumerate()
            .map(|(i, &(v, c))| Sample::new(i as f64, v, c, StatusWord::default()))
            .collect()
    }

    #[test]
    fn test_unique_maximum_matches_argmax() {
        // illuminated cell: current is negative while delivering power
        let samples = curve(&[(1.0, 0.001), (0.8, -0.010), (0.6, -0.018), (0.4, -0.020), (0.0, -0.021)]);
        let mpp = which_max_power(&samples).unwrap();
        let expected = samples
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.power().abs().total_cmp(&b.1.power().abs()))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(mpp.index, expected);
        assert_eq!(mpp.index, 2);
        assert_eq!(mpp.vmpp, 0.6);
        assert_eq!(mpp.impp, -0.018);
        assert!((mpp.pmax - (-0.0108)).abs() < 1e-12);
    }

    #[test]
    fn test_tie_returns_first_occurrence() {
        let samples = curve(&[(0.1, 0.1), (0.5, 0.2), (0.2, 0.5), (-0.5, -0.2)]);
        let mpp = which_max_power(&samples).unwrap();
        assert_eq!(mpp.index, 1);
    }

    #[test]
    fn test_sign_aware_for_dark_curve() {
        // forward-biased dark curve: positive power grows with voltage
        let samples = curve(&[(0.0, 0.0), (0.5, 1e-6), (1.0, 1e-3)]);
        let mpp = which_max_power(&samples).unwrap();
        assert_eq!(mpp.index, 2);
        assert!(mpp.pmax > 0.0);
    }

    #[test]
    fn test_idempotent() {
        let samples = curve(&[(0.9, -0.002), (0.7, -0.015), (0.5, -0.019), (0.3, -0.020)]);
        assert_eq!(which_max_power(&samples), which_max_power(&samples));
    }

    #[test]
    fn test_empty_and_non_finite() {
        assert!(which_max_power(&[]).is_none());
        let samples = curve(&[(f64::NAN, 1.0), (0.5, -0.01)]);
        assert_eq!(which_max_power(&samples).unwrap().index, 1);
    }

    #[test]
    fn test_dark_curve_compliance() {
        assert_eq!(compliance_after_isc(2e-6, None), 1e-5);
        assert_eq!(compliance_after_isc(-2e-6, None), 1e-5);
    }

    #[test]
    fn test_illuminated_compliance() {
        assert_eq!(compliance_after_isc(2e-3, None), 4e-3);
        assert_eq!(compliance_after_isc(-2e-3, None), 4e-3);
    }

    #[test]
    fn test_override_always_wins() {
        assert_eq!(compliance_after_isc(2e-6, Some(0.1)), 0.1);
        assert_eq!(compliance_after_isc(2e-3, Some(0.1)), 0.1);
        assert_eq!(compliance_after_sweep(-0.02, Some(0.1)), 0.1);
    }

    #[test]
    fn test_compliance_after_sweep_doubles_last_current() {
        assert_eq!(compliance_after_sweep(-0.02, None), 0.04);
    }

    #[test]
    fn test_compliance_after_sweep_has_dark_floor() {
        assert_eq!(compliance_after_sweep(0.0, None), DARK_CURVE_COMPLIANCE);
        assert_eq!(compliance_after_sweep(-1e-9, None), DARK_CURVE_COMPLIANCE);
        assert!(compliance_after_sweep(0.0, None) > 0.0);
    }
}
