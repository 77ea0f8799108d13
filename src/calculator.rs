//! Derived metrics for a single page view.
//!
//! Units run one way through the whole crate: bytes are converted to kWh with
//! `energy_per_byte`, and kWh to grams CO2e with `carbon_intensity`.

use crate::config::Settings;

/// Load times at or below this many seconds score a perfect 100.
const PERFECT_LOAD_TIME_SECS: f64 = 0.5;

/// Load times beyond this threshold pick up the extra tail penalty.
const SLOW_LOAD_TIME_SECS: f64 = 15.0;

const SLOW_PENALTY_SCALE: f64 = 10.0;
const SLOW_PENALTY_CAP: f64 = 40.0;

/// Convert transferred bytes into `(carbon_grams, energy_kwh)`.
///
/// Negative, NaN, or infinite input is treated as zero bytes.
pub fn compute_carbon_and_energy(bytes: f64, settings: &Settings) -> (f64, f64) {
    let bytes = non_negative(bytes);
    let energy_kwh = bytes * settings.energy_per_byte;
    let carbon_grams = energy_kwh * settings.carbon_intensity;
    (non_negative(carbon_grams), non_negative(energy_kwh))
}

/// Score a page load between 0 and 100, rounded to two decimals.
///
/// Anything up to half a second is perfect. Past that the score decays with
/// `100 - k * log_base(load_time_ms + 1)`, and loads slower than 15 seconds
/// lose up to 40 more points on a log curve of the excess time.
pub fn compute_performance_score(load_time_secs: f64, settings: &Settings) -> f64 {
    let load_time_secs = non_negative(load_time_secs);
    if load_time_secs <= PERFECT_LOAD_TIME_SECS {
        return 100.0;
    }

    let load_time_ms = load_time_secs * 1000.0;
    let mut score = 100.0
        - settings.performance_decay_factor
            * (load_time_ms + 1.0).ln()
            / settings.performance_log_base.ln();

    if load_time_secs > SLOW_LOAD_TIME_SECS {
        let excess = load_time_secs - SLOW_LOAD_TIME_SECS;
        score -= (SLOW_PENALTY_SCALE * excess.ln_1p()).min(SLOW_PENALTY_CAP);
    }

    round2(score.clamp(0.0, 100.0))
}

/// Clamp a stored or derived score into range, treating garbage as unknown.
pub fn sanitize_score(score: Option<f64>) -> Option<f64> {
    score.filter(|value| value.is_finite() && (0.0..=100.0).contains(value))
}

fn non_negative(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 { value } else { 0.0 }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lenient_curve() -> Settings {
        // Gentler constants so the mid-range of the curve is observable.
        Settings {
            performance_decay_factor: 5.0,
            performance_log_base: 10.0,
            ..Settings::default()
        }
    }

    #[test]
    fn test_zero_bytes_is_zero_carbon() {
        let settings = Settings::default();
        assert_eq!(compute_carbon_and_energy(0.0, &settings), (0.0, 0.0));
    }

    #[test]
    fn test_carbon_follows_single_unit_pipeline() {
        let settings = Settings {
            energy_per_byte: 1e-9,
            carbon_intensity: 500.0,
            ..Settings::default()
        };
        let (carbon, energy) = compute_carbon_and_energy(2_000_000_000.0, &settings);
        assert!((energy - 2.0).abs() < 1e-12);
        assert!((carbon - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_bytes_clamp_to_zero() {
        let settings = Settings::default();
        assert_eq!(compute_carbon_and_energy(-5.0, &settings), (0.0, 0.0));
        assert_eq!(compute_carbon_and_energy(f64::NAN, &settings), (0.0, 0.0));
        assert_eq!(compute_carbon_and_energy(f64::INFINITY, &settings), (0.0, 0.0));
    }

    #[test]
    fn test_carbon_is_monotonic_in_bytes() {
        let settings = Settings::default();
        let mut previous = (0.0, 0.0);
        for bytes in (0..50).map(|step| step as f64 * 137_000.0) {
            let current = compute_carbon_and_energy(bytes, &settings);
            assert!(current.0 >= previous.0);
            assert!(current.1 >= previous.1);
            previous = current;
        }
    }

    #[test]
    fn test_fast_load_is_perfect() {
        let settings = Settings::default();
        assert_eq!(compute_performance_score(0.4, &settings), 100.0);
        assert_eq!(compute_performance_score(0.5, &settings), 100.0);
        assert_eq!(compute_performance_score(0.0, &settings), 100.0);
        assert_eq!(compute_performance_score(-3.0, &settings), 100.0);
    }

    #[test]
    fn test_score_is_bounded_and_monotonic() {
        for settings in [Settings::default(), lenient_curve()] {
            let mut previous = 100.0;
            for step in 0..400 {
                let load_time = step as f64 * 0.1;
                let score = compute_performance_score(load_time, &settings);
                assert!((0.0..=100.0).contains(&score), "score {score} out of range");
                assert!(score <= previous, "score rose at {load_time}s");
                previous = score;
            }
        }
    }

    #[test]
    fn test_score_is_rounded_to_two_decimals() {
        let score = compute_performance_score(1.234, &lenient_curve());
        assert_eq!(score, (score * 100.0).round() / 100.0);
        assert!(score > 0.0 && score < 100.0);
    }

    #[test]
    fn test_slow_tail_penalty_applies_past_fifteen_seconds() {
        let settings = lenient_curve();
        let at_threshold = compute_performance_score(15.0, &settings);
        let past_threshold = compute_performance_score(20.0, &settings);
        let base_drop = 5.0 * ((20_001.0f64).ln() - (15_001.0f64).ln()) / 10.0f64.ln();
        assert!(at_threshold - past_threshold > base_drop + 1.0);
    }

    #[test]
    fn test_sanitize_score_filters_out_of_range() {
        assert_eq!(sanitize_score(Some(55.0)), Some(55.0));
        assert_eq!(sanitize_score(Some(120.0)), None);
        assert_eq!(sanitize_score(Some(-1.0)), None);
        assert_eq!(sanitize_score(None), None);
    }
}
