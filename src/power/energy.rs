//! Energy over an interval from a sampled power series.
//!
//! Each sample holds its power from its own offset until the next sample's offset;
//! the last sample holds for one nominal sampling interval. Energy of `[start, end]`
//! is the sum of `power × overlap`, so a sample straddling a boundary is apportioned
//! by the fraction of its hold interval inside the window. Time not covered by any
//! sample contributes nothing, and a window no sample covers at all has unknown
//! energy rather than zero. mW × s = mJ.

use super::sample::PowerSample;

/// Hold interval `[start, end)` of sample `i` in a sorted series.
fn hold_interval(samples: &[PowerSample], i: usize, hold_ms: f64) -> (f64, f64) {
    let start = samples[i].offset_ms;
    let end = match samples.get(i + 1) {
        Some(next) => next.offset_ms,
        None => start + hold_ms,
    };
    (start, end)
}

fn overlap_ms(a: (f64, f64), b: (f64, f64)) -> f64 {
    (a.1.min(b.1) - a.0.max(b.0)).max(0.0)
}

/// Energy in millijoules over `[start_ms, end_ms]`; `None` when no sample's hold
/// interval reaches into the window.
///
/// `samples` must be sorted by offset (the sample buffer guarantees this).
pub fn integrate_energy_mj(
    samples: &[PowerSample],
    start_ms: f64,
    end_ms: f64,
    hold_ms: f64,
) -> Option<f64> {
    let (first, last) = match (samples.first(), samples.last()) {
        (Some(first), Some(last)) => (first.offset_ms, last.offset_ms + hold_ms),
        _ => return None,
    };
    if end_ms <= start_ms {
        // An instant has zero energy if some sample holds at it.
        return (start_ms >= first && start_ms < last).then_some(0.0);
    }
    if covered_ms(samples, start_ms, end_ms, hold_ms) == 0.0 {
        return None;
    }
    let window = (start_ms, end_ms);
    let mut total = 0.0;
    for i in 0..samples.len() {
        let hold = hold_interval(samples, i, hold_ms);
        if hold.0 >= end_ms {
            break;
        }
        let dt_ms = overlap_ms(hold, window);
        if dt_ms > 0.0 {
            total += samples[i].total_mw * dt_ms / 1000.0;
        }
    }
    Some(total)
}

/// The part of a sorted series needed to integrate `[start_ms, end_ms]`: the last
/// sample at or before `start_ms`, every sample inside the window, and the first one
/// after it, which bounds the hold interval of the last one inside.
pub fn covering(samples: &[PowerSample], start_ms: f64, end_ms: f64) -> &[PowerSample] {
    let from = samples
        .partition_point(|s| s.offset_ms <= start_ms)
        .saturating_sub(1);
    let to = (samples.partition_point(|s| s.offset_ms < end_ms) + 1).min(samples.len());
    if from >= to {
        return &[];
    }
    &samples[from..to]
}

/// Milliseconds of `[start_ms, end_ms]` covered by some sample's hold interval.
pub fn covered_ms(samples: &[PowerSample], start_ms: f64, end_ms: f64, hold_ms: f64) -> f64 {
    if samples.is_empty() || end_ms <= start_ms {
        return 0.0;
    }
    let first = samples[0].offset_ms;
    let last = samples[samples.len() - 1].offset_ms + hold_ms;
    overlap_ms((first, last), (start_ms, end_ms))
}

/// Average power in milliwatts over a duration, from energy in millijoules.
pub fn average_power_mw(energy_mj: f64, duration_ms: f64) -> Option<f64> {
    if duration_ms > 0.0 {
        Some(energy_mj / (duration_ms / 1000.0))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(offsets: &[f64], mw: f64) -> Vec<PowerSample> {
        offsets
            .iter()
            .map(|&o| PowerSample::with_total(o, mw))
            .collect()
    }

    #[test]
    fn empty_series_is_none() {
        assert_eq!(integrate_energy_mj(&[], 0.0, 100.0, 100.0), None);
    }

    #[test]
    fn window_outside_every_hold_interval_is_none() {
        let s = series(&[100.0], 1000.0);
        assert_eq!(integrate_energy_mj(&s, 0.0, 50.0, 100.0), None);
        assert_eq!(integrate_energy_mj(&s, 0.0, 100.0, 100.0), None);
        assert_eq!(integrate_energy_mj(&s, 250.0, 300.0, 100.0), None);
        assert_eq!(integrate_energy_mj(&s, 40.0, 40.0, 100.0), None);
        assert_eq!(integrate_energy_mj(&s, 150.0, 150.0, 100.0), Some(0.0));
        let e = integrate_energy_mj(&s, 0.0, 110.0, 100.0).unwrap();
        assert!((e - 10.0).abs() < 1e-9);
    }

    #[test]
    fn three_samples_two_full_intervals() {
        // 1000 mW held over [0, 200] = 200 mJ.
        let s = series(&[0.0, 100.0, 200.0], 1000.0);
        let e = integrate_energy_mj(&s, 0.0, 200.0, 100.0).unwrap();
        assert!((e - 200.0).abs() < 1e-9);
    }

    #[test]
    fn straddling_sample_is_apportioned() {
        let s = vec![
            PowerSample::with_total(0.0, 1000.0),
            PowerSample::with_total(100.0, 3000.0),
        ];
        // [50, 150]: 50 ms at 1000 mW + 50 ms at 3000 mW = 50 + 150 mJ
        let e = integrate_energy_mj(&s, 50.0, 150.0, 100.0).unwrap();
        assert!((e - 200.0).abs() < 1e-9);
    }

    #[test]
    fn window_finer_than_sampling() {
        let s = series(&[0.0, 100.0], 2000.0);
        let e = integrate_energy_mj(&s, 10.0, 12.0, 100.0).unwrap();
        assert!((e - 4.0).abs() < 1e-9);
    }

    #[test]
    fn time_before_first_sample_not_counted() {
        let s = series(&[100.0], 1000.0);
        let e = integrate_energy_mj(&s, 0.0, 200.0, 100.0).unwrap();
        assert!((e - 100.0).abs() < 1e-9);
        assert_eq!(covered_ms(&s, 0.0, 200.0, 100.0), 100.0);
    }

    #[test]
    fn adjacent_windows_sum_to_whole() {
        let s = vec![
            PowerSample::with_total(0.0, 700.0),
            PowerSample::with_total(90.0, 1300.0),
            PowerSample::with_total(170.0, 900.0),
            PowerSample::with_total(260.0, 1100.0),
        ];
        let whole = integrate_energy_mj(&s, 0.0, 300.0, 100.0).unwrap();
        let parts: f64 = [(0.0, 55.0), (55.0, 180.0), (180.0, 300.0)]
            .iter()
            .map(|&(a, b)| integrate_energy_mj(&s, a, b, 100.0).unwrap())
            .sum();
        assert!((whole - parts).abs() < 1e-9);
    }

    #[test]
    fn covering_includes_sample_before_window() {
        let s = series(&[0.0, 100.0, 200.0, 300.0, 400.0], 1.0);
        let offsets: Vec<f64> = covering(&s, 150.0, 320.0).iter().map(|x| x.offset_ms).collect();
        assert_eq!(offsets, vec![100.0, 200.0, 300.0, 400.0]);
        assert!(covering(&[], 0.0, 10.0).is_empty());
        let whole = integrate_energy_mj(&s, 150.0, 320.0, 100.0);
        assert_eq!(integrate_energy_mj(covering(&s, 150.0, 320.0), 150.0, 320.0, 100.0), whole);
    }

    #[test]
    fn average_power() {
        assert_eq!(average_power_mw(200.0, 200.0), Some(1000.0));
        assert_eq!(average_power_mw(1.0, 0.0), None);
    }
}
