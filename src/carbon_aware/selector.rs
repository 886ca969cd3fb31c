//! Selection of the lowest-carbon execution point in a forecast
//!
//! When one forecast sample is at least as long as the job, the best point is
//! simply the sample with the lowest intensity. When the job spans several
//! samples, a window of `k = ceil(job / sample)` consecutive samples slides
//! across the series and the window with the lowest average wins.

use chrono::{DateTime, Duration, Utc};

use crate::carbon_aware::types::EmissionDataPoint;

/// Pick the best execution point for a job of `job_duration_minutes`.
///
/// `points` must be ordered by timestamp and share one sample duration. Ties
/// keep the earliest candidate. A winner that already started before
/// `query_time` is still in effect, so it is moved to one minute after
/// `query_time`.
pub fn select_optimal(
    points: &[EmissionDataPoint],
    job_duration_minutes: u32,
    query_time: DateTime<Utc>,
) -> Option<EmissionDataPoint> {
    let sample_duration = points.first()?.sample_duration_minutes;
    if sample_duration <= 0 {
        return None;
    }

    let job_duration = i64::from(job_duration_minutes);
    let selected = if sample_duration >= job_duration {
        absolute_minimum(points)
    } else {
        sliding_window_minimum(points, window_len(job_duration, sample_duration))
    }?;

    Some(clamp_to_query_time(selected, query_time))
}

/// Number of consecutive samples a job of `job_duration` covers
pub fn window_len(job_duration: i64, sample_duration: i64) -> usize {
    let len = job_duration.saturating_add(sample_duration - 1) / sample_duration;
    usize::try_from(len.max(1)).unwrap_or(usize::MAX)
}

fn absolute_minimum(points: &[EmissionDataPoint]) -> Option<EmissionDataPoint> {
    let mut best: Option<&EmissionDataPoint> = None;
    for point in points {
        match best {
            Some(current) if point.intensity >= current.intensity => {}
            _ => best = Some(point),
        }
    }
    best.cloned()
}

fn sliding_window_minimum(points: &[EmissionDataPoint], k: usize) -> Option<EmissionDataPoint> {
    if points.len() < k {
        return None;
    }

    let mut current_sum: f64 = points[..k].iter().map(|p| p.intensity).sum();
    let mut minimal_sum = current_sum;
    let mut best = 0;

    // Later windows may only start and end inside the first `len - k` points.
    let candidates = &points[..points.len() - k];
    for i in 1..=candidates.len().saturating_sub(k) {
        current_sum = current_sum - candidates[i - 1].intensity + candidates[i + k - 1].intensity;
        if current_sum < minimal_sum {
            minimal_sum = current_sum;
            best = i;
        }
    }

    let start = &points[best];
    Some(EmissionDataPoint::new(
        start.timestamp,
        minimal_sum / k as f64,
        start.sample_duration_minutes,
    ))
}

fn clamp_to_query_time(point: EmissionDataPoint, query_time: DateTime<Utc>) -> EmissionDataPoint {
    if point.timestamp < query_time {
        EmissionDataPoint::new(
            query_time + Duration::minutes(1),
            point.intensity,
            point.sample_duration_minutes,
        )
    } else {
        point
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 16, hour, minute, 0).unwrap()
    }

    fn series(step: i64, values: &[(u32, u32, f64)]) -> Vec<EmissionDataPoint> {
        values
            .iter()
            .map(|&(h, m, v)| EmissionDataPoint::new(at(h, m), v, step))
            .collect()
    }

    // ── absolute minimum ──────────────────────────────────────────────────

    #[test]
    fn test_absolute_minimum_when_sample_covers_job() {
        let points = series(60, &[(9, 0, 50.0), (10, 0, 10.0), (11, 0, 80.0)]);
        let best = select_optimal(&points, 30, at(9, 0)).unwrap();
        assert_eq!(best.timestamp, at(10, 0));
        assert_eq!(best.intensity, 10.0);
    }

    #[test]
    fn test_absolute_minimum_tie_keeps_earliest() {
        let points = series(60, &[(9, 0, 20.0), (10, 0, 16.5), (11, 0, 16.5)]);
        let best = select_optimal(&points, 60, at(9, 0)).unwrap();
        assert_eq!(best.timestamp, at(10, 0));
    }

    // ── sliding window ────────────────────────────────────────────────────

    #[test]
    fn test_single_window_average() {
        let points = series(
            15,
            &[(9, 0, 300.0), (9, 15, 310.0), (9, 30, 280.0), (9, 45, 290.0)],
        );
        let best = select_optimal(&points, 60, at(9, 0)).unwrap();
        assert_eq!(best.timestamp, at(9, 0));
        assert_eq!(best.intensity, 295.0);
    }

    #[test]
    fn test_too_few_points_for_window() {
        let points = series(60, &[(9, 0, 28.5), (10, 0, 29.7)]);
        assert!(select_optimal(&points, 180, at(9, 0)).is_none());
    }

    #[test]
    fn test_window_len_rounds_up() {
        assert_eq!(window_len(60, 15), 4);
        assert_eq!(window_len(49, 15), 4);
        assert_eq!(window_len(45, 15), 3);
        assert_eq!(window_len(60, i64::MAX), 1);
        assert_eq!(window_len(0, 15), 1);
    }

    #[test]
    fn test_minimal_average_window_wins() {
        // 12 quarter-hour samples, job of 30 minutes → k = 2
        let points = series(
            15,
            &[
                (10, 0, 100.0),
                (10, 15, 90.0),
                (10, 30, 40.0),
                (10, 45, 30.0),
                (11, 0, 80.0),
                (11, 15, 90.0),
                (11, 30, 95.0),
                (11, 45, 99.0),
                (12, 0, 95.0),
                (12, 15, 99.0),
                (12, 30, 1.0),
                (12, 45, 1.0),
            ],
        );
        let best = select_optimal(&points, 30, at(10, 0)).unwrap();
        assert_eq!(best.timestamp, at(10, 30));
        assert_eq!(best.intensity, 35.0);
    }

    #[test]
    fn test_equal_windows_keep_first() {
        let points: Vec<_> = (0..9)
            .map(|i| EmissionDataPoint::new(at(10, 0) + Duration::minutes(15 * i), 100.0, 15))
            .collect();
        let best = select_optimal(&points, 60, at(10, 0)).unwrap();
        assert_eq!(best.timestamp, at(10, 0));
        assert_eq!(best.intensity, 100.0);
    }

    #[test]
    fn test_trailing_windows_are_never_considered() {
        // The candidate range is cut to `len - k` before sliding, so with
        // len = 8 and k = 4 only the first window is ever evaluated, even
        // though the last window is far cheaper.
        let points = series(
            15,
            &[
                (10, 0, 300.0),
                (10, 15, 300.0),
                (10, 30, 300.0),
                (10, 45, 300.0),
                (11, 0, 10.0),
                (11, 15, 10.0),
                (11, 30, 10.0),
                (11, 45, 10.0),
            ],
        );
        let best = select_optimal(&points, 60, at(10, 0)).unwrap();
        assert_eq!(best.timestamp, at(10, 0));
        assert_eq!(best.intensity, 300.0);
    }

    #[test]
    fn test_sliding_does_not_find_better_window_in_rising_series() {
        let points = series(
            15,
            &[
                (10, 0, 100.0),
                (10, 15, 110.0),
                (10, 30, 120.0),
                (10, 45, 130.0),
                (11, 0, 140.0),
                (11, 15, 150.0),
            ],
        );
        let best = select_optimal(&points, 60, at(10, 0)).unwrap();
        assert_eq!(best.timestamp, at(10, 0));
        assert_eq!(best.intensity, 115.0);
    }

    // ── clamping ──────────────────────────────────────────────────────────

    #[test]
    fn test_point_in_the_past_is_clamped_forward() {
        let points = series(
            15,
            &[(8, 46, 10.0), (9, 0, 100.0), (9, 15, 110.0), (9, 30, 120.0)],
        );
        let best = select_optimal(&points, 15, at(9, 0)).unwrap();
        assert_eq!(best.timestamp, at(9, 1));
        assert_eq!(best.intensity, 10.0);
    }

    #[test]
    fn test_point_at_query_time_is_not_clamped() {
        let points = series(15, &[(9, 0, 10.0), (9, 15, 100.0)]);
        let best = select_optimal(&points, 15, at(9, 0)).unwrap();
        assert_eq!(best.timestamp, at(9, 0));
    }

    #[test]
    fn test_empty_or_degenerate_input() {
        assert!(select_optimal(&[], 15, at(9, 0)).is_none());
        let zero = vec![EmissionDataPoint::new(at(9, 0), 1.0, 0)];
        assert!(select_optimal(&zero, 15, at(9, 0)).is_none());
    }
}
