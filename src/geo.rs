//! # Fix Throttle
//!
//! Admits a new position fix only when enough time has passed and the device
//! has moved far enough since the last admitted fix.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::config::StumbleConfig;
use crate::record::Position;

/// Equatorial Earth radius in meters (WGS 84)
pub const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// Great-circle distance between two points, in meters
///
/// Uses the spherical law of cosines, which is accurate enough for the
/// meter-scale thresholds the throttle works with.
///
/// # Examples
///
/// ```
/// use stumbler::geo::distance_m;
///
/// assert!(distance_m(10.0, 20.0, 10.0, 20.0) < 1.0);
/// assert!((distance_m(0.0, 0.0, 0.0, 1.0) - 111_319.49).abs() < 1.0);
/// ```
pub fn distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let delta_lambda = (lon2 - lon1).to_radians();

    let cos_delta = phi1.sin() * phi2.sin() + phi1.cos() * phi2.cos() * delta_lambda.cos();
    // rounding can push identical points just past 1.0
    cos_delta.clamp(-1.0, 1.0).acos() * EARTH_RADIUS_M
}

#[derive(Debug, Clone, Copy)]
struct AdmittedFix {
    latitude: f64,
    longitude: f64,
    at: DateTime<Utc>,
}

/// Time and distance gate in front of the aggregator
#[derive(Debug, Clone)]
pub struct FixThrottle {
    min_interval: Duration,
    min_distance_m: f64,
    last: Option<AdmittedFix>,
}

impl FixThrottle {
    pub fn new(min_interval: Duration, min_distance_m: f64) -> Self {
        Self {
            min_interval,
            min_distance_m,
            last: None,
        }
    }

    pub fn from_config(config: &StumbleConfig) -> Self {
        let interval_ms = i64::try_from(config.min_interval_ms).unwrap_or(i64::MAX);
        Self::new(
            Duration::try_milliseconds(interval_ms).unwrap_or_else(|| Duration::hours(1)),
            config.min_distance_m,
        )
    }

    /// Decide whether `position`, observed at `now`, starts a new stumble
    ///
    /// Fixes without coordinates are never admitted. A clock that went
    /// backwards since the last admitted fix does not block admission.
    pub fn admit(&mut self, position: &Position, now: DateTime<Utc>) -> bool {
        if !position.has_coordinates() {
            return false;
        }

        if let Some(last) = self.last {
            let elapsed = now.signed_duration_since(last.at);
            if elapsed >= Duration::zero() && elapsed < self.min_interval {
                debug!(elapsed_ms = elapsed.num_milliseconds(), "Fix too soon, skipping");
                return false;
            }

            let moved = distance_m(last.latitude, last.longitude, position.latitude, position.longitude);
            if moved < self.min_distance_m {
                debug!(moved_m = moved, "Fix too close, skipping");
                return false;
            }
        }

        self.last = Some(AdmittedFix {
            latitude: position.latitude,
            longitude: position.longitude,
            at: now,
        });
        true
    }
}
