//! # Observations
//!
//! Values delivered by the position, radio-network and Wi-Fi sources.
//!
//! Numeric position fields use NaN for "unknown", matching what platform
//! geolocation APIs report. Cell fields the radio layer could not read are
//! `None`.

use serde::Deserialize;

fn unknown() -> f64 {
    f64::NAN
}

/// A position fix
///
/// Missing JSON fields deserialize to NaN.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Position {
    #[serde(default = "unknown")]
    pub latitude: f64,
    #[serde(default = "unknown")]
    pub longitude: f64,
    #[serde(default = "unknown")]
    pub accuracy: f64,
    #[serde(default = "unknown")]
    pub altitude: f64,
    #[serde(default = "unknown")]
    pub altitude_accuracy: f64,
    #[serde(default = "unknown")]
    pub heading: f64,
    #[serde(default = "unknown")]
    pub speed: f64,
}

impl Position {
    /// Create a fix with only coordinates known
    ///
    /// # Examples
    ///
    /// ```
    /// use stumbler::record::Position;
    ///
    /// let fix = Position::new(51.5, -0.12).with_accuracy(12.0);
    /// assert_eq!(fix.accuracy, 12.0);
    /// assert!(fix.speed.is_nan());
    /// ```
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy: f64::NAN,
            altitude: f64::NAN,
            altitude_accuracy: f64::NAN,
            heading: f64::NAN,
            speed: f64::NAN,
        }
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = accuracy;
        self
    }

    pub fn with_altitude(mut self, altitude: f64, altitude_accuracy: f64) -> Self {
        self.altitude = altitude;
        self.altitude_accuracy = altitude_accuracy;
        self
    }

    pub fn with_motion(mut self, heading: f64, speed: f64) -> Self {
        self.heading = heading;
        self.speed = speed;
        self
    }

    /// Whether both coordinates are finite
    pub fn has_coordinates(&self) -> bool {
        self.latitude.is_finite() && self.longitude.is_finite()
    }
}

/// One cell seen by the radio-network scan
///
/// Signal values for CDMA (`cdma_dbm`, `evdo_dbm`) and LTE (`rsrp`) are the
/// positive magnitudes reported by the radio layer; they are negated when
/// rendered.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CellObservation {
    Gsm {
        #[serde(default)]
        registered: bool,
        mcc: Option<i32>,
        mnc: Option<i32>,
        lac: Option<i32>,
        cid: Option<i32>,
        asu: Option<i32>,
    },
    Wcdma {
        #[serde(default)]
        registered: bool,
        mcc: Option<i32>,
        mnc: Option<i32>,
        lac: Option<i32>,
        cid: Option<i32>,
        psc: Option<i32>,
        asu: Option<i32>,
    },
    Cdma {
        #[serde(default)]
        registered: bool,
        system_id: Option<i32>,
        network_id: Option<i32>,
        base_station_id: Option<i32>,
        cdma_dbm: Option<i32>,
        evdo_dbm: Option<i32>,
    },
    Lte {
        #[serde(default)]
        registered: bool,
        mcc: Option<i32>,
        mnc: Option<i32>,
        tac: Option<i32>,
        cid: Option<i32>,
        pcid: Option<i32>,
        asu: Option<i32>,
        rsrp: Option<i32>,
        timing_advance: Option<i32>,
    },
}

impl CellObservation {
    /// Whether the device is registered on (served by) this cell
    pub fn is_registered(&self) -> bool {
        match self {
            CellObservation::Gsm { registered, .. }
            | CellObservation::Wcdma { registered, .. }
            | CellObservation::Cdma { registered, .. }
            | CellObservation::Lte { registered, .. } => *registered,
        }
    }
}

/// One access point seen by the Wi-Fi scan
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WifiScanResult {
    pub bssid: String,
    #[serde(default)]
    pub ssid: String,
    pub signal_strength: i32,
}

impl WifiScanResult {
    pub fn new(bssid: impl Into<String>, ssid: impl Into<String>, signal_strength: i32) -> Self {
        Self {
            bssid: bssid.into(),
            ssid: ssid.into(),
            signal_strength,
        }
    }
}
