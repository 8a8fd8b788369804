//! # Record Rendering
//!
//! Turns a position fix plus its scan results into one JSON record.
//!
//! Position fields are written in fixed-point notation with six fractional
//! digits (`"latitude":1.000000`), the format collectors already accept.
//! Unknown values are omitted rather than written as `null`.

use serde::ser::Error as _;
use serde::{Serialize, Serializer};
use serde_json::value::RawValue;
use tracing::debug;

use super::observation::{CellObservation, Position, WifiScanResult};
use crate::error::{Result, StumblerError};

/// Radio technology of a cell tower
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RadioType {
    Gsm,
    Wcdma,
    Cdma,
    Lte,
}

/// Rendered cell tower entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CellTower {
    pub radio_type: RadioType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mobile_country_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mobile_network_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_area_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cell_id: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub psc: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asu: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_strength: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing_advance: Option<i32>,
    /// 1 when the device is registered on this cell
    pub serving: u8,
}

impl From<&CellObservation> for CellTower {
    fn from(cell: &CellObservation) -> Self {
        let serving = u8::from(cell.is_registered());
        let empty = |radio_type| CellTower {
            radio_type,
            mobile_country_code: None,
            mobile_network_code: None,
            location_area_code: None,
            cell_id: None,
            psc: None,
            asu: None,
            signal_strength: None,
            timing_advance: None,
            serving,
        };

        match *cell {
            CellObservation::Gsm { mcc, mnc, lac, cid, asu, .. } => CellTower {
                mobile_country_code: mcc,
                mobile_network_code: mnc,
                location_area_code: lac,
                cell_id: cid,
                asu,
                ..empty(RadioType::Gsm)
            },
            CellObservation::Wcdma { mcc, mnc, lac, cid, psc, asu, .. } => CellTower {
                mobile_country_code: mcc,
                mobile_network_code: mnc,
                location_area_code: lac,
                cell_id: cid,
                psc,
                asu,
                ..empty(RadioType::Wcdma)
            },
            CellObservation::Cdma {
                system_id,
                network_id,
                base_station_id,
                cdma_dbm,
                evdo_dbm,
                ..
            } => {
                // EVDO reading wins when it is usable
                let magnitude = evdo_dbm
                    .filter(|dbm| *dbm >= 0)
                    .or(cdma_dbm)
                    .filter(|dbm| *dbm >= 0);
                CellTower {
                    mobile_network_code: system_id,
                    location_area_code: network_id,
                    cell_id: base_station_id,
                    signal_strength: magnitude.map(|dbm| -dbm),
                    ..empty(RadioType::Cdma)
                }
            }
            CellObservation::Lte {
                mcc,
                mnc,
                tac,
                cid,
                pcid,
                asu,
                rsrp,
                timing_advance,
                ..
            } => CellTower {
                mobile_country_code: mcc,
                mobile_network_code: mnc,
                location_area_code: tac,
                cell_id: cid,
                psc: pcid,
                asu,
                signal_strength: rsrp.and_then(i32::checked_neg),
                timing_advance,
                ..empty(RadioType::Lte)
            },
        }
    }
}

/// Rendered Wi-Fi access point entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WifiAccessPoint {
    /// BSSID with separators removed (`AABBCCDDEEFF`)
    pub mac_address: String,
    pub signal_strength: i32,
}

/// Filter a Wi-Fi scan down to the access points that may be recorded
///
/// Hidden networks (empty SSID) are skipped, and so is every access point
/// whose SSID ends in `opt_out_suffix`.
pub fn visible_access_points(results: &[WifiScanResult], opt_out_suffix: &str) -> Vec<WifiAccessPoint> {
    results
        .iter()
        .filter(|ap| {
            if ap.ssid.is_empty() {
                debug!("Skipping access point without SSID");
                return false;
            }
            if ap.ssid.ends_with(opt_out_suffix) {
                debug!("Skipping opted-out access point");
                return false;
            }
            true
        })
        .map(|ap| WifiAccessPoint {
            mac_address: ap.bssid.chars().filter(|c| *c != ':').collect(),
            signal_strength: ap.signal_strength,
        })
        .collect()
}

/// One measurement event
///
/// A record is immutable once rendered; the only thing that can be done with
/// it is serialize it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    #[serde(serialize_with = "fixed_point")]
    latitude: f64,
    #[serde(serialize_with = "fixed_point")]
    longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "fixed_point_opt")]
    accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "fixed_point_opt")]
    altitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "fixed_point_opt")]
    altitude_accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "fixed_point_opt")]
    heading: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "fixed_point_opt")]
    speed: Option<f64>,
    timestamp: i64,
    cell_towers: Vec<CellTower>,
    /// Absent when the Wi-Fi scan failed
    #[serde(skip_serializing_if = "Option::is_none")]
    wifi_access_points: Option<Vec<WifiAccessPoint>>,
}

impl Record {
    /// Render a record from a fix and its scan results
    ///
    /// # Arguments
    ///
    /// * `position` - The fix; NaN fields are omitted
    /// * `cells` - Cells from every radio-network response that arrived
    /// * `wifi` - Wi-Fi scan results, or `None` if the scan failed
    /// * `opt_out_suffix` - SSID suffix that excludes an access point
    /// * `timestamp_ms` - Milliseconds since the Unix epoch
    ///
    /// # Errors
    ///
    /// Returns `InvalidPosition` if latitude or longitude is unknown
    pub fn render(
        position: &Position,
        cells: &[CellObservation],
        wifi: Option<&[WifiScanResult]>,
        opt_out_suffix: &str,
        timestamp_ms: i64,
    ) -> Result<Self> {
        if !position.has_coordinates() {
            return Err(StumblerError::InvalidPosition(format!(
                "latitude={} longitude={}",
                position.latitude, position.longitude
            )));
        }

        Ok(Self {
            latitude: position.latitude,
            longitude: position.longitude,
            accuracy: known(position.accuracy),
            altitude: known(position.altitude),
            altitude_accuracy: known(position.altitude_accuracy),
            heading: known(position.heading),
            speed: known(position.speed),
            timestamp: timestamp_ms,
            cell_towers: cells.iter().map(CellTower::from).collect(),
            wifi_access_points: wifi.map(|results| visible_access_points(results, opt_out_suffix)),
        })
    }

    /// Serialize as a single-line JSON object
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn cell_towers(&self) -> &[CellTower] {
        &self.cell_towers
    }

    pub fn wifi_access_points(&self) -> Option<&[WifiAccessPoint]> {
        self.wifi_access_points.as_deref()
    }
}

fn known(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

fn fixed_point<S: Serializer>(value: &f64, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    let raw = RawValue::from_string(format!("{:.6}", value)).map_err(S::Error::custom)?;
    raw.serialize(serializer)
}

fn fixed_point_opt<S: Serializer>(
    value: &Option<f64>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match value {
        Some(value) => fixed_point(value, serializer),
        None => serializer.serialize_none(),
    }
}
