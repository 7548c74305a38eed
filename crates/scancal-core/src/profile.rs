//! Flat key-value profile (de)serialization of [`CalibrationData`].
//!
//! The profile store persists settings across process restarts as a simple
//! key-value map: the resolution as an `"HxW"` string, matrices and vectors
//! as numeric arrays. Missing keys leave the corresponding record field
//! invalid; malformed values are an error.

use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::camera::{CameraIntrinsics, Distortion};
use crate::data::{
    CalibrationData, IntrinsicsEstimate, LaserId, LaserPlane, PlatformExtrinsics,
};
use crate::math::{Mat3, Real, Vec3};

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("malformed profile value for '{key}': {reason}")]
    Malformed { key: &'static str, reason: String },
    #[error("inconsistent profile: {0}")]
    Inconsistent(String),
}

const KEY_RESOLUTION: &str = "resolution";
const KEY_CAMERA_MATRIX: &str = "camera_matrix";
const KEY_DISTORTION: &str = "distortion_vector";
const KEY_RMS: &str = "calibration_rms";
const LASER_NORMAL_KEYS: [&str; 2] = ["laser_plane_left_normal", "laser_plane_right_normal"];
const LASER_DISTANCE_KEYS: [&str; 2] = ["laser_plane_left_distance", "laser_plane_right_distance"];
const KEY_PLATFORM_ROTATION: &str = "platform_rotation";
const KEY_PLATFORM_TRANSLATION: &str = "platform_translation";

/// Serialize the valid fields of a record into profile key-value pairs.
pub fn profile_from_data(data: &CalibrationData) -> Map<String, Value> {
    let mut map = Map::new();

    if let Some((w, h)) = data.resolution {
        map.insert(KEY_RESOLUTION.into(), json!(format!("{h}x{w}")));
    }
    if let Some(est) = &data.intrinsics {
        let k = est.intrinsics.k_matrix();
        let rows: Vec<Vec<Real>> = (0..3)
            .map(|r| (0..3).map(|c| k[(r, c)]).collect())
            .collect();
        map.insert(KEY_CAMERA_MATRIX.into(), json!(rows));
        map.insert(KEY_DISTORTION.into(), json!(est.distortion.coefficients()));
        map.insert(KEY_RMS.into(), json!(est.rms_error));
    }
    for id in LaserId::ALL {
        if let Some(plane) = data.laser(id) {
            let n = plane.normal.into_inner();
            map.insert(LASER_NORMAL_KEYS[id.index()].into(), json!([n.x, n.y, n.z]));
            map.insert(LASER_DISTANCE_KEYS[id.index()].into(), json!(plane.distance));
        }
    }
    if let Some(platform) = &data.platform {
        let rows: Vec<Vec<Real>> = (0..3)
            .map(|r| (0..3).map(|c| platform.rotation[(r, c)]).collect())
            .collect();
        map.insert(KEY_PLATFORM_ROTATION.into(), json!(rows));
        let t = platform.translation;
        map.insert(KEY_PLATFORM_TRANSLATION.into(), json!([t.x, t.y, t.z]));
    }

    map
}

/// Rebuild a record from profile key-value pairs.
///
/// Absent keys leave fields unset; present-but-malformed values fail.
pub fn profile_to_data(map: &Map<String, Value>) -> Result<CalibrationData, ProfileError> {
    let mut data = CalibrationData::default();

    if let Some(v) = map.get(KEY_RESOLUTION) {
        data.resolution = Some(parse_resolution(v)?);
    }

    if let Some(v) = map.get(KEY_CAMERA_MATRIX) {
        let k = parse_mat3(v, KEY_CAMERA_MATRIX)?;
        let distortion = match map.get(KEY_DISTORTION) {
            Some(d) => parse_distortion(d)?,
            None => Distortion::default(),
        };
        let rms_error = map
            .get(KEY_RMS)
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let resolution = data.resolution.ok_or_else(|| {
            ProfileError::Inconsistent("camera matrix present without resolution".into())
        })?;
        let est = IntrinsicsEstimate {
            intrinsics: CameraIntrinsics {
                fx: k[(0, 0)],
                fy: k[(1, 1)],
                cx: k[(0, 2)],
                cy: k[(1, 2)],
                skew: k[(0, 1)],
            },
            distortion,
            resolution,
            rms_error,
        };
        est.validate()
            .map_err(|e| ProfileError::Inconsistent(e.to_string()))?;
        data.intrinsics = Some(est);
    }

    for id in LaserId::ALL {
        if let Some(v) = map.get(LASER_NORMAL_KEYS[id.index()]) {
            let normal = parse_vec3(v, LASER_NORMAL_KEYS[id.index()])?;
            let distance = map
                .get(LASER_DISTANCE_KEYS[id.index()])
                .and_then(Value::as_f64)
                .ok_or_else(|| {
                    ProfileError::Inconsistent(format!("laser {id} normal without distance"))
                })?;
            let plane = LaserPlane::new(normal, distance)
                .map_err(|e| ProfileError::Inconsistent(e.to_string()))?;
            data.lasers[id.index()] = Some(plane);
        }
    }

    if let Some(v) = map.get(KEY_PLATFORM_ROTATION) {
        let rotation = parse_mat3(v, KEY_PLATFORM_ROTATION)?;
        let translation = map
            .get(KEY_PLATFORM_TRANSLATION)
            .map(|t| parse_vec3(t, KEY_PLATFORM_TRANSLATION))
            .transpose()?
            .ok_or_else(|| {
                ProfileError::Inconsistent("platform rotation without translation".into())
            })?;
        let platform = PlatformExtrinsics::new(rotation, translation)
            .map_err(|e| ProfileError::Inconsistent(e.to_string()))?;
        data.platform = Some(platform);
    }

    Ok(data)
}

fn parse_resolution(v: &Value) -> Result<(u32, u32), ProfileError> {
    let s = v.as_str().ok_or_else(|| ProfileError::Malformed {
        key: KEY_RESOLUTION,
        reason: "expected \"HxW\" string".into(),
    })?;
    let (h, w) = s.split_once('x').ok_or_else(|| ProfileError::Malformed {
        key: KEY_RESOLUTION,
        reason: format!("missing 'x' separator in {s:?}"),
    })?;
    let parse = |t: &str| {
        t.trim().parse::<u32>().map_err(|e| ProfileError::Malformed {
            key: KEY_RESOLUTION,
            reason: e.to_string(),
        })
    };
    Ok((parse(w)?, parse(h)?))
}

fn parse_numbers(v: &Value, key: &'static str, expected: usize) -> Result<Vec<Real>, ProfileError> {
    let arr = v.as_array().ok_or_else(|| ProfileError::Malformed {
        key,
        reason: "expected numeric array".into(),
    })?;
    if arr.len() != expected {
        return Err(ProfileError::Malformed {
            key,
            reason: format!("expected {expected} values, got {}", arr.len()),
        });
    }
    arr.iter()
        .map(|x| {
            x.as_f64().ok_or_else(|| ProfileError::Malformed {
                key,
                reason: "non-numeric entry".into(),
            })
        })
        .collect()
}

fn parse_vec3(v: &Value, key: &'static str) -> Result<Vec3, ProfileError> {
    let n = parse_numbers(v, key, 3)?;
    Ok(Vec3::new(n[0], n[1], n[2]))
}

fn parse_distortion(v: &Value) -> Result<Distortion, ProfileError> {
    let n = parse_numbers(v, KEY_DISTORTION, 5)?;
    Ok(Distortion {
        k1: n[0],
        k2: n[1],
        p1: n[2],
        p2: n[3],
        k3: n[4],
    })
}

fn parse_mat3(v: &Value, key: &'static str) -> Result<Mat3, ProfileError> {
    let rows = v.as_array().ok_or_else(|| ProfileError::Malformed {
        key,
        reason: "expected 3x3 array".into(),
    })?;
    if rows.len() != 3 {
        return Err(ProfileError::Malformed {
            key,
            reason: format!("expected 3 rows, got {}", rows.len()),
        });
    }
    let mut m = Mat3::zeros();
    for (r, row) in rows.iter().enumerate() {
        let vals = parse_numbers(row, key, 3)?;
        for (c, val) in vals.iter().enumerate() {
            m[(r, c)] = *val;
        }
    }
    Ok(m)
}
