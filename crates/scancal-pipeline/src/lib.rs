//! Calibration session orchestration.
//!
//! This crate wires the detectors and solvers into runnable calibration
//! sessions: one state machine per calibration target (intrinsics, autocheck,
//! laser planes, platform extrinsics), a driver seam for the host
//! application's camera/board, a worker-thread runner, and profile load/save
//! glue for the calibration record.

/// Session state machine and configuration.
pub mod session;
/// Driver trait and scoped source acquisition.
pub mod source;
/// Worker-thread session execution.
pub mod worker;

pub use session::{
    CalibrationSession, CalibrationTarget, CancelToken, SessionConfig, SessionError, SessionEvent,
    SessionRegistry, SessionReport, SessionState,
};
pub use source::{CaptureSettings, Driver, DriverError, SourceGuard};
pub use worker::{spawn_session, SessionHandle};

use scancal_core::{profile_from_data, profile_to_data, CalibrationStore, ProfileError};
use serde_json::{Map, Value};

/// Load a persisted profile into the store as one atomic commit.
///
/// Fields absent from the profile stay invalid; the previous record is
/// replaced wholesale.
pub fn load_profile(store: &CalibrationStore, map: &Map<String, Value>) -> Result<(), ProfileError> {
    let data = profile_to_data(map)?;
    store.commit(move |d| *d = data);
    Ok(())
}

/// Export the current calibration record as profile key-value pairs.
pub fn save_profile(store: &CalibrationStore) -> Map<String, Value> {
    profile_from_data(&store.snapshot())
}
