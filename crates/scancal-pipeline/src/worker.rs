//! Background session execution.
//!
//! Frame acquisition and the CPU-bound detect/solve work run on a dedicated
//! worker thread so they never block the control thread; progress events flow
//! back over a channel and the returned cancel token aborts the session
//! between frame steps.

use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;

use scancal_core::CalibrationStore;

use crate::session::{
    CalibrationSession, CancelToken, SessionConfig, SessionError, SessionEvent, SessionRegistry,
    SessionReport,
};
use crate::source::Driver;

/// Handle to a session running on a worker thread.
pub struct SessionHandle {
    /// Progress events, in emission order.
    pub events: Receiver<SessionEvent>,
    cancel: CancelToken,
    handle: JoinHandle<Result<SessionReport, SessionError>>,
}

impl SessionHandle {
    /// Request cancellation; the session aborts before its next frame step.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the session to finish and return its outcome.
    pub fn join(self) -> Result<SessionReport, SessionError> {
        self.handle
            .join()
            .unwrap_or(Err(SessionError::WorkerPanicked))
    }
}

/// Run a calibration session on a dedicated worker thread.
///
/// The driver moves onto the worker; the caller keeps the event receiver and
/// the cancel token via the returned handle.
pub fn spawn_session<D>(
    config: SessionConfig,
    store: Arc<CalibrationStore>,
    registry: Arc<SessionRegistry>,
    mut driver: D,
) -> SessionHandle
where
    D: Driver + Send + 'static,
{
    let (tx, rx) = channel();
    let mut session = CalibrationSession::new(config, store, registry);
    let cancel = session.cancel_token();
    session.set_progress(move |event| {
        // The receiver may be gone if the caller stopped listening; the
        // session itself must keep running.
        let _ = tx.send(event.clone());
    });

    let handle = std::thread::spawn(move || session.run(&mut driver));

    SessionHandle {
        events: rx,
        cancel,
        handle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{CaptureSettings, DriverError};
    use scancal_core::{Frame, LaserId, PatternModel};

    struct FlatDriver;

    impl Driver for FlatDriver {
        fn is_connected(&self) -> bool {
            true
        }
        fn capture_frame(&mut self) -> Result<Frame, DriverError> {
            Ok(Frame::from_fn(64, 48, |_, _| 128))
        }
        fn set_resolution(&mut self, _: u32, _: u32) -> Result<(), DriverError> {
            Ok(())
        }
        fn set_frame_rate(&mut self, _: u32) -> Result<(), DriverError> {
            Ok(())
        }
        fn apply_settings(&mut self, _: &CaptureSettings) -> Result<(), DriverError> {
            Ok(())
        }
        fn set_laser(&mut self, _: LaserId, _: bool) -> Result<(), DriverError> {
            Ok(())
        }
        fn rotate_platform(&mut self, _: f64) -> Result<(), DriverError> {
            Ok(())
        }
    }

    #[test]
    fn cancelled_worker_session_reports_cancellation() {
        let pattern = PatternModel::new(3, 4, 10.0, 30.0).unwrap();
        let store = Arc::new(CalibrationStore::new());
        let registry = Arc::new(SessionRegistry::new());

        let handle = spawn_session(
            SessionConfig::intrinsics(pattern),
            Arc::clone(&store),
            registry,
            FlatDriver,
        );
        handle.cancel();

        let result = handle.join();
        // Flat frames never match the pattern: the session either observed
        // the cancel or ran out of its frame budget, but it never commits.
        assert!(result.is_err());
        assert_eq!(store.snapshot().version, 0);
    }

    #[test]
    fn worker_emits_progress_events() {
        let pattern = PatternModel::new(3, 4, 10.0, 30.0).unwrap();
        let store = Arc::new(CalibrationStore::new());
        let registry = Arc::new(SessionRegistry::new());

        let mut config = SessionConfig::intrinsics(pattern);
        config.max_frames = 4;

        let handle = spawn_session(config, store, registry, FlatDriver);
        let mut saw_state_change = false;
        while let Ok(event) = handle.events.recv() {
            if matches!(event, SessionEvent::StateChanged(_)) {
                saw_state_change = true;
            }
        }
        assert!(saw_state_change);
        assert!(matches!(
            handle.join(),
            Err(SessionError::FrameBudgetExhausted { .. })
        ));
    }
}
