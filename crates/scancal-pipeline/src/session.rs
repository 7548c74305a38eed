//! Calibration session state machine.
//!
//! One session drives one calibration target through
//! `Idle → Capturing → Accumulating → Solving → Validating →
//! {Committed | Failed} → Idle`. Per-frame pattern misses are counted and
//! reported, never fatal; every other failure ends the session in `Failed`
//! with a typed error and leaves the calibration store untouched. A cancel
//! request is honored between every frame step, and a cancel arriving during
//! the solve discards the finished result instead of committing it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info};
use thiserror::Error;

use scancal_core::{CalibrationStore, LaserId, PatternModel, Pt2, Pt3, TargetView};
use scancal_detect::{
    detect_pattern, extract_stripe, DetectError, GridDetectorConfig, StripeConfig, StripeError,
};
use scancal_linear::{
    dlt_homography, fit_plane, fit_rotation_axis, intersect_target_plane, pose_from_homography,
    AxisFitConfig, AxisFitError, PlaneFitError,
};
use scancal_optim::{calibrate_intrinsics, CalibrateError, IntrinsicsConfig};

use crate::source::{CaptureSettings, Driver, DriverError, SourceGuard};

/// What a session calibrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum CalibrationTarget {
    Intrinsics,
    Autocheck,
    Laser(LaserId),
    Platform,
}

impl std::fmt::Display for CalibrationTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CalibrationTarget::Intrinsics => write!(f, "intrinsics"),
            CalibrationTarget::Autocheck => write!(f, "autocheck"),
            CalibrationTarget::Laser(id) => write!(f, "{id} laser"),
            CalibrationTarget::Platform => write!(f, "platform"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Capturing,
    Accumulating,
    Solving,
    Validating,
    Committed,
    Failed,
}

/// Progress notifications delivered to the caller while a session runs.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),
    FrameAccepted { accepted: usize, needed: usize },
    FrameSkipped { skipped: usize },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a {0} session is already active")]
    Busy(CalibrationTarget),
    #[error("session cancelled")]
    Cancelled,
    #[error("intrinsics must be calibrated before a {0} session")]
    MissingIntrinsics(CalibrationTarget),
    #[error("frame budget exhausted: {accepted} of {needed} usable frames after {processed}")]
    FrameBudgetExhausted {
        accepted: usize,
        needed: usize,
        processed: usize,
    },
    #[error("degenerate view geometry: {0}")]
    Geometry(String),
    #[error("result failed validation: {0}")]
    Validation(String),
    #[error("autocheck failed: {0}")]
    AutocheckFailed(String),
    #[error("session worker panicked")]
    WorkerPanicked,
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Calibration(#[from] CalibrateError),
    #[error(transparent)]
    PlaneFit(#[from] PlaneFitError),
    #[error(transparent)]
    AxisFit(#[from] AxisFitError),
    #[error(transparent)]
    Stripe(#[from] StripeError),
}

/// Cooperative cancellation flag shared with the session owner.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Tracks which targets have an active session.
///
/// Starting a second session for the same target fails with
/// [`SessionError::Busy`]; the slot is released on every exit path.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    active: Mutex<HashSet<CalibrationTarget>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(
        self: &Arc<Self>,
        target: CalibrationTarget,
    ) -> Result<TargetSlot, SessionError> {
        let mut active = self.active.lock().expect("session registry poisoned");
        if !active.insert(target) {
            return Err(SessionError::Busy(target));
        }
        Ok(TargetSlot {
            registry: Arc::clone(self),
            target,
        })
    }
}

/// Registry slot held for the lifetime of one session run.
pub struct TargetSlot {
    registry: Arc<SessionRegistry>,
    target: CalibrationTarget,
}

impl Drop for TargetSlot {
    fn drop(&mut self) {
        self.registry
            .active
            .lock()
            .expect("session registry poisoned")
            .remove(&self.target);
    }
}

/// Per-session configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionConfig {
    pub target: CalibrationTarget,
    pub pattern: PatternModel,
    pub detector: GridDetectorConfig,
    pub stripe: StripeConfig,
    pub intrinsics: IntrinsicsConfig,
    /// Camera settings applied for the duration of the session.
    pub capture: CaptureSettings,
    /// Usable frames/steps to accumulate before solving.
    pub target_views: usize,
    /// Upper bound on captured frames before the session gives up.
    pub max_frames: usize,
    /// Platform step between captures, in radians.
    pub platform_step_rad: f64,
    /// Largest tolerated mean step-angle residual of the axis fit.
    pub max_axis_residual_rad: f64,
    /// Minimum stripe points for a laser frame to count.
    pub min_stripe_points: usize,
    /// Plausible focal length range, in pixels.
    pub focal_range_px: (f64, f64),
    /// Largest acceptable plane-fit RMSE, in millimetres.
    pub max_plane_rmse: f64,
    /// Autocheck: minimum fraction of frames with the pattern found.
    pub min_pattern_rate: f64,
}

impl SessionConfig {
    fn base(target: CalibrationTarget, pattern: PatternModel, capture: CaptureSettings) -> Self {
        Self {
            target,
            pattern,
            detector: GridDetectorConfig::default(),
            stripe: StripeConfig::default(),
            intrinsics: IntrinsicsConfig::default(),
            capture,
            target_views: 8,
            max_frames: 120,
            platform_step_rad: 0.1,
            max_axis_residual_rad: 0.02,
            min_stripe_points: 15,
            focal_range_px: (100.0, 20_000.0),
            max_plane_rmse: 2.0,
            min_pattern_rate: 0.5,
        }
    }

    pub fn intrinsics(pattern: PatternModel) -> Self {
        Self::base(
            CalibrationTarget::Intrinsics,
            pattern,
            CaptureSettings::pattern(),
        )
    }

    pub fn autocheck(pattern: PatternModel) -> Self {
        let mut config = Self::base(
            CalibrationTarget::Autocheck,
            pattern,
            CaptureSettings::pattern(),
        );
        config.target_views = 4;
        config
    }

    pub fn laser(pattern: PatternModel, id: LaserId) -> Self {
        let mut config = Self::base(
            CalibrationTarget::Laser(id),
            pattern,
            CaptureSettings::laser(),
        );
        config.target_views = 5;
        config
    }

    pub fn platform(pattern: PatternModel, step_rad: f64) -> Self {
        let mut config = Self::base(
            CalibrationTarget::Platform,
            pattern,
            CaptureSettings::pattern(),
        );
        config.platform_step_rad = step_rad;
        config
    }
}

/// Summary returned by a completed session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub target: CalibrationTarget,
    pub accepted: usize,
    pub skipped: usize,
    /// Store version written by the commit; `None` for autocheck.
    pub committed_version: Option<u64>,
}

type ProgressFn = dyn FnMut(&SessionEvent) + Send;

/// Drives one calibration target from capture to commit.
pub struct CalibrationSession {
    config: SessionConfig,
    store: Arc<CalibrationStore>,
    registry: Arc<SessionRegistry>,
    cancel: CancelToken,
    state: SessionState,
    on_event: Option<Box<ProgressFn>>,
}

impl CalibrationSession {
    pub fn new(
        config: SessionConfig,
        store: Arc<CalibrationStore>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            cancel: CancelToken::new(),
            state: SessionState::Idle,
            on_event: None,
        }
    }

    /// Token for cancelling this session from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn set_progress(&mut self, callback: impl FnMut(&SessionEvent) + Send + 'static) {
        self.on_event = Some(Box::new(callback));
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the session to completion on the calling thread.
    ///
    /// On success the result has been committed (autocheck commits nothing);
    /// on failure the store is untouched and the error names the cause. The
    /// frame source is released on every path.
    pub fn run<D: Driver + ?Sized>(
        &mut self,
        driver: &mut D,
    ) -> Result<SessionReport, SessionError> {
        let _slot = self.registry.try_acquire(self.config.target)?;
        self.cancel.reset();

        let result = self.run_inner(driver);
        match &result {
            Ok(report) => info!(
                "{} session committed ({} accepted, {} skipped)",
                self.config.target, report.accepted, report.skipped
            ),
            Err(SessionError::Cancelled) => {
                debug!("{} session cancelled, partial data discarded", self.config.target);
            }
            Err(e) => {
                self.set_state(SessionState::Failed);
                info!("{} session failed: {e}", self.config.target);
            }
        }
        self.set_state(SessionState::Idle);
        result
    }

    fn run_inner<D: Driver + ?Sized>(
        &mut self,
        driver: &mut D,
    ) -> Result<SessionReport, SessionError> {
        let mut source = SourceGuard::acquire(driver, &self.config.capture)?;
        self.set_state(SessionState::Capturing);

        match self.config.target {
            CalibrationTarget::Intrinsics => self.run_intrinsics(&mut source),
            CalibrationTarget::Autocheck => self.run_autocheck(&mut source),
            CalibrationTarget::Laser(id) => self.run_laser(&mut source, id),
            CalibrationTarget::Platform => self.run_platform(&mut source),
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            self.state = state;
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    fn emit(&mut self, event: SessionEvent) {
        if let Some(cb) = self.on_event.as_mut() {
            cb(&event);
        }
    }

    fn check_cancel(&self) -> Result<(), SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        Ok(())
    }

    fn budget_check(
        &self,
        processed: usize,
        accepted: usize,
    ) -> Result<(), SessionError> {
        if processed >= self.config.max_frames {
            return Err(SessionError::FrameBudgetExhausted {
                accepted,
                needed: self.config.target_views,
                processed,
            });
        }
        Ok(())
    }

    fn note_accepted(&mut self, accepted: usize) {
        if accepted == 1 {
            self.set_state(SessionState::Accumulating);
        }
        self.emit(SessionEvent::FrameAccepted {
            accepted,
            needed: self.config.target_views,
        });
    }

    fn note_skipped(&mut self, skipped: usize) {
        self.emit(SessionEvent::FrameSkipped { skipped });
    }

    // ── Intrinsics ─────────────────────────────────────────────────────────

    fn run_intrinsics<D: Driver + ?Sized>(
        &mut self,
        source: &mut SourceGuard<'_, D>,
    ) -> Result<SessionReport, SessionError> {
        let mut views: Vec<TargetView> = Vec::new();
        let mut skipped = 0;
        let mut processed = 0;
        let mut resolution = None;

        while views.len() < self.config.target_views {
            self.check_cancel()?;
            self.budget_check(processed, views.len())?;

            let frame = source.capture_frame()?;
            processed += 1;
            resolution = Some(frame.resolution());

            match detect_pattern(&frame, &self.config.pattern, &self.config.detector) {
                Ok(view) => {
                    views.push(view);
                    self.note_accepted(views.len());
                }
                Err(DetectError::NotFound) => {
                    skipped += 1;
                    self.note_skipped(skipped);
                }
            }
        }

        let Some(resolution) = resolution else {
            return Err(SessionError::Validation("no frames captured".into()));
        };

        self.check_cancel()?;
        self.set_state(SessionState::Solving);
        let estimate = calibrate_intrinsics(&views, resolution, &self.config.intrinsics)?;

        // A cancel that arrived while solving discards the finished result.
        self.check_cancel()?;
        self.set_state(SessionState::Validating);
        let (f_min, f_max) = self.config.focal_range_px;
        if !(f_min..=f_max).contains(&estimate.intrinsics.fx)
            || !(f_min..=f_max).contains(&estimate.intrinsics.fy)
        {
            return Err(SessionError::Validation(format!(
                "focal length ({:.1}, {:.1}) px outside plausible range [{f_min}, {f_max}]",
                estimate.intrinsics.fx, estimate.intrinsics.fy
            )));
        }

        let version = self.store.commit(|d| {
            d.intrinsics = Some(estimate);
            d.resolution = Some(estimate.resolution);
        });
        self.set_state(SessionState::Committed);

        Ok(SessionReport {
            target: self.config.target,
            accepted: views.len(),
            skipped,
            committed_version: Some(version),
        })
    }

    // ── Laser plane ────────────────────────────────────────────────────────

    fn run_laser<D: Driver + ?Sized>(
        &mut self,
        source: &mut SourceGuard<'_, D>,
        id: LaserId,
    ) -> Result<SessionReport, SessionError> {
        let snapshot = self.store.snapshot();
        let Some(intrinsics) = snapshot.intrinsics else {
            return Err(SessionError::MissingIntrinsics(self.config.target));
        };
        let camera = intrinsics.camera();
        let kmtx = intrinsics.intrinsics.k_matrix();

        let mut points: Vec<Pt3> = Vec::new();
        let mut accepted = 0;
        let mut skipped = 0;
        let mut processed = 0;

        while accepted < self.config.target_views {
            self.check_cancel()?;
            self.budget_check(processed, accepted)?;

            source.set_laser(id, false)?;
            let background = source.capture_frame()?;
            source.set_laser(id, true)?;
            let frame = source.capture_frame()?;
            source.set_laser(id, false)?;
            processed += 1;

            let view = match detect_pattern(&background, &self.config.pattern, &self.config.detector)
            {
                Ok(view) => view,
                Err(DetectError::NotFound) => {
                    skipped += 1;
                    self.note_skipped(skipped);
                    continue;
                }
            };

            let stripe = extract_stripe(&frame, Some(&background), &self.config.stripe)?;
            if stripe.len() < self.config.min_stripe_points {
                debug!("laser frame rejected: {} stripe points", stripe.len());
                skipped += 1;
                self.note_skipped(skipped);
                continue;
            }

            let planar: Vec<Pt2> = view.points_3d.iter().map(|p| Pt2::new(p.x, p.y)).collect();
            let h = dlt_homography(&planar, &view.points_2d)
                .map_err(|e| SessionError::Geometry(e.to_string()))?;
            let pose = pose_from_homography(&kmtx, &h)
                .map_err(|e| SessionError::Geometry(e.to_string()))?;

            let pixels: Vec<Pt2> = stripe
                .iter()
                .map(|p| Pt2::new(p.column, p.row as f64))
                .collect();
            points.extend(intersect_target_plane(&pixels, &camera, &pose)?);

            accepted += 1;
            self.note_accepted(accepted);
        }

        self.check_cancel()?;
        self.set_state(SessionState::Solving);
        let fit = fit_plane(&points)?;

        self.check_cancel()?;
        self.set_state(SessionState::Validating);
        if fit.rmse > self.config.max_plane_rmse {
            return Err(SessionError::Validation(format!(
                "plane fit rmse {:.3} mm exceeds {:.3} mm",
                fit.rmse, self.config.max_plane_rmse
            )));
        }

        let version = self.store.commit(|d| d.lasers[id.index()] = Some(fit.plane));
        self.set_state(SessionState::Committed);

        Ok(SessionReport {
            target: self.config.target,
            accepted,
            skipped,
            committed_version: Some(version),
        })
    }

    // ── Platform extrinsics ────────────────────────────────────────────────

    fn run_platform<D: Driver + ?Sized>(
        &mut self,
        source: &mut SourceGuard<'_, D>,
    ) -> Result<SessionReport, SessionError> {
        let snapshot = self.store.snapshot();
        let Some(intrinsics) = snapshot.intrinsics else {
            return Err(SessionError::MissingIntrinsics(self.config.target));
        };
        let kmtx = intrinsics.intrinsics.k_matrix();

        let mut poses = Vec::new();
        let mut skipped = 0;
        let mut processed = 0;

        while poses.len() < self.config.target_views {
            self.check_cancel()?;
            self.budget_check(processed, poses.len())?;

            let frame = source.capture_frame()?;
            processed += 1;

            match detect_pattern(&frame, &self.config.pattern, &self.config.detector) {
                Ok(view) => {
                    let planar: Vec<Pt2> =
                        view.points_3d.iter().map(|p| Pt2::new(p.x, p.y)).collect();
                    let h = dlt_homography(&planar, &view.points_2d)
                        .map_err(|e| SessionError::Geometry(e.to_string()))?;
                    let pose = pose_from_homography(&kmtx, &h)
                        .map_err(|e| SessionError::Geometry(e.to_string()))?;
                    poses.push(pose);
                    self.note_accepted(poses.len());

                    // Step the platform only once the pose at the current
                    // position has been captured.
                    if poses.len() < self.config.target_views {
                        source.rotate_platform(self.config.platform_step_rad)?;
                    }
                }
                Err(DetectError::NotFound) => {
                    skipped += 1;
                    self.note_skipped(skipped);
                }
            }
        }

        self.check_cancel()?;
        self.set_state(SessionState::Solving);
        let axis_config = AxisFitConfig {
            step_angle_rad: self.config.platform_step_rad,
            max_angle_residual_rad: self.config.max_axis_residual_rad,
        };
        let fit = fit_rotation_axis(&poses, &axis_config)?;

        self.check_cancel()?;
        self.set_state(SessionState::Validating);
        // The axis fit already gated the step-angle residual; the extrinsics
        // constructor enforced the proper-rotation invariant.

        let version = self
            .store
            .commit(|d| d.platform = Some(fit.extrinsics));
        self.set_state(SessionState::Committed);

        Ok(SessionReport {
            target: self.config.target,
            accepted: poses.len(),
            skipped,
            committed_version: Some(version),
        })
    }

    // ── Autocheck ──────────────────────────────────────────────────────────

    /// Verifies the rig is usable without committing anything: the pattern
    /// must be detectable in enough frames and each laser must produce a
    /// visible stripe against its laser-off background.
    fn run_autocheck<D: Driver + ?Sized>(
        &mut self,
        source: &mut SourceGuard<'_, D>,
    ) -> Result<SessionReport, SessionError> {
        let mut hits = 0;
        let mut skipped = 0;

        for _ in 0..self.config.target_views {
            self.check_cancel()?;
            let frame = source.capture_frame()?;
            match detect_pattern(&frame, &self.config.pattern, &self.config.detector) {
                Ok(_) => {
                    hits += 1;
                    self.note_accepted(hits);
                }
                Err(DetectError::NotFound) => {
                    skipped += 1;
                    self.note_skipped(skipped);
                }
            }
        }

        let mut stripe_counts = [0usize; 2];
        for id in LaserId::ALL {
            self.check_cancel()?;
            source.set_laser(id, false)?;
            let background = source.capture_frame()?;
            source.set_laser(id, true)?;
            let frame = source.capture_frame()?;
            source.set_laser(id, false)?;

            let stripe = extract_stripe(&frame, Some(&background), &self.config.stripe)?;
            stripe_counts[id.index()] = stripe.len();
        }

        self.check_cancel()?;
        self.set_state(SessionState::Validating);
        let rate = hits as f64 / self.config.target_views as f64;
        if rate < self.config.min_pattern_rate {
            return Err(SessionError::AutocheckFailed(format!(
                "pattern detected in {hits} of {} frames",
                self.config.target_views
            )));
        }
        for id in LaserId::ALL {
            if stripe_counts[id.index()] < self.config.min_stripe_points {
                return Err(SessionError::AutocheckFailed(format!(
                    "{id} laser produced only {} stripe points",
                    stripe_counts[id.index()]
                )));
            }
        }

        // Autocheck validates the rig; it owns no calibration fields.
        self.set_state(SessionState::Committed);
        Ok(SessionReport {
            target: self.config.target,
            accepted: hits,
            skipped,
            committed_version: None,
        })
    }
}
