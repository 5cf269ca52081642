//! Device session: connection supervision and the shared frame cache.
//!
//! One supervising thread per session polls USB presence, opens and
//! starts the sensor when it appears, and tears everything down when it
//! disappears or the session shuts down. Frames arrive on the driver's
//! own acquisition thread and are published into the cache under the
//! session lock; readers take the same lock through [`FrameGuard`].

use crate::cache::{FrameCache, FrameStats};
use crate::config::SessionConfig;
use depthlink_hw::{
    DriverError, Frame, FrameKind, FrameSink, PointCloud, PresenceProbe, SensorDevice, SensorDriver,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

static SHARED_SESSION: OnceLock<Arc<DeviceSession>> = OnceLock::new();

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NoDevice,
    Connecting,
    Connected,
    Stopping,
}

/// State shared between the session handle, its supervisor and the frame callback.
struct Shared {
    cache: Mutex<FrameCache>,
    state: Mutex<SessionState>,
    state_changed: Condvar,
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        let mut current = self.state.lock();
        if *current != state {
            tracing::debug!(from = ?*current, to = ?state, "session state");
            *current = state;
            self.state_changed.notify_all();
        }
    }
}

/// Cancellation flag the supervisor sleeps on.
#[derive(Default)]
struct CancelToken {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

impl CancelToken {
    fn cancel(&self) {
        *self.cancelled.lock() = true;
        self.wake.notify_all();
    }

    fn is_cancelled(&self) -> bool {
        *self.cancelled.lock()
    }

    /// Sleep for `duration` unless cancelled first. Returns true if cancelled.
    fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut cancelled = self.cancelled.lock();
        while !*cancelled {
            if self.wake.wait_until(&mut cancelled, deadline).timed_out() {
                break;
            }
        }
        *cancelled
    }
}

struct Supervisor {
    cancel: Arc<CancelToken>,
    thread: JoinHandle<()>,
}

/// Process-wide handle to the depth camera.
///
/// Construct with [`DeviceSession::new`] and inject it where it is
/// needed, or use [`DeviceSession::shared`] for the lazily created
/// per-process instance. Only one session should drive a given sensor.
pub struct DeviceSession {
    config: SessionConfig,
    driver: Arc<dyn SensorDriver>,
    probe: Arc<dyn PresenceProbe>,
    shared: Arc<Shared>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl DeviceSession {
    /// Create a session. Supervision begins with [`start`](Self::start).
    pub fn new(
        config: SessionConfig,
        driver: Arc<dyn SensorDriver>,
        probe: Arc<dyn PresenceProbe>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            driver,
            probe,
            shared: Arc::new(Shared {
                cache: Mutex::new(FrameCache::new()),
                state: Mutex::new(SessionState::NoDevice),
                state_changed: Condvar::new(),
            }),
            supervisor: Mutex::new(None),
        })
    }

    /// The per-process session, created and started on first call.
    pub fn shared() -> Arc<DeviceSession> {
        Self::init_shared(|| {
            let (driver, probe) = default_backend();
            Self::new(SessionConfig::default(), driver, probe)
        })
    }

    /// Install the per-process session using `init` if none exists yet.
    ///
    /// Returns the existing session untouched when one was already created.
    pub fn init_shared(init: impl FnOnce() -> Arc<DeviceSession>) -> Arc<DeviceSession> {
        SHARED_SESSION
            .get_or_init(|| {
                let session = init();
                session.start();
                session
            })
            .clone()
    }

    /// Spawn the supervising thread. Does nothing if it is already running.
    pub fn start(&self) {
        let mut supervisor = self.supervisor.lock();
        if supervisor.as_ref().is_some_and(|s| !s.thread.is_finished()) {
            return;
        }
        if let Some(finished) = supervisor.take() {
            let _ = finished.thread.join();
        }

        let cancel = Arc::new(CancelToken::default());
        let ctx = SupervisorContext {
            config: self.config.clone(),
            driver: Arc::clone(&self.driver),
            probe: Arc::clone(&self.probe),
            shared: Arc::clone(&self.shared),
            cancel: Arc::clone(&cancel),
        };
        let thread = std::thread::Builder::new()
            .name("depthlink-session".into())
            .spawn(move || ctx.run())
            .expect("failed to spawn session supervisor thread");

        tracing::info!(
            vendor_id = %format!("{:04x}", self.config.vendor_id),
            product_id = %format!("{:04x}", self.config.product_id),
            "device session started"
        );
        *supervisor = Some(Supervisor { cancel, thread });
    }

    /// Cancel the supervising thread and wait for it to release the device.
    pub fn shutdown(&self) {
        let Some(supervisor) = self.supervisor.lock().take() else {
            return;
        };
        supervisor.cancel.cancel();
        if supervisor.thread.join().is_err() {
            tracing::error!("session supervisor panicked");
        }
        tracing::info!("device session shut down");
    }

    pub fn is_running(&self) -> bool {
        self.supervisor
            .lock()
            .as_ref()
            .is_some_and(|s| !s.thread.is_finished())
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    /// Block until the session reaches `state` or `timeout` elapses.
    pub fn wait_for_state(&self, state: SessionState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut current = self.shared.state.lock();
        while *current != state {
            if self
                .shared
                .state_changed
                .wait_until(&mut current, deadline)
                .timed_out()
            {
                return *current == state;
            }
        }
        true
    }

    pub fn stats(&self) -> FrameStats {
        self.shared.cache.lock().stats()
    }

    /// Take the session lock.
    ///
    /// Hold the guard only long enough to clone out the frames you need;
    /// frames are immutable, so they stay valid after the guard drops.
    pub fn lock(&self) -> FrameGuard<'_> {
        FrameGuard {
            cache: self.shared.cache.lock(),
        }
    }

    #[cfg(test)]
    pub(crate) fn cache(&self) -> &Mutex<FrameCache> {
        &self.shared.cache
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Scoped access to the session's frames. The lock is released on drop.
pub struct FrameGuard<'a> {
    cache: MutexGuard<'a, FrameCache>,
}

impl FrameGuard<'_> {
    /// Latest raw color frame of the current connection.
    pub fn color_frame(&self) -> Option<Arc<Frame>> {
        self.cache.color()
    }

    /// Latest raw depth frame of the current connection.
    pub fn depth_frame(&self) -> Option<Arc<Frame>> {
        self.cache.depth()
    }

    /// Depth on the ideal (undistorted) depth grid.
    pub fn undistorted_depth_frame(&mut self) -> Option<Arc<Frame>> {
        self.cache.undistorted_depth()
    }

    /// Color resampled onto the depth grid.
    pub fn registered_color_frame(&mut self) -> Option<Arc<Frame>> {
        self.cache.registered_color()
    }

    /// Camera-space point per depth pixel.
    pub fn points(&mut self) -> Option<Arc<PointCloud>> {
        self.cache.points()
    }
}

/// Everything the supervising thread owns.
struct SupervisorContext {
    config: SessionConfig,
    driver: Arc<dyn SensorDriver>,
    probe: Arc<dyn PresenceProbe>,
    shared: Arc<Shared>,
    cancel: Arc<CancelToken>,
}

impl SupervisorContext {
    fn run(self) {
        tracing::debug!("session supervisor running");
        let _reset = ResetOnExit(Arc::clone(&self.shared));

        loop {
            if !self.wait_for_presence() {
                break;
            }

            self.shared.set_state(SessionState::Connecting);
            let connection = match self.connect() {
                Ok(connection) => connection,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to start depth camera; retrying");
                    self.shared.set_state(SessionState::NoDevice);
                    if self.cancel.sleep(self.config.retry_backoff) {
                        break;
                    }
                    continue;
                }
            };

            self.shared.set_state(SessionState::Connected);
            let cancelled = self.watch_presence();
            self.shared.set_state(SessionState::Stopping);
            if !cancelled {
                tracing::warn!("depth camera disconnected");
            }
            drop(connection);
            self.shared.set_state(SessionState::NoDevice);
            if cancelled {
                break;
            }
        }

        tracing::debug!("session supervisor exiting");
    }

    /// Poll until the device shows up. Returns false if cancelled.
    fn wait_for_presence(&self) -> bool {
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            if self.probe.is_present() {
                tracing::info!("depth camera detected");
                return true;
            }
            if self.cancel.sleep(self.config.absent_poll_interval) {
                return false;
            }
        }
    }

    /// Poll while connected. Returns true if cancelled, false on unplug.
    fn watch_presence(&self) -> bool {
        loop {
            if self.cancel.sleep(self.config.present_poll_interval) {
                return true;
            }
            if !self.probe.is_present() {
                return false;
            }
        }
    }

    fn connect(&self) -> Result<ActiveConnection, DriverError> {
        let device = self.driver.open()?;
        let serial = device.serial();
        tracing::info!(serial = %serial, "starting depth camera");

        let generation = self.shared.cache.lock().begin_connection(device.registration());
        let mut connection = ActiveConnection {
            device: Some(device),
            started: false,
            shared: Arc::clone(&self.shared),
        };
        let sink = frame_sink(Arc::downgrade(&self.shared), generation);
        if let Some(device) = connection.device.as_mut() {
            device.start(sink)?;
        }
        connection.started = true;
        self.shared.cache.lock().connection_started();
        Ok(connection)
    }
}

/// Builds the callback handed to the driver for one connection.
fn frame_sink(shared: Weak<Shared>, generation: u64) -> FrameSink {
    Arc::new(move |kind: FrameKind, frame: Arc<Frame>| {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        shared.cache.lock().publish(generation, kind, frame);
    })
}

/// An opened device. Dropping it stops and closes the device and clears
/// the cache, whichever way the supervisor leaves the connection.
struct ActiveConnection {
    device: Option<Box<dyn SensorDevice>>,
    started: bool,
    shared: Arc<Shared>,
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        if let Some(mut device) = self.device.take() {
            if self.started {
                tracing::debug!("stopping depth camera");
                if let Err(e) = device.stop() {
                    tracing::warn!(error = %e, "failed to stop depth camera");
                }
            }
            if let Err(e) = device.close() {
                tracing::warn!(error = %e, "failed to close depth camera");
            }
        }
        self.shared.cache.lock().end_connection();
    }
}

/// Leaves the session in `NoDevice` with an empty cache on every exit path.
struct ResetOnExit(Arc<Shared>);

impl Drop for ResetOnExit {
    fn drop(&mut self) {
        self.0.cache.lock().end_connection();
        self.0.set_state(SessionState::NoDevice);
    }
}

/// Driver that cannot open anything; used when no backend is compiled in.
///
/// The supervisor treats its error like any other open failure and
/// keeps retrying, so a real driver can be swapped in later.
pub struct UnavailableDriver;

impl SensorDriver for UnavailableDriver {
    fn open(&self) -> Result<Box<dyn SensorDevice>, DriverError> {
        Err(DriverError::Unavailable(
            "no sensor driver compiled in; install one with DeviceSession::init_shared".into(),
        ))
    }
}

#[cfg(feature = "synthetic-source")]
fn default_backend() -> (Arc<dyn SensorDriver>, Arc<dyn PresenceProbe>) {
    (
        Arc::new(depthlink_hw::synthetic::SyntheticDriver::default()),
        Arc::new(depthlink_hw::synthetic::AlwaysPresent),
    )
}

#[cfg(not(feature = "synthetic-source"))]
fn default_backend() -> (Arc<dyn SensorDriver>, Arc<dyn PresenceProbe>) {
    (
        Arc::new(UnavailableDriver),
        Arc::new(depthlink_hw::SysfsProbe::kinect_v2()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::{color, depth, RecordingRegistration};
    use depthlink_hw::Registration;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FlagProbe(AtomicBool);

    impl PresenceProbe for FlagProbe {
        fn is_present(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    /// Driver whose devices expose their sink so tests can push frames.
    #[derive(Default)]
    struct ScriptedDriver {
        fail_opens: AtomicUsize,
        fail_starts: Arc<AtomicUsize>,
        opens: AtomicUsize,
        closes: Arc<AtomicUsize>,
        sink: Arc<Mutex<Option<FrameSink>>>,
    }

    struct ScriptedDevice {
        fail_starts: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
        sink: Arc<Mutex<Option<FrameSink>>>,
    }

    impl SensorDriver for ScriptedDriver {
        fn open(&self) -> Result<Box<dyn SensorDevice>, DriverError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self
                .fail_opens
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(DriverError::OpenFailed("scripted failure".into()));
            }
            Ok(Box::new(ScriptedDevice {
                fail_starts: Arc::clone(&self.fail_starts),
                closes: Arc::clone(&self.closes),
                sink: Arc::clone(&self.sink),
            }))
        }
    }

    impl SensorDevice for ScriptedDevice {
        fn serial(&self) -> String {
            "test".into()
        }

        fn registration(&self) -> Arc<dyn Registration> {
            Arc::new(RecordingRegistration::default())
        }

        fn start(&mut self, sink: FrameSink) -> Result<(), DriverError> {
            if self
                .fail_starts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(DriverError::StartFailed("scripted failure".into()));
            }
            *self.sink.lock() = Some(sink);
            Ok(())
        }

        fn stop(&mut self) -> Result<(), DriverError> {
            *self.sink.lock() = None;
            Ok(())
        }

        fn close(self: Box<Self>) -> Result<(), DriverError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Err(DriverError::CloseFailed("close errors are only logged".into()))
        }
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            absent_poll_interval: Duration::from_millis(5),
            present_poll_interval: Duration::from_millis(10),
            retry_backoff: Duration::from_millis(10),
            ..SessionConfig::default()
        }
    }

    fn session(present: bool) -> (Arc<DeviceSession>, Arc<ScriptedDriver>, Arc<FlagProbe>) {
        let driver = Arc::new(ScriptedDriver::default());
        let probe = Arc::new(FlagProbe(AtomicBool::new(present)));
        let session = DeviceSession::new(fast_config(), driver.clone(), probe.clone());
        (session, driver, probe)
    }

    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn test_cancel_token_sleep() {
        let token = CancelToken::default();
        assert!(!token.sleep(Duration::from_millis(1)));
        token.cancel();
        assert!(token.sleep(Duration::from_secs(60)));
    }

    #[test]
    fn test_connects_when_present() {
        let (session, driver, _probe) = session(true);
        session.start();
        assert!(session.wait_for_state(SessionState::Connected, WAIT));
        assert_eq!(driver.opens.load(Ordering::SeqCst), 1);
        assert!(driver.sink.lock().is_some());
        session.shutdown();
        assert_eq!(session.state(), SessionState::NoDevice);
        assert_eq!(driver.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stays_idle_while_absent() {
        let (session, driver, probe) = session(false);
        session.start();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(session.state(), SessionState::NoDevice);
        assert_eq!(driver.opens.load(Ordering::SeqCst), 0);

        probe.0.store(true, Ordering::SeqCst);
        assert!(session.wait_for_state(SessionState::Connected, WAIT));
    }

    #[test]
    fn test_open_failure_backs_off_and_retries() {
        let (session, driver, _probe) = session(true);
        driver.fail_opens.store(2, Ordering::SeqCst);
        session.start();
        assert!(session.wait_for_state(SessionState::Connected, WAIT));
        assert_eq!(driver.opens.load(Ordering::SeqCst), 3);
        assert_eq!(session.stats().connections, 1);
    }

    #[test]
    fn test_start_failure_is_not_a_connection() {
        let (session, driver, _probe) = session(true);
        driver.fail_starts.store(1, Ordering::SeqCst);
        session.start();
        assert!(session.wait_for_state(SessionState::Connected, WAIT));
        assert_eq!(driver.opens.load(Ordering::SeqCst), 2);
        // The device that failed to start was still closed.
        assert_eq!(driver.closes.load(Ordering::SeqCst), 1);
        assert_eq!(session.stats().connections, 1);
    }

    #[test]
    fn test_frames_flow_through_callback() {
        let (session, driver, _probe) = session(true);
        session.start();
        assert!(session.wait_for_state(SessionState::Connected, WAIT));

        let sink = driver.sink.lock().clone().unwrap();
        let c = color(7);
        sink(FrameKind::Color, c.clone());
        sink(FrameKind::Depth, depth(1200.0));

        let mut frames = session.lock();
        assert!(Arc::ptr_eq(&frames.color_frame().unwrap(), &c));
        assert_eq!(frames.registered_color_frame().unwrap().bgrx(1, 1), Some([7, 7, 7, 7]));
        assert_eq!(frames.points().unwrap().len(), 4);
    }

    #[test]
    fn test_unplug_clears_frames() {
        let (session, driver, probe) = session(true);
        session.start();
        assert!(session.wait_for_state(SessionState::Connected, WAIT));
        let sink = driver.sink.lock().clone().unwrap();
        sink(FrameKind::Color, color(1));

        probe.0.store(false, Ordering::SeqCst);
        assert!(session.wait_for_state(SessionState::NoDevice, WAIT));
        assert!(session.lock().color_frame().is_none());
        assert_eq!(driver.closes.load(Ordering::SeqCst), 1);

        // A late frame from the old connection is ignored.
        sink(FrameKind::Color, color(2));
        assert!(session.lock().color_frame().is_none());
    }

    #[test]
    fn test_replug_reconnects() {
        let (session, driver, probe) = session(true);
        session.start();
        assert!(session.wait_for_state(SessionState::Connected, WAIT));
        probe.0.store(false, Ordering::SeqCst);
        assert!(session.wait_for_state(SessionState::NoDevice, WAIT));
        probe.0.store(true, Ordering::SeqCst);
        assert!(session.wait_for_state(SessionState::Connected, WAIT));
        assert_eq!(driver.opens.load(Ordering::SeqCst), 2);
        assert_eq!(session.stats().connections, 2);
    }

    #[test]
    fn test_restart_after_shutdown() {
        let (session, _driver, _probe) = session(true);
        session.start();
        session.start();
        assert!(session.wait_for_state(SessionState::Connected, WAIT));
        session.shutdown();
        assert!(!session.is_running());
        session.start();
        assert!(session.is_running());
        assert!(session.wait_for_state(SessionState::Connected, WAIT));
    }

    #[test]
    fn test_drop_releases_device() {
        let (session, driver, _probe) = session(true);
        session.start();
        assert!(session.wait_for_state(SessionState::Connected, WAIT));
        drop(session);
        assert_eq!(driver.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unavailable_driver_errors() {
        assert!(matches!(UnavailableDriver.open(), Err(DriverError::Unavailable(_))));
    }
}
