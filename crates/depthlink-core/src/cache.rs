//! Latest-frame cache with memoized registration.
//!
//! Raw frames are replaced from the acquisition thread; derived frames
//! are computed on first access and dropped in the same critical section
//! that replaces the raw frame they depend on.

use depthlink_hw::{Frame, FrameKind, PointCloud, Registration};
use std::sync::Arc;

/// Counters for the current connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Connections whose device started streaming since the session was created.
    pub connections: u64,
    pub color_frames: u64,
    pub depth_frames: u64,
    /// Registration passes run (each yields both derived frames).
    pub registrations: u64,
    pub point_clouds: u64,
}

#[derive(Default)]
pub(crate) struct FrameCache {
    /// Bumped on every connect and disconnect; frames tagged with an older
    /// generation come from a torn-down connection and are dropped.
    generation: u64,
    registration: Option<Arc<dyn Registration>>,
    color: Option<Arc<Frame>>,
    depth: Option<Arc<Frame>>,
    registered_color: Option<Arc<Frame>>,
    undistorted_depth: Option<Arc<Frame>>,
    points: Option<Arc<PointCloud>>,
    /// Set when the current raw pair failed to register; cleared by the next raw frame.
    registration_failed: bool,
    stats: FrameStats,
}

impl FrameCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Reset for a freshly opened device and return the generation its
    /// frame callback must tag frames with.
    pub(crate) fn begin_connection(&mut self, registration: Arc<dyn Registration>) -> u64 {
        self.clear();
        self.generation += 1;
        self.registration = Some(registration);
        self.stats = FrameStats {
            connections: self.stats.connections,
            ..FrameStats::default()
        };
        self.generation
    }

    /// Count the current connection once its device is streaming.
    pub(crate) fn connection_started(&mut self) {
        self.stats.connections += 1;
    }

    /// Drop every frame and the registration primitive.
    pub(crate) fn end_connection(&mut self) {
        self.clear();
        self.generation += 1;
        self.registration = None;
    }

    fn clear(&mut self) {
        self.color = None;
        self.depth = None;
        self.registered_color = None;
        self.undistorted_depth = None;
        self.points = None;
        self.registration_failed = false;
    }

    /// Replace the latest frame of `kind`. Returns false for a stale generation.
    pub(crate) fn publish(&mut self, generation: u64, kind: FrameKind, frame: Arc<Frame>) -> bool {
        if generation != self.generation || self.registration.is_none() {
            return false;
        }
        self.registration_failed = false;
        match kind {
            FrameKind::Color => {
                if self.color.is_none() {
                    tracing::debug!(width = frame.width(), height = frame.height(), "receiving color frames");
                }
                self.color = Some(frame);
                self.registered_color = None;
                self.stats.color_frames += 1;
            }
            FrameKind::Depth => {
                if self.depth.is_none() {
                    tracing::debug!(width = frame.width(), height = frame.height(), "receiving depth frames");
                }
                self.depth = Some(frame);
                // Registered color is resampled through the depth map, so it goes too.
                self.undistorted_depth = None;
                self.registered_color = None;
                self.points = None;
                self.stats.depth_frames += 1;
            }
        }
        true
    }

    pub(crate) fn color(&self) -> Option<Arc<Frame>> {
        self.color.clone()
    }

    pub(crate) fn depth(&self) -> Option<Arc<Frame>> {
        self.depth.clone()
    }

    pub(crate) fn undistorted_depth(&mut self) -> Option<Arc<Frame>> {
        if self.undistorted_depth.is_none() {
            self.register();
        }
        self.undistorted_depth.clone()
    }

    pub(crate) fn registered_color(&mut self) -> Option<Arc<Frame>> {
        if self.registered_color.is_none() {
            self.register();
        }
        self.registered_color.clone()
    }

    pub(crate) fn points(&mut self) -> Option<Arc<PointCloud>> {
        if self.points.is_some() {
            return self.points.clone();
        }
        let undistorted = self.undistorted_depth()?;
        let registration = self.registration.clone()?;
        match registration.points_from(&undistorted) {
            Ok(cloud) => {
                self.stats.point_clouds += 1;
                self.points = Some(Arc::new(cloud));
            }
            Err(e) => tracing::warn!(error = %e, "point cloud computation failed"),
        }
        self.points.clone()
    }

    pub(crate) fn stats(&self) -> FrameStats {
        self.stats
    }

    /// Run the registration primitive over the current raw pair.
    ///
    /// An undistorted depth frame that is still cached is kept as is: it
    /// only depends on depth, and keeping the same `Arc` lets consumers
    /// skip re-uploading it.
    fn register(&mut self) {
        if self.registration_failed {
            return;
        }
        let (Some(color), Some(depth), Some(registration)) =
            (&self.color, &self.depth, &self.registration)
        else {
            return;
        };
        match registration.apply(color, depth) {
            Ok(pair) => {
                self.stats.registrations += 1;
                self.registered_color = Some(Arc::new(pair.registered));
                if self.undistorted_depth.is_none() {
                    self.undistorted_depth = Some(Arc::new(pair.undistorted));
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "registration failed");
                self.registration_failed = true;
            }
        }
    }
}
