use depthlink_hw::{KINECT_V2_PRODUCT_ID, KINECT_V2_VENDOR_ID};
use std::time::Duration;

/// Device session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// USB vendor ID of the depth camera.
    pub vendor_id: u16,
    /// USB product ID of the depth camera.
    pub product_id: u16,
    /// Presence poll interval while no device is attached.
    pub absent_poll_interval: Duration,
    /// Presence poll interval while streaming.
    pub present_poll_interval: Duration,
    /// Wait after a failed open/start before trying again.
    pub retry_backoff: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            vendor_id: KINECT_V2_VENDOR_ID,
            product_id: KINECT_V2_PRODUCT_ID,
            absent_poll_interval: Duration::from_millis(100),
            present_poll_interval: Duration::from_secs(1),
            retry_backoff: Duration::from_secs(1),
        }
    }
}
