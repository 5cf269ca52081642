//! USB presence detection.
//!
//! Reads vendor/product IDs straight out of sysfs rather than opening
//! the device, so polling is cheap and never contends with the driver.

use std::path::{Path, PathBuf};

/// Microsoft.
pub const KINECT_V2_VENDOR_ID: u16 = 0x045e;
/// Xbox NUI Sensor (Kinect for Xbox One / Kinect v2).
pub const KINECT_V2_PRODUCT_ID: u16 = 0x02c4;

/// Answers whether the depth camera is currently attached.
pub trait PresenceProbe: Send + Sync {
    fn is_present(&self) -> bool;
}

/// A USB device as seen in `/sys/bus/usb/devices`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDevice {
    /// sysfs entry name, e.g. `2-1`.
    pub name: String,
    pub vendor_id: u16,
    pub product_id: u16,
}

/// Presence probe scanning `<root>/bus/usb/devices`.
#[derive(Debug, Clone)]
pub struct SysfsProbe {
    root: PathBuf,
    vendor_id: u16,
    product_id: u16,
}

impl SysfsProbe {
    /// Probe for the given VID:PID under a sysfs root (normally `/sys`).
    pub fn new(root: impl Into<PathBuf>, vendor_id: u16, product_id: u16) -> Self {
        Self {
            root: root.into(),
            vendor_id,
            product_id,
        }
    }

    /// Probe for a Kinect v2 under `/sys`.
    pub fn kinect_v2() -> Self {
        Self::new("/sys", KINECT_V2_VENDOR_ID, KINECT_V2_PRODUCT_ID)
    }

    /// All attached devices matching this probe's VID:PID.
    pub fn matching_devices(&self) -> Vec<UsbDevice> {
        list_usb_devices(&self.root)
            .into_iter()
            .filter(|d| d.vendor_id == self.vendor_id && d.product_id == self.product_id)
            .collect()
    }
}

impl PresenceProbe for SysfsProbe {
    fn is_present(&self) -> bool {
        !self.matching_devices().is_empty()
    }
}

/// List USB devices under `<root>/bus/usb/devices`.
///
/// Interfaces and entries without readable ID files are skipped.
pub fn list_usb_devices(root: &Path) -> Vec<UsbDevice> {
    let dir = root.join("bus/usb/devices");
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::trace!(path = %dir.display(), error = %e, "cannot read usb sysfs directory");
            return Vec::new();
        }
    };

    let mut devices: Vec<UsbDevice> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let path = entry.path();
            let vendor_id = read_hex_id(&path.join("idVendor"))?;
            let product_id = read_hex_id(&path.join("idProduct"))?;
            Some(UsbDevice {
                name: entry.file_name().to_string_lossy().into_owned(),
                vendor_id,
                product_id,
            })
        })
        .collect();
    devices.sort_by(|a, b| a.name.cmp(&b.name));
    devices
}

fn read_hex_id(path: &Path) -> Option<u16> {
    let s = std::fs::read_to_string(path).ok()?;
    u16::from_str_radix(s.trim(), 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_device(root: &Path, name: &str, vid: &str, pid: &str) {
        let dir = root.join("bus/usb/devices").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("idVendor"), format!("{vid}\n")).unwrap();
        std::fs::write(dir.join("idProduct"), format!("{pid}\n")).unwrap();
    }

    #[test]
    fn test_detects_kinect() {
        let root = tempfile::tempdir().unwrap();
        add_device(root.path(), "1-1", "1d6b", "0002");
        add_device(root.path(), "2-3", "045e", "02c4");

        let probe = SysfsProbe::new(root.path(), KINECT_V2_VENDOR_ID, KINECT_V2_PRODUCT_ID);
        assert!(probe.is_present());
        let found = probe.matching_devices();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "2-3");
    }

    #[test]
    fn test_absent_when_only_other_devices() {
        let root = tempfile::tempdir().unwrap();
        add_device(root.path(), "1-1", "1d6b", "0002");
        // Same vendor, Kinect v1 product.
        add_device(root.path(), "1-2", "045e", "02ae");

        let probe = SysfsProbe::new(root.path(), KINECT_V2_VENDOR_ID, KINECT_V2_PRODUCT_ID);
        assert!(!probe.is_present());
    }

    #[test]
    fn test_missing_sysfs_is_absent() {
        let root = tempfile::tempdir().unwrap();
        let probe = SysfsProbe::new(root.path().join("nope"), KINECT_V2_VENDOR_ID, KINECT_V2_PRODUCT_ID);
        assert!(!probe.is_present());
    }

    #[test]
    fn test_list_skips_interfaces() {
        let root = tempfile::tempdir().unwrap();
        add_device(root.path(), "2-3", "045e", "02c4");
        std::fs::create_dir_all(root.path().join("bus/usb/devices/2-3:1.0")).unwrap();
        std::fs::write(root.path().join("bus/usb/devices/2-3:1.0/bInterfaceClass"), "ff\n").unwrap();

        let devices = list_usb_devices(root.path());
        assert_eq!(
            devices,
            vec![UsbDevice {
                name: "2-3".into(),
                vendor_id: 0x045e,
                product_id: 0x02c4,
            }]
        );
    }

    #[test]
    fn test_unplug_is_observed() {
        let root = tempfile::tempdir().unwrap();
        add_device(root.path(), "2-3", "045e", "02c4");
        let probe = SysfsProbe::new(root.path(), KINECT_V2_VENDOR_ID, KINECT_V2_PRODUCT_ID);
        assert!(probe.is_present());

        std::fs::remove_dir_all(root.path().join("bus/usb/devices/2-3")).unwrap();
        assert!(!probe.is_present());
    }
}
