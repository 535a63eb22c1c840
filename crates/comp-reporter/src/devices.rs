//! Accelerator library seam
//!
//! Resolves granted slice device UUIDs to physical GPU indices and slice
//! profiles. Production uses NVML; the static implementation backs tests
//! and development on machines without accelerators.

use comp_core::{Error, Result};
use nvml_wrapper::Nvml;
use std::collections::HashMap;

/// One slice device as the library sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigDevice {
    /// Slice device UUID as granted by the device plugin
    pub uuid: String,

    /// Index of the physical GPU hosting the slice
    pub gpu_index: u32,

    /// Short slice profile name (e.g. `1g.5gb`)
    pub profile: String,
}

/// Device UUID resolution
pub trait AcceleratorLibrary: Send + Sync {
    /// Physical GPU index hosting the device
    fn gpu_index(&self, device_uuid: &str) -> Result<u32>;

    /// Short slice profile of the device
    fn slice_profile(&self, device_uuid: &str) -> Result<String>;
}

/// NVML-backed library
pub struct NvmlLibrary {
    nvml: Nvml,
}

impl NvmlLibrary {
    /// Initialize NVML; fails on hosts without the driver
    pub fn new() -> Result<Self> {
        let nvml = Nvml::init().map_err(|e| Error::device(format!("NVML init failed: {}", e)))?;
        Ok(Self { nvml })
    }
}

impl AcceleratorLibrary for NvmlLibrary {
    fn gpu_index(&self, device_uuid: &str) -> Result<u32> {
        let device = self
            .nvml
            .device_by_uuid(device_uuid)
            .map_err(|e| Error::device(format!("device {} not found: {}", device_uuid, e)))?;
        device
            .index()
            .map_err(|e| Error::device(format!("no index for {}: {}", device_uuid, e)))
    }

    fn slice_profile(&self, device_uuid: &str) -> Result<String> {
        let device = self
            .nvml
            .device_by_uuid(device_uuid)
            .map_err(|e| Error::device(format!("device {} not found: {}", device_uuid, e)))?;
        let name = device
            .name()
            .map_err(|e| Error::device(format!("no name for {}: {}", device_uuid, e)))?;
        profile_from_device_name(&name).ok_or_else(|| {
            Error::device(format!("cannot extract profile from device name {:?}", name))
        })
    }
}

/// The slice profile is the last token of the device name
/// (`NVIDIA A100-SXM4-40GB MIG 1g.5gb` -> `1g.5gb`)
pub fn profile_from_device_name(name: &str) -> Option<String> {
    name.split_whitespace().last().map(str::to_string)
}

/// Fixed device map for tests and accelerator-less development
#[derive(Debug, Default)]
pub struct StaticLibrary {
    devices: HashMap<String, MigDevice>,
}

impl StaticLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: Vec<MigDevice>) -> Self {
        Self {
            devices: devices
                .into_iter()
                .map(|device| (device.uuid.clone(), device))
                .collect(),
        }
    }
}

impl AcceleratorLibrary for StaticLibrary {
    fn gpu_index(&self, device_uuid: &str) -> Result<u32> {
        self.devices
            .get(device_uuid)
            .map(|device| device.gpu_index)
            .ok_or_else(|| Error::device(format!("device {} not found", device_uuid)))
    }

    fn slice_profile(&self, device_uuid: &str) -> Result<String> {
        self.devices
            .get(device_uuid)
            .map(|device| device.profile.clone())
            .ok_or_else(|| Error::device(format!("device {} not found", device_uuid)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_from_device_name() {
        assert_eq!(
            profile_from_device_name("NVIDIA A100-SXM4-40GB MIG 1g.5gb").as_deref(),
            Some("1g.5gb")
        );
        assert_eq!(profile_from_device_name("").as_deref(), None);
    }

    #[test]
    fn test_static_library() {
        let library = StaticLibrary::with_devices(vec![MigDevice {
            uuid: "MIG-aaaa".into(),
            gpu_index: 1,
            profile: "3g.20gb".into(),
        }]);

        assert_eq!(library.gpu_index("MIG-aaaa").unwrap(), 1);
        assert_eq!(library.slice_profile("MIG-aaaa").unwrap(), "3g.20gb");
        assert!(matches!(
            library.gpu_index("MIG-zzzz").unwrap_err(),
            Error::Device(_)
        ));
    }
}
