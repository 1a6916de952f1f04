//! Host configuration.
//!
//! Module parameters and per-SoC platform data live here: the global channel and sync point
//! allocation policies, heap conversion switches, the address-space window handed to each
//! channel context, and the description of every client device.

use crate::error::{HostError, HostResult};
use crate::uapi::ioctl::{NVHOST_MODULE_MAX_CLOCKS, NVHOST_MODULE_MAX_MODMUTEXES};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// When a context acquires its hardware channel.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChannelPolicy {
    /// A channel is mapped when the device node is opened and held until release.
    #[default]
    MapOnOpen,
    /// A channel is mapped for the duration of each submit.
    MapOnSubmit,
}

/// Where reserved sync points are recorded.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncptPolicy {
    /// Sync points belong to the (possibly shared) channel.
    #[default]
    PerChannel,
    /// Sync points belong to each open context and are freed on release.
    PerChannelInstance,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HeapConfig {
    /// Service carveout requests from IOMMU-backed memory.
    pub convert_carveout_to_iovmm: bool,
    /// Service IOMMU requests from the generic carveout.
    pub convert_iovmm_to_carveout: bool,
    /// Granularity of big-page allocations in bytes.
    pub big_page_size: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            convert_carveout_to_iovmm: false,
            convert_iovmm_to_carveout: false,
            big_page_size: 32 * crate::nvmap::PAGE_SIZE,
        }
    }
}

/// IOVA window of each context address space.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VmConfig {
    pub iova_base: u64,
    pub iova_limit: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            iova_base: 0x0010_0000,
            iova_limit: 0xFFFF_FFFF,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ClockConfig {
    pub name: String,
    pub moduleid: u32,
}

/// Static description of a client device (an engine behind host1x).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub name: String,
    pub class_id: u32,
    #[serde(default = "default_num_channels")]
    pub num_channels: u32,
    /// Each context holds a dedicated channel slot.
    #[serde(default)]
    pub exclusive: bool,
    /// Keep the device powered while any client is open.
    #[serde(default)]
    pub keepalive: bool,
    /// The channel appends its own "work done" increment to every job.
    #[serde(default)]
    pub push_work_done: bool,
    #[serde(default)]
    pub modulemutexes: Vec<u32>,
    #[serde(default)]
    pub clocks: Vec<ClockConfig>,
    /// Size of the register aperture in bytes, 0 if the device exposes none.
    #[serde(default)]
    pub aperture_size: u64,
}

const fn default_num_channels() -> u32 {
    1
}

impl DeviceConfig {
    #[must_use]
    pub fn new(name: impl Into<String>, class_id: u32) -> Self {
        Self {
            name: name.into(),
            class_id,
            num_channels: default_num_channels(),
            exclusive: false,
            keepalive: false,
            push_work_done: false,
            modulemutexes: Vec::new(),
            clocks: Vec::new(),
            aperture_size: 0,
        }
    }

    #[must_use]
    pub const fn with_channels(mut self, num_channels: u32) -> Self {
        self.num_channels = num_channels;
        self
    }

    #[must_use]
    pub const fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    #[must_use]
    pub const fn keepalive(mut self) -> Self {
        self.keepalive = true;
        self
    }

    #[must_use]
    pub const fn push_work_done(mut self) -> Self {
        self.push_work_done = true;
        self
    }

    #[must_use]
    pub const fn with_aperture(mut self, size: u64) -> Self {
        self.aperture_size = size;
        self
    }

    #[must_use]
    pub fn with_modmutexes(mut self, ids: &[u32]) -> Self {
        self.modulemutexes = ids.to_vec();
        self
    }

    #[must_use]
    pub fn with_clock(mut self, name: impl Into<String>, moduleid: u32) -> Self {
        self.clocks.push(ClockConfig {
            name: name.into(),
            moduleid,
        });
        self
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HostConfig {
    pub channel_policy: ChannelPolicy,
    pub syncpt_policy: SyncptPolicy,
    /// Total number of hardware sync points, id 0 included.
    pub num_syncpts: u32,
    /// Default submit timeout in milliseconds.
    pub timeout_default_ms: u32,
    /// Running on production silicon; timeouts are disabled otherwise.
    pub silicon: bool,
    pub heap: HeapConfig,
    pub vm: VmConfig,
    pub devices: Vec<DeviceConfig>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            channel_policy: ChannelPolicy::default(),
            syncpt_policy: SyncptPolicy::default(),
            num_syncpts: 32,
            timeout_default_ms: 10_000,
            silicon: true,
            heap: HeapConfig::default(),
            vm: VmConfig::default(),
            devices: Vec::new(),
        }
    }
}

impl HostConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> HostResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| HostError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> HostResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            HostError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    #[must_use]
    pub fn with_device(mut self, device: DeviceConfig) -> Self {
        self.devices.push(device);
        self
    }

    pub fn validate(&self) -> HostResult<()> {
        if self.heap.convert_carveout_to_iovmm && self.heap.convert_iovmm_to_carveout {
            return Err(HostError::Config(
                "heap conversion must be one-directional".into(),
            ));
        }
        if self.heap.big_page_size % crate::nvmap::PAGE_SIZE != 0 {
            return Err(HostError::Config(
                "heap.big_page_size must be a multiple of the page size".into(),
            ));
        }
        if self.channel_policy == ChannelPolicy::MapOnSubmit
            && self.syncpt_policy == SyncptPolicy::PerChannel
        {
            return Err(HostError::Config(
                "map_on_submit requires per_channel_instance sync points".into(),
            ));
        }
        if self.num_syncpts < 2 {
            return Err(HostError::Config("num_syncpts must be at least 2".into()));
        }
        if self.vm.iova_base >= self.vm.iova_limit {
            return Err(HostError::Config("vm.iova_base must be below vm.iova_limit".into()));
        }

        let mut names = HashSet::new();
        for dev in &self.devices {
            if !names.insert(dev.name.as_str()) {
                return Err(HostError::Config(format!("duplicate device {}", dev.name)));
            }
            if dev.num_channels == 0 {
                return Err(HostError::Config(format!(
                    "{}: num_channels must be greater than 0",
                    dev.name
                )));
            }
            if dev.modulemutexes.len() > NVHOST_MODULE_MAX_MODMUTEXES {
                return Err(HostError::Config(format!(
                    "{}: at most {} module mutexes",
                    dev.name, NVHOST_MODULE_MAX_MODMUTEXES
                )));
            }
            if dev.clocks.len() > NVHOST_MODULE_MAX_CLOCKS {
                return Err(HostError::Config(format!(
                    "{}: at most {} clocks",
                    dev.name, NVHOST_MODULE_MAX_CLOCKS
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_toml() {
        let config = HostConfig::from_toml_str(
            r#"
            channel_policy = "map_on_submit"
            syncpt_policy = "per_channel_instance"
            num_syncpts = 64
            silicon = false

            [heap]
            convert_iovmm_to_carveout = true

            [[devices]]
            name = "gr3d"
            class_id = 0x60
            num_channels = 2
            exclusive = true
            modulemutexes = [8, 9]
            clocks = [{ name = "gr3d", moduleid = 5 }]
            "#,
        )
        .unwrap();

        assert_eq!(config.channel_policy, ChannelPolicy::MapOnSubmit);
        assert_eq!(config.num_syncpts, 64);
        assert!(!config.silicon);
        assert!(config.heap.convert_iovmm_to_carveout);
        assert_eq!(config.devices[0].modulemutexes, vec![8, 9]);
        assert_eq!(
            config.devices[0].clocks,
            vec![ClockConfig {
                name: "gr3d".into(),
                moduleid: 5
            }]
        );
        assert!(config.devices[0].exclusive);
        assert!(!config.devices[0].keepalive);
    }

    #[test]
    fn rejects_bidirectional_conversion() {
        let mut config = HostConfig::default();
        config.heap.convert_carveout_to_iovmm = true;
        config.heap.convert_iovmm_to_carveout = true;
        assert!(matches!(config.validate(), Err(HostError::Config(_))));
    }

    #[test]
    fn rejects_map_on_submit_with_channel_syncpts() {
        let config = HostConfig {
            channel_policy: ChannelPolicy::MapOnSubmit,
            syncpt_policy: SyncptPolicy::PerChannel,
            ..HostConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_too_many_modmutexes() {
        let config = HostConfig::default()
            .with_device(DeviceConfig::new("vic", 0x5d).with_modmutexes(&[1; 17]));
        assert!(config.validate().is_err());
    }
}
