//! Releasing model memory and reporting what is still allocated.

use std::fmt;
use std::process::Command;

use candle_core::Device;
use sysinfo::System;

use crate::device::device_label;

/// Memory use on one device. Fields are `None` when the probe failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceMemory {
    pub name: String,
    pub used_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
}

/// Per-device memory snapshot.
#[derive(Clone, Debug, Default)]
pub struct MemoryReport {
    pub devices: Vec<DeviceMemory>,
}

impl MemoryReport {
    /// Query the host and, when CUDA is available, every GPU.
    ///
    /// Never fails; probes that cannot run leave their fields empty or are
    /// skipped.
    pub fn collect() -> Self {
        let mut devices = vec![host_memory()];
        if candle_core::utils::cuda_is_available() {
            devices.extend(cuda_memory());
        }
        Self { devices }
    }

    /// [`collect`](Self::collect) plus one entry per Metal device in
    /// `devices`. CUDA devices are already covered by the nvidia-smi query.
    pub fn collect_for(devices: &[Device]) -> Self {
        let mut report = Self::collect();
        report
            .devices
            .extend(devices.iter().filter(|d| d.is_metal()).map(metal_memory));
        report
    }
}

#[cfg(feature = "metal")]
fn metal_memory(device: &Device) -> DeviceMemory {
    let (used_bytes, total_bytes) = match device {
        Device::Metal(metal) => {
            let raw = metal.device();
            (
                Some(raw.current_allocated_size()),
                Some(raw.recommended_max_working_set_size()),
            )
        }
        _ => (None, None),
    };
    DeviceMemory {
        name: device_label(device),
        used_bytes,
        total_bytes,
    }
}

#[cfg(not(feature = "metal"))]
fn metal_memory(device: &Device) -> DeviceMemory {
    DeviceMemory {
        name: device_label(device),
        used_bytes: None,
        total_bytes: None,
    }
}

fn host_memory() -> DeviceMemory {
    let mut sys = System::new();
    sys.refresh_memory();
    let used_bytes = sysinfo::get_current_pid().ok().and_then(|pid| {
        sys.refresh_process(pid);
        sys.process(pid).map(|p| p.memory())
    });
    DeviceMemory {
        name: "host (process rss)".to_string(),
        used_bytes,
        total_bytes: Some(sys.total_memory()).filter(|&t| t > 0),
    }
}

fn cuda_memory() -> Vec<DeviceMemory> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,name,memory.used,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .output();
    match output {
        Ok(out) if out.status.success() => parse_nvidia_smi(&String::from_utf8_lossy(&out.stdout)),
        Ok(out) => {
            tracing::warn!("nvidia-smi exited with {}", out.status);
            Vec::new()
        }
        Err(e) => {
            tracing::warn!("failed to query gpu memory: {e}");
            Vec::new()
        }
    }
}

/// Parse `index, name, used MiB, total MiB` lines from nvidia-smi.
pub fn parse_nvidia_smi(csv: &str) -> Vec<DeviceMemory> {
    const MIB: u64 = 1 << 20;
    csv.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() != 4 {
                return None;
            }
            let mib = |s: &str| s.parse::<u64>().ok().map(|v| v * MIB);
            Some(DeviceMemory {
                name: format!("cuda:{} {}", fields[0], fields[1]),
                used_bytes: mib(fields[2]),
                total_bytes: mib(fields[3]),
            })
        })
        .collect()
}

fn gib(bytes: Option<u64>) -> String {
    match bytes {
        Some(b) => format!("{:.2} GiB", b as f64 / (1u64 << 30) as f64),
        None => "n/a".to_string(),
    }
}

impl fmt::Display for MemoryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Memory usage:")?;
        for dev in &self.devices {
            write!(
                f,
                "\n  {}: {} / {}",
                dev.name,
                gib(dev.used_bytes),
                gib(dev.total_bytes)
            )?;
        }
        Ok(())
    }
}

/// Drops model handles and flushes the devices they lived on.
#[derive(Clone, Debug, Default)]
pub struct MemoryReclaimer {
    devices: Vec<Device>,
}

impl MemoryReclaimer {
    pub fn for_device(device: &Device) -> Self {
        Self {
            devices: vec![device.clone()],
        }
    }

    /// Drop `handle`, wait for the device to finish pending work so its
    /// buffers are freed, and report what remains allocated.
    ///
    /// Safe to call repeatedly and without any accelerator.
    pub fn reclaim<T>(&self, handle: T) -> MemoryReport {
        drop(handle);
        self.empty_cache();
        let report = MemoryReport::collect_for(&self.devices);
        tracing::info!("{report}");
        report
    }

    pub fn empty_cache(&self) {
        for device in &self.devices {
            if let Err(e) = device.synchronize() {
                tracing::warn!("synchronizing {} failed: {e}", device_label(device));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_smi_rows() {
        let csv = "0, NVIDIA A100-SXM4-40GB, 1024, 40960\n1, NVIDIA A100-SXM4-40GB, [N/A], 40960\n";
        let devices = parse_nvidia_smi(csv);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].name, "cuda:0 NVIDIA A100-SXM4-40GB");
        assert_eq!(devices[0].used_bytes, Some(1024 << 20));
        assert_eq!(devices[1].used_bytes, None);
        assert_eq!(devices[1].total_bytes, Some(40960 << 20));
    }

    #[test]
    fn skips_malformed_smi_rows() {
        assert!(parse_nvidia_smi("garbage\n\n").is_empty());
    }

    #[test]
    fn report_always_has_host_entry() {
        let report = MemoryReport::collect();
        assert!(report.devices[0].name.starts_with("host"));
        assert!(report.to_string().starts_with("Memory usage:"));
    }

    #[test]
    fn reclaim_without_accelerator_is_repeatable() {
        let reclaimer = MemoryReclaimer::for_device(&Device::Cpu);
        let first = reclaimer.reclaim(vec![0u8; 1 << 16]);
        let second = reclaimer.reclaim(());
        assert!(!first.devices.is_empty());
        assert_eq!(first.devices.len(), second.devices.len());
    }

    #[test]
    fn cpu_devices_add_no_extra_entries() {
        let plain = MemoryReport::collect();
        let with_cpu = MemoryReport::collect_for(&[Device::Cpu]);
        assert_eq!(plain.devices.len(), with_cpu.devices.len());
        assert!(with_cpu.devices.iter().all(|d| !d.name.starts_with("metal")));
    }

    #[cfg(feature = "metal")]
    #[test]
    fn metal_device_gets_an_entry() {
        let Ok(device) = Device::new_metal(0) else {
            return;
        };
        let report = MemoryReclaimer::for_device(&device).reclaim(());
        let entry = report.devices.last().unwrap();
        assert_eq!(entry.name, "metal:0");
        assert!(entry.total_bytes.is_some());
    }

    #[test]
    fn gib_formatting() {
        assert_eq!(gib(Some(1 << 30)), "1.00 GiB");
        assert_eq!(gib(None), "n/a");
    }
}
