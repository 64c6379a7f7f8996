//! Accelerator discovery and decoder-layer placement.
//!
//! CUDA ordinals come from `candle`; names and total memory from an
//! `nvidia-smi` query when the tool is on `PATH`. Layers are placed greedily:
//! each device takes layers in order until its memory ceiling is reached,
//! whatever fits nowhere stays on the CPU.

use std::process::Command;

use anyhow::{bail, Context, Result};
use candle_core::Device;

/// Upper bound on CUDA ordinals probed when `nvidia-smi` is unavailable.
const MAX_PROBED_DEVICES: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub ordinal: usize,
    pub name: String,
    /// Bytes; 0 when unknown.
    pub total_memory: u64,
}

/// List available accelerators. Empty with `cpu_only` or without CUDA.
pub fn probe_devices(cpu_only: bool) -> Vec<DeviceInfo> {
    if cpu_only || !candle_core::utils::cuda_is_available() {
        return Vec::new();
    }
    let queried = query_nvidia_smi().unwrap_or_else(|e| {
        tracing::debug!(error = %e, "nvidia-smi query failed");
        Vec::new()
    });

    let mut devices = Vec::new();
    for ordinal in 0..MAX_PROBED_DEVICES.max(queried.len()) {
        if Device::new_cuda(ordinal).is_err() {
            break;
        }
        let info = queried
            .iter()
            .find(|d| d.ordinal == ordinal)
            .cloned()
            .unwrap_or_else(|| DeviceInfo {
                ordinal,
                name: format!("cuda:{ordinal}"),
                total_memory: 0,
            });
        devices.push(info);
    }
    devices
}

fn query_nvidia_smi() -> Result<Vec<DeviceInfo>> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=index,name,memory.total", "--format=csv,noheader,nounits"])
        .output()
        .context("run nvidia-smi")?;
    if !output.status.success() {
        bail!("nvidia-smi exited with {}", output.status);
    }
    parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
}

/// Parse `index, name, memory.total` CSV rows (memory in MiB, no units).
pub fn parse_nvidia_smi(csv: &str) -> Result<Vec<DeviceInfo>> {
    csv.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let [index, name, memory] = fields.as_slice() else {
                bail!("unexpected nvidia-smi row {line:?}");
            };
            let ordinal = index
                .parse()
                .with_context(|| format!("device index {index:?}"))?;
            let mib: u64 = memory
                .trim_end_matches("MiB")
                .trim()
                .parse()
                .with_context(|| format!("memory {memory:?}"))?;
            Ok(DeviceInfo {
                ordinal,
                name: name.to_string(),
                total_memory: mib * 1024 * 1024,
            })
        })
        .collect()
}

/// Where a decoder layer runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Cuda(usize),
    Cpu,
}

impl Placement {
    pub fn device(&self) -> Result<Device> {
        match self {
            Self::Cuda(ordinal) => Device::new_cuda(*ordinal)
                .with_context(|| format!("open cuda:{ordinal}")),
            Self::Cpu => Ok(Device::Cpu),
        }
    }
}

impl std::fmt::Display for Placement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

/// Per-layer placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMap {
    layers: Vec<Placement>,
}

impl DeviceMap {
    /// Greedy sequential placement of layers sized `layer_bytes` over
    /// `num_devices` accelerators with `ceiling` bytes each.
    pub fn plan(layer_bytes: &[u64], num_devices: usize, ceiling: u64) -> Self {
        let mut layers = Vec::with_capacity(layer_bytes.len());
        let mut device = 0usize;
        let mut used = 0u64;
        for &bytes in layer_bytes {
            while device < num_devices && used + bytes > ceiling {
                device += 1;
                used = 0;
            }
            if device < num_devices {
                used += bytes;
                layers.push(Placement::Cuda(device));
            } else {
                layers.push(Placement::Cpu);
            }
        }
        Self { layers }
    }

    pub fn cpu(num_layers: usize) -> Self {
        Self {
            layers: vec![Placement::Cpu; num_layers],
        }
    }

    pub fn placement(&self, layer: usize) -> Placement {
        self.layers.get(layer).copied().unwrap_or(Placement::Cpu)
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Number of layers on the CPU.
    pub fn offloaded(&self) -> usize {
        self.layers.iter().filter(|p| **p == Placement::Cpu).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_smi_rows() {
        let csv = "0, NVIDIA A100-SXM4-80GB, 81920\n1, NVIDIA A100-SXM4-80GB, 81920 MiB\n\n";
        let d = parse_nvidia_smi(csv).unwrap();
        assert_eq!(d.len(), 2);
        assert_eq!(d[0].ordinal, 0);
        assert_eq!(d[1].name, "NVIDIA A100-SXM4-80GB");
        assert_eq!(d[1].total_memory, 81920 * 1024 * 1024);
    }

    #[test]
    fn malformed_smi_row_errors() {
        assert!(parse_nvidia_smi("0, only-two").is_err());
        assert!(parse_nvidia_smi("x, name, 10").is_err());
    }

    #[test]
    fn cpu_only_probe_is_empty() {
        assert!(probe_devices(true).is_empty());
    }

    #[test]
    fn fills_devices_in_order() {
        let map = DeviceMap::plan(&[4, 4, 4, 4, 4], 2, 8);
        assert_eq!(
            map.layers,
            vec![
                Placement::Cuda(0),
                Placement::Cuda(0),
                Placement::Cuda(1),
                Placement::Cuda(1),
                Placement::Cpu,
            ]
        );
        assert_eq!(map.offloaded(), 1);
    }

    #[test]
    fn no_devices_means_cpu() {
        let map = DeviceMap::plan(&[1, 2, 3], 0, 100);
        assert_eq!(map, DeviceMap::cpu(3));
        assert_eq!(map.placement(7), Placement::Cpu);
    }

    #[test]
    fn oversized_layer_goes_to_cpu() {
        let map = DeviceMap::plan(&[10, 2], 1, 8);
        assert_eq!(map.layers, vec![Placement::Cpu, Placement::Cpu]);
        assert_eq!(Placement::Cuda(3).to_string(), "cuda:3");
    }
}
