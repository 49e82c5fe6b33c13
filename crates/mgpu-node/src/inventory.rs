//! GPU inventory probing: discovering what GPUs a node has and which of
//! them are already free to use.

use std::process::Command;

use mgpu_proto::GpuInventoryEntry;

use crate::error::InventoryError;

/// Source of a node's GPU inventory.
///
/// Lets the agent be tested without a real GPU or `nvidia-smi` present.
pub trait GpuProbe: Send + Sync {
    /// Enumerate the node's GPUs and their current memory usage.
    ///
    /// # Errors
    ///
    /// Returns an error if the probe cannot be run or its output cannot
    /// be parsed.
    fn probe(&self) -> Result<Vec<GpuInventoryEntry>, InventoryError>;
}

/// Probes GPUs via `nvidia-smi`.
#[derive(Debug, Default)]
pub struct NvidiaSmiProbe {
    nvidia_smi_path: Option<String>,
}

impl NvidiaSmiProbe {
    /// A probe that shells out to the `nvidia-smi` found on `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A probe that shells out to `nvidia-smi` at a specific path.
    #[must_use]
    pub fn with_path(path: impl Into<String>) -> Self {
        Self {
            nvidia_smi_path: Some(path.into()),
        }
    }

    fn nvidia_smi_path(&self) -> &str {
        self.nvidia_smi_path.as_deref().unwrap_or("nvidia-smi")
    }

    /// Parse `index,name,memory.total,memory.used` CSV rows, as produced
    /// by `--format=csv,noheader,nounits`.
    pub fn parse_csv(output: &str) -> Result<Vec<GpuInventoryEntry>, InventoryError> {
        let mut entries = Vec::new();
        for line in output.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let parts: Vec<&str> = line.split(',').map(str::trim).collect();
            if parts.len() < 4 {
                continue;
            }
            let index = parts[0]
                .parse::<u32>()
                .map_err(|e| InventoryError::Parse(format!("invalid gpu index: {e}")))?;
            let name = parts[1].to_string();
            let memory_total_mib = parts[2]
                .parse::<u64>()
                .map_err(|e| InventoryError::Parse(format!("invalid memory.total: {e}")))?;
            let memory_used_mib = parts[3]
                .parse::<u64>()
                .map_err(|e| InventoryError::Parse(format!("invalid memory.used: {e}")))?;
            entries.push(GpuInventoryEntry {
                index,
                name,
                memory_total_mib,
                memory_used_mib,
            });
        }
        Ok(entries)
    }
}

impl GpuProbe for NvidiaSmiProbe {
    fn probe(&self) -> Result<Vec<GpuInventoryEntry>, InventoryError> {
        let output = Command::new(self.nvidia_smi_path())
            .args([
                "--query-gpu=index,name,memory.total,memory.used",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .map_err(|e| InventoryError::Probe(format!("failed to run nvidia-smi: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(InventoryError::Probe(format!("nvidia-smi failed: {stderr}")));
        }

        let stdout = String::from_utf8(output.stdout)
            .map_err(|e| InventoryError::Probe(format!("invalid nvidia-smi output: {e}")))?;
        Self::parse_csv(&stdout)
    }
}

/// A probe returning a fixed, caller-supplied inventory, for tests and
/// for nodes with no attached GPUs.
#[derive(Debug, Default, Clone)]
pub struct FakeProbe {
    entries: Vec<GpuInventoryEntry>,
}

impl FakeProbe {
    /// A fake probe reporting no GPUs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one GPU to the fake inventory.
    #[must_use]
    pub fn with_gpu(mut self, entry: GpuInventoryEntry) -> Self {
        self.entries.push(entry);
        self
    }
}

impl GpuProbe for FakeProbe {
    fn probe(&self) -> Result<Vec<GpuInventoryEntry>, InventoryError> {
        Ok(self.entries.clone())
    }
}

/// GPU indices whose current utilization falls below `threshold_percent`,
/// i.e. those the agent should consider already free at startup.
#[must_use]
pub fn initially_available(entries: &[GpuInventoryEntry], threshold_percent: f64) -> Vec<u32> {
    entries
        .iter()
        .filter(|e| e.utilization_fraction() * 100.0 < threshold_percent)
        .map(|e| e.index)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u32, used: u64, total: u64) -> GpuInventoryEntry {
        GpuInventoryEntry {
            index,
            name: "Test GPU".to_string(),
            memory_total_mib: total,
            memory_used_mib: used,
        }
    }

    #[test]
    fn parses_a_single_gpu_row() {
        let csv = "0, NVIDIA A100, 81920, 128";
        let entries = NvidiaSmiProbe::parse_csv(csv).expect("parses");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].index, 0);
        assert_eq!(entries[0].name, "NVIDIA A100");
        assert_eq!(entries[0].memory_total_mib, 81920);
        assert_eq!(entries[0].memory_used_mib, 128);
    }

    #[test]
    fn parses_multiple_rows() {
        let csv = "0, NVIDIA A100, 81920, 0\n1, NVIDIA A100, 81920, 81920";
        let entries = NvidiaSmiProbe::parse_csv(csv).expect("parses");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].memory_used_mib, 81920);
    }

    #[test]
    fn skips_blank_lines() {
        let csv = "0, NVIDIA A100, 81920, 0\n\n";
        let entries = NvidiaSmiProbe::parse_csv(csv).expect("parses");
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn rejects_non_numeric_index() {
        let csv = "not_a_number, NVIDIA A100, 81920, 0";
        let err = NvidiaSmiProbe::parse_csv(csv).unwrap_err();
        assert!(matches!(err, InventoryError::Parse(_)));
    }

    #[test]
    fn initially_available_filters_by_threshold() {
        let entries = vec![entry(0, 0, 1000), entry(1, 500, 1000), entry(2, 99, 1000)];
        let available = initially_available(&entries, 10.0);
        assert_eq!(available, vec![0, 2]);
    }

    #[test]
    fn fake_probe_reports_configured_gpus() {
        let probe = FakeProbe::new().with_gpu(entry(0, 0, 1000));
        let entries = probe.probe().expect("probes");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].index, 0);
    }
}
