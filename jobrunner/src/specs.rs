//! Hardware facts reported alongside a finished job.

use crate::runtime::{ContainerRuntime, RunSpec};
use async_trait::async_trait;
use protocol::MachineSpecs;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

const GPU_QUERY: &str = "name,driver_version,memory.total,compute_cap,power.limit,clocks.gr,clocks.mem,uuid,serial";
const GPU_FIELDS: [&str; 9] = [
    "name",
    "driver",
    "capacity",
    "cuda",
    "power_limit",
    "graphics_speed",
    "memory_speed",
    "uuid",
    "serial",
];
const GPU_PROBE_TIMEOUT: Duration = Duration::from_secs(60);

#[async_trait]
pub trait SpecsProbe: Send + Sync {
    /// Never fails: sections that cannot be read carry a `<section>_scrape_error` entry instead.
    async fn collect(&self) -> MachineSpecs;
}

pub struct HostSpecsProbe {
    runtime: Arc<dyn ContainerRuntime>,
    gpu_image: String,
    container_name: String,
    /// Disk usage is reported for the filesystem holding this path.
    disk_path: PathBuf,
}

impl HostSpecsProbe {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        gpu_image: impl Into<String>,
        container_name: impl Into<String>,
        disk_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runtime,
            gpu_image: gpu_image.into(),
            container_name: container_name.into(),
            disk_path: disk_path.into(),
        }
    }

    async fn gpu(&self) -> Result<Value, String> {
        let mut spec = RunSpec::new(&self.container_name, &self.gpu_image);
        spec.extra_flags = vec!["--runtime=nvidia".into(), "--gpus".into(), "all".into()];
        spec.command = vec![
            "nvidia-smi".into(),
            format!("--query-gpu={}", GPU_QUERY),
            "--format=csv,noheader,nounits".into(),
        ];
        let outcome = self
            .runtime
            .run(&spec, GPU_PROBE_TIMEOUT)
            .await
            .map_err(|err| err.to_string())?;
        if outcome.exit_status != Some(0) {
            return Err(format!(
                "nvidia-smi exited with {:?}: {}",
                outcome.exit_status,
                outcome.stderr.trim()
            ));
        }
        let details = parse_gpu_rows(&outcome.stdout)?;
        Ok(json!({ "count": details.len(), "details": details }))
    }

    fn disk(&self) -> Result<Value, String> {
        let total = fs2::total_space(&self.disk_path).map_err(|err| err.to_string())?;
        let free = fs2::available_space(&self.disk_path).map_err(|err| err.to_string())?;
        Ok(json!({
            "total": total / 1024,
            "used": total.saturating_sub(free) / 1024,
            "free": free / 1024,
        }))
    }
}

/// Rows of `nvidia-smi --format=csv,noheader,nounits`.
fn parse_gpu_rows(csv: &str) -> Result<Vec<Value>, String> {
    csv.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let cells: Vec<&str> = line.split(',').map(str::trim).collect();
            if cells.len() != GPU_FIELDS.len() {
                return Err(format!("unexpected nvidia-smi row: {:?}", line));
            }
            let row: Map<String, Value> = GPU_FIELDS
                .iter()
                .zip(cells)
                .map(|(field, cell)| (field.to_string(), Value::from(cell)))
                .collect();
            Ok(Value::Object(row))
        })
        .collect()
}

fn cpu(system: &System) -> Result<Value, String> {
    let cpus = system.cpus();
    let first = cpus.first().ok_or("no cpus reported")?;
    let clocks: Vec<u64> = cpus.iter().map(|cpu| cpu.frequency()).collect();
    Ok(json!({
        "count": cpus.len(),
        "model": first.brand().trim(),
        "clocks": clocks,
    }))
}

fn ram(system: &System) -> Result<Value, String> {
    let total = system.total_memory();
    if total == 0 {
        return Err("memory totals unavailable".to_string());
    }
    let free = system.free_memory();
    Ok(json!({
        "total": total / 1024,
        "free": free / 1024,
        "available": system.available_memory() / 1024,
        "used": total.saturating_sub(free) / 1024,
    }))
}

fn record(specs: &mut Map<String, Value>, section: &str, value: Result<Value, String>) {
    match value {
        Ok(value) => {
            specs.insert(section.to_string(), value);
        }
        Err(err) => {
            tracing::warn!(section, error = %err, "failed to collect machine specs");
            specs.insert(format!("{}_scrape_error", section), Value::from(err));
        }
    }
}

#[async_trait]
impl SpecsProbe for HostSpecsProbe {
    async fn collect(&self) -> MachineSpecs {
        let mut specs = Map::new();
        record(&mut specs, "gpu", self.gpu().await);

        let host = tokio::task::spawn_blocking(|| {
            let system = System::new_with_specifics(
                RefreshKind::new()
                    .with_cpu(CpuRefreshKind::new().with_frequency())
                    .with_memory(MemoryRefreshKind::new().with_ram()),
            );
            (cpu(&system), ram(&system), System::long_os_version())
        })
        .await;
        match host {
            Ok((cpu, ram, os)) => {
                record(&mut specs, "cpu", cpu);
                record(&mut specs, "ram", ram);
                record(
                    &mut specs,
                    "os",
                    os.map(Value::from).ok_or_else(|| "os version unavailable".to_string()),
                );
            }
            Err(err) => {
                for section in ["cpu", "ram", "os"] {
                    record(&mut specs, section, Err(err.to_string()));
                }
            }
        }

        record(&mut specs, "hard_disk", self.disk());
        MachineSpecs {
            specs: Value::Object(specs),
        }
    }
}
