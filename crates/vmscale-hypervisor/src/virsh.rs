//! libvirt backend driven through the `virsh` and `virt-install` CLIs.
//!
//! One driver serves all three hypervisor kinds; only the connection URI
//! differs. Each operation spawns a child process with `kill_on_drop`, so a
//! caller-side timeout also stops the underlying command.

use std::path::Path;

use tokio::process::Command;
use tracing::debug;
use vmscale_core::{HostConfig, HypervisorKind, Protocol};

use crate::driver::{BoxFuture, Connection, Driver, NodeStats, VmSpec};
use crate::error::{DriverError, DriverResult};

const VIRSH: &str = "virsh";
const VIRT_INSTALL: &str = "virt-install";

/// libvirt connection URI for a host.
pub fn connection_uri(host: &HostConfig) -> String {
    let user = host
        .user
        .as_deref()
        .map(|u| format!("{u}@"))
        .unwrap_or_default();
    let addr = format!("{}:{}", host.address, host.port);

    match host.hypervisor {
        HypervisorKind::Esx => format!("esx://{user}{addr}/?no_verify=1"),
        kind => match host.protocol {
            Protocol::Ssh => format!("{kind}+ssh://{user}{addr}/system"),
            Protocol::Tls => format!("{kind}+tls://{addr}/system"),
        },
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct VirshDriver;

impl VirshDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Driver for VirshDriver {
    fn name(&self) -> &'static str {
        "virsh"
    }

    fn open<'a>(&'a self, host: &'a HostConfig) -> BoxFuture<'a, DriverResult<Box<dyn Connection>>> {
        Box::pin(async move {
            let uri = connection_uri(host);
            run(VIRSH, &host.name, &["-c", uri.as_str(), "version"]).await?;
            debug!(host = %host.name, %uri, "libvirt connection verified");
            Ok(Box::new(VirshConnection {
                host: host.clone(),
                uri,
            }) as Box<dyn Connection>)
        })
    }
}

pub struct VirshConnection {
    host: HostConfig,
    uri: String,
}

impl VirshConnection {
    async fn virsh(&self, args: &[&str]) -> DriverResult<String> {
        let mut full = vec!["-c", self.uri.as_str()];
        full.extend_from_slice(args);
        run(VIRSH, &self.host.name, &full).await
    }
}

impl Connection for VirshConnection {
    fn host(&self) -> &str {
        &self.host.name
    }

    fn create_vm<'a>(&'a mut self, spec: &'a VmSpec) -> BoxFuture<'a, DriverResult<()>> {
        Box::pin(async move {
            spec.check()?;
            // Holds the cloud-init files until virt-install has read them.
            let scratch = tempfile::tempdir().map_err(|e| DriverError::Command {
                program: VIRT_INSTALL.into(),
                stderr: format!("scratch dir: {e}"),
            })?;
            let cloud_init = write_cloud_init(spec, scratch.path()).await?;
            let args = virt_install_args(&self.uri, spec, cloud_init.as_deref());
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            run(VIRT_INSTALL, &self.host.name, &args).await?;
            debug!(host = %self.host.name, domain = %spec.name, "domain defined and started");
            Ok(())
        })
    }

    fn delete_vm<'a>(&'a mut self, name: &'a str) -> BoxFuture<'a, DriverResult<()>> {
        Box::pin(async move {
            match self.virsh(&["destroy", name]).await {
                Ok(_) => {}
                Err(DriverError::Command { stderr, .. }) if stderr.contains("not running") => {}
                Err(e) => return Err(e),
            }
            self.virsh(&["undefine", name, "--remove-all-storage"]).await?;
            Ok(())
        })
    }

    fn migrate_vm<'a>(
        &'a mut self,
        name: &'a str,
        target: &'a HostConfig,
    ) -> BoxFuture<'a, DriverResult<()>> {
        Box::pin(async move {
            let dest = connection_uri(target);
            self.virsh(&[
                "migrate",
                "--live",
                "--persistent",
                "--undefinesource",
                name,
                dest.as_str(),
            ])
            .await?;
            Ok(())
        })
    }

    fn set_power<'a>(&'a mut self, name: &'a str, on: bool) -> BoxFuture<'a, DriverResult<()>> {
        Box::pin(async move {
            let result = if on {
                self.virsh(&["start", name]).await
            } else {
                self.virsh(&["shutdown", name]).await
            };
            match result {
                Ok(_) => Ok(()),
                Err(DriverError::AlreadyExists(_)) if on => Ok(()),
                Err(DriverError::Command { stderr, .. }) if !on && stderr.contains("not running") => {
                    Ok(())
                }
                Err(e) => Err(e),
            }
        })
    }

    fn node_stats(&mut self) -> BoxFuture<'_, DriverResult<NodeStats>> {
        Box::pin(async move {
            let cpu = self.virsh(&["nodecpustats", "--percent"]).await?;
            let mem = self.virsh(&["nodememstats"]).await?;
            Ok(NodeStats {
                cpu_percent: parse_cpu_percent(&cpu).ok_or_else(|| unparseable("nodecpustats"))?,
                memory_percent: parse_memory_percent(&mem)
                    .ok_or_else(|| unparseable("nodememstats"))?,
            })
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            debug!(host = %self.host.name, "libvirt connection closed");
        })
    }
}

fn unparseable(what: &str) -> DriverError {
    DriverError::Command {
        program: VIRSH.into(),
        stderr: format!("unparseable {what} output"),
    }
}

async fn run(program: &str, host: &str, args: &[&str]) -> DriverResult<String> {
    debug!(%program, %host, ?args, "running");
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| DriverError::Command {
            program: program.to_string(),
            stderr: e.to_string(),
        })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(DriverError::from_stderr(program, host, &stderr))
    }
}

/// Write cloud-init documents into `dir` and return the `--cloud-init`
/// argument value, if the spec carries any.
async fn write_cloud_init(spec: &VmSpec, dir: &Path) -> DriverResult<Option<String>> {
    let generated_network = spec.network.as_ref().filter(|n| n.dhcp).map(|_| {
        "version: 2\nethernets:\n  primary:\n    match:\n      name: \"e*\"\n    dhcp4: true\n".to_string()
    });

    let Some(ci) = spec.cloud_init.as_ref() else {
        return match generated_network {
            Some(net) => {
                let path = dir.join("network-config");
                write_file(&path, &net).await?;
                Ok(Some(format!("network-config={}", path.display())))
            }
            None => Ok(None),
        };
    };

    let mut parts = Vec::new();
    let user = dir.join("user-data");
    write_file(&user, &ci.user_data).await?;
    parts.push(format!("user-data={}", user.display()));

    if !ci.meta_data.is_empty() {
        let meta = dir.join("meta-data");
        write_file(&meta, &ci.meta_data).await?;
        parts.push(format!("meta-data={}", meta.display()));
    }

    let network = if ci.network_data.is_empty() {
        generated_network
    } else {
        Some(ci.network_data.clone())
    };
    if let Some(net) = network {
        let path = dir.join("network-config");
        write_file(&path, &net).await?;
        parts.push(format!("network-config={}", path.display()));
    }

    if !ci.vendor_data.is_empty() {
        debug!(domain = %spec.name, "vendor-data is not supported by virt-install, skipped");
    }

    Ok(Some(parts.join(",")))
}

async fn write_file(path: &Path, body: &str) -> DriverResult<()> {
    tokio::fs::write(path, body)
        .await
        .map_err(|e| DriverError::Command {
            program: VIRT_INSTALL.into(),
            stderr: format!("write {}: {e}", path.display()),
        })
}

fn virt_install_args(uri: &str, spec: &VmSpec, cloud_init: Option<&str>) -> Vec<String> {
    let disk = if spec.resources.storage > 0 {
        format!(
            "size={},backing_store={}",
            spec.resources.storage, spec.image
        )
    } else {
        format!("path={}", spec.image)
    };

    let mut args = vec![
        "--connect".to_string(),
        uri.to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--memory".to_string(),
        spec.resources.memory.to_string(),
        "--vcpus".to_string(),
        spec.resources.cpu.to_string(),
        "--disk".to_string(),
        disk,
        "--import".to_string(),
        "--osinfo".to_string(),
        "detect=on,require=off".to_string(),
        "--noautoconsole".to_string(),
    ];
    if let Some(ci) = cloud_init {
        args.push("--cloud-init".to_string());
        args.push(ci.to_string());
    }
    args
}

/// `usage:` line of `virsh nodecpustats --percent`.
fn parse_cpu_percent(output: &str) -> Option<f64> {
    output.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("usage:")?;
        rest.trim().trim_end_matches('%').trim().parse().ok()
    })
}

/// Used share of memory from `virsh nodememstats` (KiB values).
fn parse_memory_percent(output: &str) -> Option<f64> {
    let field = |name: &str| -> Option<f64> {
        output.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            if key.trim() != name {
                return None;
            }
            value.split_whitespace().next()?.parse().ok()
        })
    };

    let total = field("total")?;
    if total <= 0.0 {
        return None;
    }
    let free = field("free")?;
    let reclaimable = field("buffers").unwrap_or(0.0) + field("cached").unwrap_or(0.0);
    let used = (total - free - reclaimable).max(0.0);
    Some(used / total * 100.0)
}
