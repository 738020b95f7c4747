use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Args;

use libcgroups::{CgroupSpecBuilder, Resources};
use libcontainer::namespace::{NamespaceSpec, NamespaceType};
use libcontainer::network::{Ipv4Net, NetworkConfig};
use libcontainer::runner::{self, LaunchRequest};

/// Run a command inside a fresh container.
#[derive(Args, Debug)]
pub struct Run {
    /// memory limit for the container in bytes (memory.limit_in_bytes)
    #[arg(long)]
    memory_limit: Option<u64>,
    /// CPU shares for the container (cpu.shares)
    #[arg(long)]
    cpu_shares: Option<u64>,
    /// block I/O weight for the container (blkio.weight)
    #[arg(long)]
    blkio_weight: Option<u64>,
    /// cgroup leaf name for the container
    #[arg(long)]
    cgroup_name: Option<String>,
    /// namespace tag for the container
    #[arg(long)]
    namespace_name: Option<String>,
    /// namespace type: 0=PID, 1=UTS, 2=IPC, 3=Net, 4=User, 5=Cgroup
    #[arg(long, default_value_t = 0)]
    namespace_type: i64,
    /// absolute root path for the container filesystem
    #[arg(long)]
    fs_root: Option<PathBuf>,
    /// kernel interface name backing the container network
    #[arg(long)]
    network_name: Option<String>,
    /// IPv4 CIDR the container address is drawn from
    #[arg(long, required = true)]
    network_ip_cidr: Ipv4Net,
    /// gateway address for the container network
    #[arg(long)]
    network_gateway: Option<Ipv4Addr>,
    /// the command to execute and its arguments
    #[arg(trailing_var_arg = true, required = true)]
    command: Vec<String>,
}

pub fn run(args: Run) -> i32 {
    let request = match build_request(args) {
        Ok(request) => request,
        Err(err) => {
            eprintln!("spocker: InvalidSpec: {err:#}");
            return 1;
        }
    };

    match runner::run(&request) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("spocker: {}: {err}", err.kind());
            1
        }
    }
}

fn build_request(args: Run) -> Result<LaunchRequest> {
    let namespace_type = NamespaceType::from_ordinal(args.namespace_type)
        .ok_or_else(|| anyhow!("namespace type {} out of range 0..=5", args.namespace_type))?;

    let cgroup = CgroupSpecBuilder::new()
        .with_name(args.cgroup_name.unwrap_or_default())
        .with_resources(Resources {
            cpu_shares: args.cpu_shares,
            memory_limit_bytes: args.memory_limit,
            blkio_weight: args.blkio_weight,
        })
        .build()?;

    Ok(LaunchRequest {
        argv: args.command,
        cgroup,
        namespace: NamespaceSpec {
            name: args.namespace_name.unwrap_or_default(),
            typ: namespace_type,
        },
        fs_root: args.fs_root.unwrap_or_default(),
        network: NetworkConfig {
            name: args.network_name.unwrap_or_default(),
            cidr: Some(args.network_ip_cidr),
            gateway: args.network_gateway,
            dns: None,
            dhcp: false,
            dhcp_args: Vec::new(),
        },
    })
}
