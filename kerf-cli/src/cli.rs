//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Multikernel host control plane.
#[derive(Parser)]
#[command(name = "kerf", version, about)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Path to a `kerf` TOML configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Multikernel pseudo-filesystem mount point.
    #[arg(long, global = true)]
    pub mount_point: Option<PathBuf>,

    /// Enable verbose (debug-level) logging.
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Write the initial baseline hardware inventory.
    Init(InitArgs),
    /// Create a new instance.
    Create(CreateArgs),
    /// Update an existing instance's CPU set and/or memory region.
    Update(UpdateArgs),
    /// Delete an instance.
    Delete(DeleteArgs),
    /// Stage a kernel image into an instance and boot it.
    Load(LoadArgs),
    /// Hand control to an already-loaded instance's kernel.
    Exec(ExecArgs),
    /// Halt a running instance.
    Kill(KillArgs),
    /// Tear down a loaded instance's kernel image.
    Unload(UnloadArgs),
    /// Print the current effective device tree, or one instance's detail.
    Show(ShowArgs),
    /// Attach to an instance's console device.
    Console(ConsoleArgs),
    /// Roll back a previously applied transaction.
    Rollback(RollbackArgs),
}

/// Arguments for the `init` subcommand.
#[derive(Parser)]
pub struct InitArgs {
    /// Path to a baseline FDT blob to load verbatim (binary DTB only; no
    /// textual device-tree-source parsing).
    #[arg(long)]
    pub from_dtb: PathBuf,
}

/// Arguments for the `create` subcommand.
#[derive(Parser)]
pub struct CreateArgs {
    /// Instance name, unique within the tree.
    pub name: String,

    /// Explicit CPU set (`4-7,10,12-14`). Mutually exclusive with
    /// `--cpu-count`.
    #[arg(long, conflicts_with = "cpu_count")]
    pub cpus: Option<String>,

    /// Number of CPUs to allocate automatically under `--cpu-affinity`.
    #[arg(long)]
    pub cpu_count: Option<usize>,

    /// CPU affinity policy used when `--cpu-count` allocates automatically.
    #[arg(long, default_value = "compact")]
    pub cpu_affinity: String,

    /// Memory size (`2GB`, `512MB`, or a plain byte count).
    #[arg(long)]
    pub memory: String,

    /// Memory placement policy.
    #[arg(long, default_value = "local")]
    pub memory_policy: String,

    /// Preferred NUMA nodes (comma-separated), used by `local`/`spread`
    /// affinity and `bind` memory policy.
    #[arg(long, value_delimiter = ',')]
    pub numa_nodes: Vec<u32>,

    /// Device reference tokens (`eth0`, `eth0_vf1`, `nvme0_ns2`, ...).
    #[arg(long, value_delimiter = ',')]
    pub devices: Vec<String>,

    /// Enable the `enable-host-kcore` instance option.
    #[arg(long)]
    pub enable_host_kcore: bool,
}

/// Arguments for the `update` subcommand.
#[derive(Parser)]
pub struct UpdateArgs {
    /// Instance name.
    pub name: String,

    /// New explicit CPU set, replacing the instance's current set.
    #[arg(long)]
    pub cpus: Option<String>,

    /// New memory size; a new base is chosen automatically.
    #[arg(long)]
    pub memory: Option<String>,
}

/// Arguments for the `delete` subcommand.
#[derive(Parser)]
pub struct DeleteArgs {
    /// Instance name.
    pub name: String,
}

/// Arguments for the `load` subcommand.
#[derive(Parser)]
pub struct LoadArgs {
    /// Instance name.
    pub name: String,

    /// Path to the kernel image.
    #[arg(long)]
    pub kernel: PathBuf,

    /// Path to an initramfs image, if any.
    #[arg(long)]
    pub initrd: Option<PathBuf>,

    /// Kernel command line.
    #[arg(long, default_value = "")]
    pub cmdline: String,
}

/// Arguments for the `exec` subcommand.
#[derive(Parser)]
pub struct ExecArgs {
    /// Instance name.
    pub name: String,
}

/// Arguments for the `kill` subcommand.
#[derive(Parser)]
pub struct KillArgs {
    /// Instance name.
    pub name: String,

    /// Force an immediate halt instead of a graceful one.
    #[arg(long)]
    pub force: bool,
}

/// Arguments for the `unload` subcommand.
#[derive(Parser)]
pub struct UnloadArgs {
    /// Instance name.
    pub name: String,
}

/// Arguments for the `show` subcommand.
#[derive(Parser)]
pub struct ShowArgs {
    /// Show only this instance's detail instead of the whole tree.
    pub name: Option<String>,

    /// Emit the state dialect FDT blob (binary) instead of a text report.
    #[arg(long)]
    pub dtb: bool,
}

/// Arguments for the `console` subcommand.
#[derive(Parser)]
pub struct ConsoleArgs {
    /// Instance name.
    pub name: String,
}

/// Arguments for the `rollback` subcommand.
#[derive(Parser)]
pub struct RollbackArgs {
    /// Transaction ID to roll back.
    pub transaction_id: u64,
}
