//! One `cmd_*` function per subcommand. Each builds a `modify` closure over
//! the reconstructed tree and hands it to `kerf_runtime::apply`, following
//! the same "parse args, build the in-memory change, let the runtime
//! validate and commit it" shape `tools/gluon` uses for its own mutating
//! subcommands.

use std::fs::File;
use std::os::fd::AsRawFd;

use anyhow::{anyhow, bail, Context, Result};
use kerf_model::{
    CpuAffinity, DeviceReference, Instance, InstanceOptions, InstanceResources, MemoryPolicy,
};
use kerf_runtime::FsOverlayEndpoint;

use crate::cli::{
    ConsoleArgs, CreateArgs, DeleteArgs, ExecArgs, InitArgs, KillArgs, LoadArgs, RollbackArgs,
    ShowArgs, UnloadArgs, UpdateArgs,
};
use crate::cliparse::{parse_cpu_spec, parse_memory_spec};
use crate::config::KerfConfig;

fn lock_paths(config: &KerfConfig) -> (&std::path::Path, &std::path::Path) {
    (&config.lock_path, &config.fallback_lock_path)
}

pub fn cmd_init(config: &KerfConfig, args: &InitArgs) -> Result<()> {
    let blob = std::fs::read(&args.from_dtb)
        .with_context(|| format!("reading baseline DTB {:?}", args.from_dtb))?;
    // Validates the blob decodes before it is staged, so a malformed file
    // fails here rather than leaving the mount in a half-written state.
    kerf_fdt::baseline::decode(&blob).map_err(|e| anyhow!("baseline DTB is not valid: {e}"))?;
    std::fs::create_dir_all(&config.mount_point)
        .with_context(|| format!("creating mount point {:?}", config.mount_point))?;
    std::fs::write(config.mount_point.join("device_tree"), &blob)
        .with_context(|| format!("writing baseline to {:?}", config.mount_point))?;
    println!("baseline written to {:?}", config.mount_point);
    Ok(())
}

pub fn cmd_create(config: &KerfConfig, args: &CreateArgs) -> Result<()> {
    let name = args.name.clone();
    let cpu_affinity = CpuAffinity::parse(&args.cpu_affinity).map_err(|e| anyhow!(e))?;
    let memory_policy = MemoryPolicy::parse(&args.memory_policy).map_err(|e| anyhow!(e))?;
    let memory_bytes = parse_memory_spec(&args.memory)?;
    let numa_nodes = (!args.numa_nodes.is_empty()).then(|| args.numa_nodes.clone());
    let explicit_cpus = args
        .cpus
        .as_deref()
        .map(parse_cpu_spec)
        .transpose()?;
    let devices: Vec<String> = args.devices.clone();
    let enable_host_kcore = args.enable_host_kcore;

    let endpoint = FsOverlayEndpoint::new(config.mount_point.clone());
    let outcome = kerf_runtime::apply(&endpoint, lock_paths(config), move |current| {
        if current.instances.contains_key(&name) {
            return Err(kerf_model::KerfError::ResourceConflict(format!(
                "instance '{name}' already exists"
            )));
        }

        let id = kerf_model::alloc::find_next_instance_id(current)?;

        let cpus = match &explicit_cpus {
            Some(cpus) => {
                kerf_model::alloc::validate_cpu_allocation(current, cpus, None)?;
                cpus.clone()
            }
            None => kerf_model::alloc::allocate_cpus_from_pool(
                current,
                args.cpu_count.unwrap_or(1),
                cpu_affinity,
                numa_nodes.as_deref(),
            )?,
        };

        let memory_base = kerf_model::alloc::find_available_memory_base(current, memory_bytes, 0)
            .ok_or_else(|| {
                kerf_model::KerfError::ResourceExhaustion(format!(
                    "no {memory_bytes} byte region available in the instance memory pool"
                ))
            })?;
        kerf_model::alloc::validate_memory_allocation(current, memory_base, memory_bytes, None)?;

        let mut options = InstanceOptions::new();
        if enable_host_kcore {
            options.insert("enable-host-kcore".to_string(), true);
        }

        let mut next = current.clone();
        next.instances.insert(
            name.clone(),
            Instance {
                name: name.clone(),
                id,
                resources: InstanceResources {
                    cpus,
                    memory_base,
                    memory_bytes,
                    devices: devices.clone(),
                    numa_nodes: numa_nodes.clone(),
                    cpu_affinity: Some(cpu_affinity),
                    memory_policy: Some(memory_policy),
                },
                options,
            },
        );
        for token in &devices {
            next.device_references
                .entry(token.clone())
                .or_insert_with(|| DeviceReference::parse(token));
        }
        Ok(next)
    })?;

    let created = &outcome.tree.instances[&args.name];
    println!(
        "created instance '{}' (id {}, transaction {})",
        args.name, created.id, outcome.transaction_id
    );
    Ok(())
}

pub fn cmd_update(config: &KerfConfig, args: &UpdateArgs) -> Result<()> {
    let name = args.name.clone();
    let new_cpus = args.cpus.as_deref().map(parse_cpu_spec).transpose()?;
    let new_memory_bytes = args.memory.as_deref().map(parse_memory_spec).transpose()?;

    if new_cpus.is_none() && new_memory_bytes.is_none() {
        bail!("update requires at least one of --cpus or --memory");
    }

    let endpoint = FsOverlayEndpoint::new(config.mount_point.clone());
    let outcome = kerf_runtime::apply(&endpoint, lock_paths(config), move |current| {
        let existing = current
            .instances
            .get(&name)
            .ok_or_else(|| kerf_model::KerfError::InvalidReference(format!(
                "instance '{name}' does not exist"
            )))?
            .clone();

        let mut resources = existing.resources.clone();

        if let Some(cpus) = &new_cpus {
            kerf_model::alloc::validate_cpu_allocation(current, cpus, Some(&name))?;
            resources.cpus = cpus.clone();
        }

        if let Some(memory_bytes) = new_memory_bytes {
            let base = kerf_model::alloc::find_available_memory_base(current, memory_bytes, 0)
                .ok_or_else(|| {
                    kerf_model::KerfError::ResourceExhaustion(format!(
                        "no {memory_bytes} byte region available for instance '{name}'"
                    ))
                })?;
            kerf_model::alloc::validate_memory_allocation(
                current,
                base,
                memory_bytes,
                Some(&name),
            )?;
            resources.memory_base = base;
            resources.memory_bytes = memory_bytes;
        }

        let mut next = current.clone();
        next.instances.insert(
            name.clone(),
            Instance {
                resources,
                ..existing
            },
        );
        Ok(next)
    })?;

    println!(
        "updated instance '{}' (transaction {})",
        args.name, outcome.transaction_id
    );
    Ok(())
}

pub fn cmd_delete(config: &KerfConfig, args: &DeleteArgs) -> Result<()> {
    let status = read_instance_status(config, &args.name)?;
    if matches!(status.as_str(), "loaded" | "active") {
        bail!(
            "instance '{}' must be unloaded before it can be deleted (status: {status})",
            args.name
        );
    }

    let name = args.name.clone();
    let endpoint = FsOverlayEndpoint::new(config.mount_point.clone());
    let outcome = kerf_runtime::apply(&endpoint, lock_paths(config), move |current| {
        if !current.instances.contains_key(&name) {
            return Err(kerf_model::KerfError::InvalidReference(format!(
                "instance '{name}' does not exist"
            )));
        }
        let mut next = current.clone();
        next.instances.remove(&name);
        Ok(next)
    })?;

    println!(
        "deleted instance '{}' (transaction {})",
        args.name, outcome.transaction_id
    );
    Ok(())
}

/// Reads `instances/<name>/status` directly off the mount (not the
/// reconstructed device tree, which carries no kernel-reported runtime
/// state). Treated as `empty` when the file is absent, matching a freshly
/// created instance that has never been loaded.
fn read_instance_status(config: &KerfConfig, name: &str) -> Result<String> {
    let path = config.mount_point.join("instances").join(name).join("status");
    match std::fs::read_to_string(&path) {
        Ok(status) => Ok(status.trim().to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok("empty".to_string()),
        Err(e) => Err(e).with_context(|| format!("reading instance status {path:?}")),
    }
}

pub fn cmd_load(config: &KerfConfig, args: &LoadArgs) -> Result<()> {
    let instance_id = resolve_instance_id(config, &args.name)?;
    let kernel = File::open(&args.kernel)
        .with_context(|| format!("opening kernel image {:?}", args.kernel))?;

    let initrd = args
        .initrd
        .as_ref()
        .map(|path| File::open(path).with_context(|| format!("opening initramfs {path:?}")))
        .transpose()?;
    let (initrd_fd, extra_flags) = match &initrd {
        Some(file) => (file.as_raw_fd(), 0),
        None => (-1, kerf_runtime::syscall::KEXEC_FILE_NO_INITRAMFS),
    };

    let flags = kerf_runtime::syscall::kexec_flags(instance_id, extra_flags);
    kerf_runtime::syscall::kexec_file_load(kernel.as_raw_fd(), initrd_fd, &args.cmdline, flags)?;
    println!("loaded kernel into instance '{}'", args.name);
    Ok(())
}

pub fn cmd_exec(config: &KerfConfig, args: &ExecArgs) -> Result<()> {
    let instance_id = resolve_instance_id(config, &args.name)?;
    kerf_runtime::syscall::reboot_multikernel(
        kerf_runtime::syscall::MultikernelRebootCommand::Boot,
        u32::from(instance_id),
    )?;
    println!("handed control to instance '{}'", args.name);
    Ok(())
}

pub fn cmd_kill(config: &KerfConfig, args: &KillArgs) -> Result<()> {
    let instance_id = resolve_instance_id(config, &args.name)?;
    let cmd = if args.force {
        kerf_runtime::syscall::MultikernelRebootCommand::HaltForce
    } else {
        kerf_runtime::syscall::MultikernelRebootCommand::Halt
    };
    kerf_runtime::syscall::reboot_multikernel(cmd, u32::from(instance_id))?;
    println!("halted instance '{}'", args.name);
    Ok(())
}

pub fn cmd_unload(config: &KerfConfig, args: &UnloadArgs) -> Result<()> {
    let instance_id = resolve_instance_id(config, &args.name)?;
    let flags = kerf_runtime::syscall::kexec_flags(
        instance_id,
        kerf_runtime::syscall::KEXEC_FILE_UNLOAD,
    );
    kerf_runtime::syscall::kexec_file_load(-1, -1, "", flags)?;
    println!("unloaded instance '{}'", args.name);
    Ok(())
}

pub fn cmd_show(config: &KerfConfig, args: &ShowArgs) -> Result<()> {
    let endpoint = FsOverlayEndpoint::new(config.mount_point.clone());
    let tree = kerf_runtime::reconstruct(&endpoint)?;

    if args.dtb {
        let blob = kerf_fdt::state::encode(&tree);
        use std::io::Write;
        std::io::stdout()
            .write_all(&blob)
            .context("writing device tree blob to stdout")?;
        return Ok(());
    }

    match &args.name {
        Some(name) => {
            let instance = tree
                .instances
                .get(name)
                .ok_or_else(|| anyhow!("instance '{name}' does not exist"))?;
            println!("{name} (id {})", instance.id);
            println!("  cpus: {:?}", instance.resources.cpus);
            println!(
                "  memory: {:#x}-{:#x}",
                instance.resources.memory_base,
                instance.resources.memory_base + instance.resources.memory_bytes
            );
            if !instance.resources.devices.is_empty() {
                println!("  devices: {:?}", instance.resources.devices);
            }
        }
        None => {
            println!(
                "hardware: {} cpus total, {} available",
                tree.hardware.cpus.total,
                tree.hardware.cpus.available.len()
            );
            for instance in tree.instances.values() {
                println!("  {} (id {})", instance.name, instance.id);
            }
        }
    }
    Ok(())
}

pub fn cmd_rollback(config: &KerfConfig, args: &RollbackArgs) -> Result<()> {
    let endpoint = FsOverlayEndpoint::new(config.mount_point.clone());
    kerf_runtime::rollback(&endpoint, lock_paths(config), args.transaction_id)?;
    println!("rolled back transaction {}", args.transaction_id);
    Ok(())
}

pub fn cmd_console(config: &KerfConfig, args: &ConsoleArgs) -> Result<()> {
    crate::console::attach(config, &args.name)
}

fn resolve_instance_id(config: &KerfConfig, name: &str) -> Result<u16> {
    let endpoint = FsOverlayEndpoint::new(config.mount_point.clone());
    let tree = kerf_runtime::reconstruct(&endpoint)?;
    tree.instances
        .get(name)
        .map(|inst| inst.id)
        .ok_or_else(|| anyhow!("instance '{name}' does not exist"))
}
