//! Thin typed wrappers over the two raw syscalls `kerf load`/`kerf exec`/
//! `kerf kill`/`kerf unload` use: `kexec_file_load(2)` with the
//! multikernel-specific flag bits, and the host's multikernel `reboot(2)`
//! command words (`boot`/`halt`/`halt-force`). Neither the flag bits nor the
//! command words have a binding in `nix` or `libc`, so both go through
//! `libc::syscall` directly, the same way the corpus wraps platform
//! primitives nothing else exposes.

use std::os::fd::RawFd;

use kerf_model::{KerfError, Result};

const SYS_KEXEC_FILE_LOAD: libc::c_long = 320;

/// `kexec_file_load` flag: load the target kernel into a fresh multikernel
/// partition rather than replacing the currently running kernel.
pub const KEXEC_MULTIKERNEL: libc::c_ulong = 0x0000_0010;
/// `kexec_file_load` flag: tear down a previously loaded image instead of
/// staging a new one.
pub const KEXEC_FILE_UNLOAD: libc::c_ulong = 0x0000_0001;
/// `kexec_file_load` flag: no initramfs was supplied.
pub const KEXEC_FILE_NO_INITRAMFS: libc::c_ulong = 0x0000_0004;

const REBOOT_MAGIC1: libc::c_int = 0xfee1_dead_u32 as libc::c_int;
const REBOOT_MAGIC2: libc::c_int = 0x2828_2828;

/// Multikernel `reboot(2)` command words (distinct from the stock Linux
/// `LINUX_REBOOT_CMD_*` constants — these are host-kernel extensions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultikernelRebootCommand {
    /// Hand control to a loaded instance's kernel.
    Boot,
    /// Gracefully halt a running instance.
    Halt,
    /// Forcibly halt a running instance.
    HaltForce,
}

impl MultikernelRebootCommand {
    fn cmd_word(self) -> libc::c_int {
        match self {
            Self::Boot => 0x4D4B_4C49,
            Self::Halt => 0x4D4B_4C48,
            Self::HaltForce => 0x4D4B_4C46,
        }
    }
}

/// Argument block passed by reference to the multikernel `reboot(2)`
/// extension, naming which instance the command applies to.
#[repr(C)]
struct MultikernelRebootArgs {
    mk_id: u32,
}

/// Computes the `flags` word for [`kexec_file_load`]: the multikernel bit,
/// the instance ID packed into bits 5-15, and any additional flags
/// (`KEXEC_FILE_UNLOAD`, `KEXEC_FILE_NO_INITRAMFS`).
#[must_use]
pub fn kexec_flags(instance_id: u16, extra: libc::c_ulong) -> libc::c_ulong {
    KEXEC_MULTIKERNEL | ((libc::c_ulong::from(instance_id) << 5) & 0xFFE0) | extra
}

/// Loads a kernel image plus optional initramfs into an instance partition,
/// or tears one down, via `kexec_file_load(2)`.
///
/// `kernel_fd` and `initrd_fd` must be open, readable file descriptors;
/// `initrd_fd` of `-1` means no initramfs (pair with
/// [`KEXEC_FILE_NO_INITRAMFS`] in `flags`). `flags` should be built with
/// [`kexec_flags`].
pub fn kexec_file_load(
    kernel_fd: RawFd,
    initrd_fd: RawFd,
    cmdline: &str,
    flags: libc::c_ulong,
) -> Result<()> {
    let cmdline_cstr = std::ffi::CString::new(cmdline)
        .map_err(|e| KerfError::Validation(format!("command line contains a NUL byte: {e}")))?;
    // SAFETY: `kernel_fd`/`initrd_fd` are caller-owned open descriptors kept
    // alive for the duration of this call; `cmdline_cstr` is a valid
    // NUL-terminated buffer whose length is passed alongside it.
    let rc = unsafe {
        libc::syscall(
            SYS_KEXEC_FILE_LOAD,
            kernel_fd,
            initrd_fd,
            cmdline_cstr.as_bytes_with_nul().len() as libc::c_ulong,
            cmdline_cstr.as_ptr(),
            flags,
        )
    };
    if rc < 0 {
        let errno = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EINVAL);
        return Err(KerfError::kernel_interface(errno, "kexec_file_load"));
    }
    Ok(())
}

/// Issues a multikernel `reboot(2)` command against instance `mk_id`.
///
/// `reboot` never returns on a successful `Boot` that hands control away;
/// for `Halt`/`HaltForce` it returns once the host kernel acknowledges the
/// request.
pub fn reboot_multikernel(cmd: MultikernelRebootCommand, mk_id: u32) -> Result<()> {
    let args = MultikernelRebootArgs { mk_id };
    // SAFETY: `reboot(2)` with the documented magic constants and a
    // multikernel command word takes a pointer to a fixed-size argument
    // struct it reads synchronously; `args` outlives the call.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_reboot,
            REBOOT_MAGIC1,
            REBOOT_MAGIC2,
            cmd.cmd_word(),
            std::ptr::from_ref(&args),
        )
    };
    if rc < 0 {
        let errno = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EINVAL);
        return Err(KerfError::kernel_interface(errno, format!("reboot({cmd:?})")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kexec_file_load_rejects_nul_in_cmdline() {
        let err = kexec_file_load(3, -1, "console=ttyS0\0extra", 0).unwrap_err();
        assert!(matches!(err, KerfError::Validation(_)));
    }

    #[test]
    fn kexec_flags_packs_instance_id_and_extra_bits() {
        let flags = kexec_flags(3, KEXEC_FILE_NO_INITRAMFS);
        assert_eq!(flags & KEXEC_MULTIKERNEL, KEXEC_MULTIKERNEL);
        assert_eq!(flags & KEXEC_FILE_NO_INITRAMFS, KEXEC_FILE_NO_INITRAMFS);
        assert_eq!((flags >> 5) & 0x7FF, 3);
    }

    #[test]
    fn kexec_flags_with_unload_carries_unload_bit() {
        let flags = kexec_flags(7, KEXEC_FILE_UNLOAD);
        assert_eq!(flags & KEXEC_FILE_UNLOAD, KEXEC_FILE_UNLOAD);
    }
}
