//! Network-policy enforcement at the namespace boundary
//!
//! `none` drops the child into a fresh user+network namespace with no
//! interfaces, so every socket operation fails at the kernel. `local`
//! additionally brings the namespace loopback up, leaving 127.0.0.1 as the
//! only reachable destination. `internet` applies no isolation.

use gangway_core::NetworkPolicy;
use std::io;

/// Whether the policy requires a namespace around the child
pub fn requires_isolation(policy: NetworkPolicy) -> bool {
    !matches!(policy, NetworkPolicy::Internet)
}

/// Applied between fork and exec in the child. Must stay async-signal-safe:
/// raw syscalls only, no allocation.
#[cfg(target_os = "linux")]
pub fn isolate(policy: NetworkPolicy) -> io::Result<()> {
    let flags = libc::CLONE_NEWUSER | libc::CLONE_NEWNET;
    // SAFETY: unshare only detaches this process into new namespaces
    if unsafe { libc::unshare(flags) } != 0 {
        return Err(io::Error::last_os_error());
    }
    if policy == NetworkPolicy::Local {
        bring_loopback_up()?;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn bring_loopback_up() -> io::Result<()> {
    // SIOCSIFFLAGS on a throwaway datagram socket; the new user namespace
    // grants CAP_NET_ADMIN over the new network namespace
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut ifr: libc::ifreq = std::mem::zeroed();
        let name = b"lo\0";
        std::ptr::copy_nonoverlapping(
            name.as_ptr() as *const libc::c_char,
            ifr.ifr_name.as_mut_ptr(),
            name.len(),
        );
        ifr.ifr_ifru.ifru_flags = (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;

        let rc = libc::ioctl(fd, libc::SIOCSIFFLAGS as _, &ifr);
        let saved = io::Error::last_os_error();
        libc::close(fd);
        if rc != 0 {
            return Err(saved);
        }
    }
    Ok(())
}

/// Namespace isolation is Linux-only; restrictive policies fail closed
/// elsewhere rather than running unconfined.
#[cfg(all(unix, not(target_os = "linux")))]
pub fn isolate(_policy: NetworkPolicy) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "network isolation requires Linux namespaces",
    ))
}
