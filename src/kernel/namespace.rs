//! Namespaces unshared by the payload child.
//!
//! The PID namespace comes from clone() in the supervisor, so the payload
//! child normally unshares only mount and network before building its root.

use crate::config::types::{Result, UpletError};
use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

const NAMES: [(CloneFlags, &str); 4] = [
    (CloneFlags::CLONE_NEWPID, "pid"),
    (CloneFlags::CLONE_NEWNS, "mount"),
    (CloneFlags::CLONE_NEWNET, "network"),
    (CloneFlags::CLONE_NEWIPC, "ipc"),
];

fn namespace_error(what: &str, err: impl std::fmt::Display) -> UpletError {
    UpletError::Namespace(format!("{}: {}", what, err))
}

/// Set of namespaces to unshare
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NamespaceIsolation {
    flags: CloneFlags,
}

impl NamespaceIsolation {
    /// Namespaces the payload child creates for one run
    pub fn for_payload(mount: bool, network: bool) -> Self {
        let mut flags = CloneFlags::empty();
        flags.set(CloneFlags::CLONE_NEWNS, mount);
        flags.set(CloneFlags::CLONE_NEWNET, network);
        Self { flags }
    }

    pub fn with(mut self, flag: CloneFlags) -> Self {
        self.flags |= flag;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        NAMES
            .iter()
            .filter(|(flag, _)| self.flags.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }

    /// Unshare every namespace in the set. A new network namespace gets its
    /// loopback interface brought up and nothing else.
    pub fn apply(&self) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        unshare(self.flags).map_err(|e| namespace_error("unshare", e))?;
        if self.flags.contains(CloneFlags::CLONE_NEWNET) {
            bring_up_loopback()?;
        }
        log::debug!("Unshared namespaces: {:?}", self.names());
        Ok(())
    }
}

fn bring_up_loopback() -> Result<()> {
    let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if raw < 0 {
        return Err(namespace_error("loopback socket", io::Error::last_os_error()));
    }
    let sock = unsafe { OwnedFd::from_raw_fd(raw) };

    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(b"lo\0") {
        *dst = *src as libc::c_char;
    }

    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFFLAGS as _, &mut ifr) } != 0 {
        return Err(namespace_error("SIOCGIFFLAGS lo", io::Error::last_os_error()));
    }
    unsafe {
        ifr.ifr_ifru.ifru_flags |= libc::IFF_UP as libc::c_short;
    }
    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFFLAGS as _, &ifr) } != 0 {
        return Err(namespace_error("SIOCSIFFLAGS lo", io::Error::last_os_error()));
    }
    Ok(())
}

/// Make `/` recursively private so sandbox mounts never propagate to the host.
pub fn harden_mount_propagation() -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| namespace_error("MS_PRIVATE|MS_REC on /", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_set_follows_the_profile() {
        let ns = NamespaceIsolation::for_payload(true, true);
        assert_eq!(ns.names(), vec!["mount", "network"]);
        assert_eq!(
            ns.with(CloneFlags::CLONE_NEWIPC).names(),
            vec!["mount", "network", "ipc"]
        );
    }

    #[test]
    fn empty_set_is_a_no_op() {
        let none = NamespaceIsolation::for_payload(false, false);
        assert!(none.is_empty());
        assert!(none.apply().is_ok());
    }
}
