/// Pre-exec ordering for the sandbox payload
///
/// The setup sequence is fixed:
/// 1. setsid() and parent death signal
/// 2. namespace setup (unshare flags as configured)
/// 3. mount propagation hardening: `/` becomes MS_PRIVATE | MS_REC
/// 4. input bindings, system mounts and root transition (chroot or chdir)
/// 5. rlimits, umask, FD closure and environment
/// 6. setresgid then setresuid
/// 7. prctl(PR_SET_NO_NEW_PRIVS, 1)
/// 8. exec payload
use crate::config::types::{Result, UpletError};
use crate::core::types::ExecutionProfile;
use crate::kernel::credentials::{check_no_new_privs, set_no_new_privs, transition_to_unprivileged};
use crate::kernel::mount::{BindingMode, SandboxRoot};
use crate::kernel::namespace::NamespaceIsolation;
use std::ffi::CString;
use std::marker::PhantomData;
use std::os::unix::io::RawFd;

fn apply_rlimit_value(
    name: &str,
    resource: libc::__rlimit_resource_t,
    limit: u64,
    strict_mode: bool,
) -> Result<()> {
    let value = libc::rlimit {
        rlim_cur: limit as libc::rlim_t,
        rlim_max: limit as libc::rlim_t,
    };

    let rc = unsafe { libc::setrlimit(resource, &value) };
    if rc == 0 {
        return Ok(());
    }

    let err = std::io::Error::last_os_error();
    if strict_mode {
        Err(UpletError::Process(format!(
            "Failed to apply {}={}: {}",
            name, limit, err
        )))
    } else {
        log::warn!("Failed to apply {}={} in permissive mode: {}", name, limit, err);
        Ok(())
    }
}

/// Replace the inherited environment with exactly `vars`
fn apply_exec_environment(vars: &[(String, String)], strict_mode: bool) -> Result<()> {
    if unsafe { libc::clearenv() } != 0 {
        let err = std::io::Error::last_os_error();
        if strict_mode {
            return Err(UpletError::Process(format!("clearenv failed: {}", err)));
        }
        log::warn!("clearenv failed in permissive mode: {}", err);
    }

    for (key, value) in vars {
        let (key_c, value_c) = match (CString::new(key.as_str()), CString::new(value.as_str())) {
            (Ok(k), Ok(v)) => (k, v),
            _ if strict_mode => {
                return Err(UpletError::Config(format!(
                    "Environment entry {} contains a NUL byte",
                    key
                )));
            }
            _ => {
                log::warn!("Skipping environment entry {} with NUL byte", key);
                continue;
            }
        };

        if unsafe { libc::setenv(key_c.as_ptr(), value_c.as_ptr(), 1) } != 0 {
            let err = std::io::Error::last_os_error();
            if strict_mode {
                return Err(UpletError::Process(format!("setenv failed for {}: {}", key, err)));
            }
            log::warn!("setenv failed for {} in permissive mode: {}", key, err);
        }
    }

    Ok(())
}

/// Close every descriptor above stderr except `keep`
fn close_inherited_fds(keep: Option<RawFd>) -> Result<()> {
    let fds: Vec<RawFd> = std::fs::read_dir("/proc/self/fd")
        .map_err(|e| UpletError::Filesystem(format!("Failed to read /proc/self/fd: {}", e)))?
        .flatten()
        .filter_map(|entry| entry.file_name().to_str().and_then(|name| name.parse().ok()))
        .collect();

    for fd in fds.into_iter().filter(|fd| *fd > 2 && Some(*fd) != keep) {
        // EBADF covers the read_dir handle, already gone
        match nix::unistd::close(fd) {
            Ok(()) | Err(nix::errno::Errno::EBADF) => {}
            Err(e) => {
                return Err(UpletError::Filesystem(format!("Failed to close fd {}: {}", fd, e)))
            }
        }
    }
    Ok(())
}

/// Child receives SIGKILL when its parent dies
pub fn setup_parent_death_signal() -> Result<()> {
    use nix::sys::prctl;
    use nix::sys::signal::Signal;

    prctl::set_pdeathsig(Signal::SIGKILL).map_err(|e| {
        UpletError::Process(format!("Failed to set parent death signal: {}", e))
    })?;
    Ok(())
}

// Type-state pre-exec chain:
//
// FreshChild -> NamespacesReady -> MountsPrivate -> RootPrepared ->
// CredsDropped -> PrivsLocked -> ExecReady
//
// Each step consumes the prior state. Only Sandbox<ExecReady> can exec.

pub struct FreshChild;
pub struct NamespacesReady;
pub struct MountsPrivate;
pub struct RootPrepared;
pub struct CredsDropped;
pub struct PrivsLocked;
pub struct ExecReady;

/// Payload process with its pre-exec state tracked in the type
pub struct Sandbox<S> {
    pub run_id: String,
    pub strict_mode: bool,
    pub mount_namespace_enabled: bool,
    /// Root transition was a real chroot
    pub jailed: bool,
    _state: PhantomData<S>,
}

impl<S> Sandbox<S> {
    fn advance<T>(self) -> Sandbox<T> {
        Sandbox {
            run_id: self.run_id,
            strict_mode: self.strict_mode,
            mount_namespace_enabled: self.mount_namespace_enabled,
            jailed: self.jailed,
            _state: PhantomData,
        }
    }
}

impl Sandbox<FreshChild> {
    pub fn new(run_id: String, strict_mode: bool) -> Self {
        Self {
            run_id,
            strict_mode,
            mount_namespace_enabled: false,
            jailed: false,
            _state: PhantomData,
        }
    }

    pub fn setup_namespaces(
        self,
        enable_mount: bool,
        enable_network: bool,
    ) -> Result<Sandbox<NamespacesReady>> {
        if unsafe { libc::setsid() } < 0 {
            let err = std::io::Error::last_os_error();
            if self.strict_mode {
                return Err(UpletError::Process(format!("setsid failed: {}", err)));
            }
            log::warn!("setsid failed in permissive mode: {}", err);
        }

        setup_parent_death_signal()?;

        // pid namespace is owned by the proxy, which is already PID 1
        let mut mount_namespace_enabled = enable_mount;
        if let Err(e) = NamespaceIsolation::for_payload(enable_mount, enable_network).apply() {
            if self.strict_mode {
                return Err(e);
            }
            log::warn!("Namespace isolation failed in permissive mode: {}", e);
            mount_namespace_enabled = false;
        }

        let mut next: Sandbox<NamespacesReady> = self.advance();
        next.mount_namespace_enabled = mount_namespace_enabled;
        Ok(next)
    }
}

impl Sandbox<NamespacesReady> {
    pub fn harden_mount_propagation(mut self) -> Result<Sandbox<MountsPrivate>> {
        if self.mount_namespace_enabled {
            if let Err(e) = crate::kernel::namespace::harden_mount_propagation() {
                if self.strict_mode {
                    return Err(e);
                }
                // mounts could leak to the host; fall back to copying
                log::warn!("Mount propagation hardening failed (permissive mode): {}", e);
                self.mount_namespace_enabled = false;
            }
        }
        Ok(self.advance())
    }
}

impl Sandbox<MountsPrivate> {
    /// Populate the root and enter it. The run is jailed only when the mount
    /// namespace is up, every system directory was bound and we are root.
    pub fn prepare_root(mut self, profile: &ExecutionProfile) -> Result<Sandbox<RootPrepared>> {
        let root = SandboxRoot::new(&profile.root_dir, self.strict_mode);
        let modes =
            root.setup_directory_bindings(&profile.directory_bindings, self.mount_namespace_enabled)?;

        let running_as_root = nix::unistd::geteuid().is_root();
        let mut jail = false;
        if self.mount_namespace_enabled && running_as_root && !profile.system_mounts.is_empty() {
            jail = root.mount_system_dirs(&profile.system_mounts)?;
            if jail {
                root.setup_hardened_mounts()?;
            }
        }

        if self.strict_mode && !jail {
            return Err(UpletError::Filesystem(
                "strict mode requires a chroot jail".to_string(),
            ));
        }

        root.enter(jail)?;
        self.jailed = jail;
        log::debug!(
            "Run {} root ready (jailed={}, copied bindings={})",
            self.run_id,
            jail,
            modes.iter().filter(|m| **m == BindingMode::Copied).count()
        );
        Ok(self.advance())
    }
}

impl Sandbox<RootPrepared> {
    /// rlimits, umask, FD closure and environment; `keep_fd` survives the closure
    pub fn apply_runtime_hygiene(
        self,
        profile: &ExecutionProfile,
        keep_fd: Option<RawFd>,
    ) -> Result<Sandbox<RootPrepared>> {
        if let Some(memory_limit) = profile.memory_limit {
            apply_rlimit_value("RLIMIT_AS", libc::RLIMIT_AS, memory_limit, self.strict_mode)?;
        }
        if let Some(file_size_limit) = profile.file_size_limit {
            apply_rlimit_value("RLIMIT_FSIZE", libc::RLIMIT_FSIZE, file_size_limit, self.strict_mode)?;
        }
        apply_rlimit_value("RLIMIT_CORE", libc::RLIMIT_CORE, 0, self.strict_mode)?;
        if let Some(process_limit) = profile.process_limit {
            apply_rlimit_value("RLIMIT_NPROC", libc::RLIMIT_NPROC, process_limit as u64, self.strict_mode)?;
        }
        if let Some(stack_limit) = profile.stack_limit {
            apply_rlimit_value("RLIMIT_STACK", libc::RLIMIT_STACK, stack_limit, self.strict_mode)?;
        }
        if let Some(fd_limit) = profile.fd_limit {
            apply_rlimit_value("RLIMIT_NOFILE", libc::RLIMIT_NOFILE, fd_limit, self.strict_mode)?;
        }

        nix::sys::stat::umask(nix::sys::stat::Mode::from_bits_truncate(0o022));

        if let Err(e) = close_inherited_fds(keep_fd) {
            if self.strict_mode {
                return Err(e);
            }
            log::warn!("FD closure incomplete (permissive mode): {}", e);
        }

        apply_exec_environment(&profile.environment, self.strict_mode)?;
        Ok(self)
    }

    pub fn drop_credentials(self, uid: Option<u32>, gid: Option<u32>) -> Result<Sandbox<CredsDropped>> {
        match (uid, gid) {
            (Some(uid), Some(gid)) => transition_to_unprivileged(uid, gid, self.strict_mode)?,
            (Some(uid), None) => transition_to_unprivileged(uid, uid, self.strict_mode)?,
            _ if self.strict_mode => {
                return Err(UpletError::Privilege(
                    "strict mode requires a payload uid".to_string(),
                ));
            }
            _ => log::debug!("No payload uid configured, keeping current credentials"),
        }
        Ok(self.advance())
    }
}

impl Sandbox<CredsDropped> {
    pub fn lock_privileges(self) -> Result<Sandbox<PrivsLocked>> {
        set_no_new_privs()?;
        if !check_no_new_privs()? {
            return Err(UpletError::Privilege(
                "PR_SET_NO_NEW_PRIVS verification failed".to_string(),
            ));
        }
        Ok(self.advance())
    }
}

impl Sandbox<PrivsLocked> {
    pub fn ready_for_exec(self) -> Sandbox<ExecReady> {
        self.advance()
    }
}

impl Sandbox<ExecReady> {
    /// Only returns on failure
    pub fn exec_payload(self, command: &[String]) -> Result<()> {
        if command.is_empty() {
            return Err(UpletError::Config("Empty command for exec".to_string()));
        }

        let cargv = command
            .iter()
            .map(|arg| {
                CString::new(arg.as_str())
                    .map_err(|_| UpletError::Config("command contains NUL byte".to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        nix::unistd::execvp(cargv[0].as_c_str(), &cargv)
            .map_err(|e| UpletError::Process(format!("execvp {} failed: {}", command[0], e)))?;
        Ok(())
    }
}
