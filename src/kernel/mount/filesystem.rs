/// Sandbox root preparation: input bindings, system mounts and root transition
use crate::config::types::{DirectoryBinding, DirectoryPermissions, Result, UpletError};
use nix::mount::{mount, MsFlags};
use std::fs;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// How an input directory ended up inside the root
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingMode {
    Mounted,
    Copied,
}

/// Filesystem controller for one sandbox root
#[derive(Clone, Debug)]
pub struct SandboxRoot {
    root: PathBuf,
    strict_mode: bool,
}

impl SandboxRoot {
    pub fn new(root: impl Into<PathBuf>, strict_mode: bool) -> Self {
        Self {
            root: root.into(),
            strict_mode,
        }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Host path of a sandbox-relative target
    pub fn resolve(&self, target: &Path) -> PathBuf {
        self.root
            .join(target.strip_prefix("/").unwrap_or(target))
    }

    /// Expose every binding inside the root. Without a mount namespace the
    /// contents are copied; with one, a failed bind falls back to copying
    /// unless strict mode is on.
    pub fn setup_directory_bindings(
        &self,
        bindings: &[DirectoryBinding],
        can_mount: bool,
    ) -> Result<Vec<BindingMode>> {
        bindings
            .iter()
            .map(|binding| {
                if can_mount {
                    self.setup_single_binding(binding)
                } else {
                    self.copy_binding(binding).map(|_| BindingMode::Copied)
                }
            })
            .collect()
    }

    fn setup_single_binding(&self, binding: &DirectoryBinding) -> Result<BindingMode> {
        let target_path = self.resolve(&binding.target);
        fs::create_dir_all(&target_path).map_err(|e| {
            UpletError::Filesystem(format!(
                "Failed to create binding target {}: {}",
                target_path.display(),
                e
            ))
        })?;

        match bind_mount(&binding.source, &target_path, &binding.permissions) {
            Ok(()) => {
                log::debug!(
                    "Bound {} to {} ({:?})",
                    binding.source.display(),
                    target_path.display(),
                    binding.permissions
                );
                Ok(BindingMode::Mounted)
            }
            Err(e) if self.strict_mode => Err(e),
            Err(e) => {
                log::warn!("{} (falling back to file copy)", e);
                self.copy_binding(binding)?;
                Ok(BindingMode::Copied)
            }
        }
    }

    /// Copy a binding's source tree into its target
    pub fn copy_binding(&self, binding: &DirectoryBinding) -> Result<()> {
        let target_path = self.resolve(&binding.target);
        copy_directory_contents(&binding.source, &target_path)?;
        log::debug!(
            "Copied {} to {}",
            binding.source.display(),
            target_path.display()
        );
        Ok(())
    }

    /// Bind host system directories read-only so the entrypoint can run after
    /// chroot. Missing host directories are skipped. Returns false when any
    /// existing directory could not be bound.
    pub fn mount_system_dirs(&self, dirs: &[PathBuf]) -> Result<bool> {
        let mut complete = true;
        for dir in dirs {
            if !dir.is_dir() {
                log::debug!("Skipping absent system directory {}", dir.display());
                continue;
            }
            let target = self.resolve(dir);
            fs::create_dir_all(&target)?;
            if let Err(e) = bind_mount(dir, &target, &DirectoryPermissions::ReadOnly) {
                if self.strict_mode {
                    return Err(e);
                }
                log::warn!("{}", e);
                complete = false;
            }
        }
        Ok(complete)
    }

    /// tmpfs /dev with minimal device nodes, plus procfs
    pub fn setup_hardened_mounts(&self) -> Result<()> {
        let dev_path = self.root.join("dev");
        let proc_path = self.root.join("proc");
        for dir in [&dev_path, &proc_path] {
            fs::create_dir_all(dir)?;
            let mut perms = fs::metadata(dir)?.permissions();
            perms.set_mode(0o755);
            fs::set_permissions(dir, perms)?;
        }

        self.mount_hardened_devfs(&dev_path)?;
        self.mount_hardened_procfs(&proc_path)?;
        Ok(())
    }

    fn mount_hardened_devfs(&self, dev_path: &Path) -> Result<()> {
        let result = mount(
            Some("tmpfs"),
            dev_path,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NOATIME,
            Some("size=64k,mode=755"),
        );

        if let Err(errno) = result {
            let msg = format!("Failed to mount tmpfs on /dev: {}", errno);
            if self.strict_mode {
                return Err(UpletError::Filesystem(msg));
            }
            log::warn!("{}", msg);
            return Ok(());
        }

        create_minimal_devices(dev_path);
        Ok(())
    }

    fn mount_hardened_procfs(&self, proc_path: &Path) -> Result<()> {
        let result = mount(
            Some("proc"),
            proc_path,
            Some("proc"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
            None::<&str>,
        );

        if let Err(errno) = result {
            let msg = format!("Failed to mount procfs: {}", errno);
            if self.strict_mode {
                return Err(UpletError::Filesystem(msg));
            }
            log::warn!("{}", msg);
        }
        Ok(())
    }

    /// Enter the root: chroot when jailed, otherwise chdir into it. Either way
    /// relative paths in the command resolve against the root.
    pub fn enter(&self, jail: bool) -> Result<()> {
        if jail {
            nix::unistd::chroot(&self.root).map_err(|e| {
                UpletError::Filesystem(format!(
                    "chroot({}) failed: {}",
                    self.root.display(),
                    e
                ))
            })?;
            std::env::set_current_dir("/").map_err(|e| {
                UpletError::Filesystem(format!("Failed to change to chroot root: {}", e))
            })?;
        } else {
            std::env::set_current_dir(&self.root).map_err(|e| {
                UpletError::Filesystem(format!(
                    "Failed to chdir to {}: {}",
                    self.root.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }
}

/// Bind `source` onto `target`, then remount with the binding's restrictions.
/// Read-only bind mounts only take effect on the remount.
fn bind_mount(source: &Path, target: &Path, permissions: &DirectoryPermissions) -> Result<()> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| {
        UpletError::Filesystem(format!(
            "Failed to bind mount {} to {}: {}",
            source.display(),
            target.display(),
            e
        ))
    })?;

    let mut flags = MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
    match permissions {
        DirectoryPermissions::ReadOnly => flags |= MsFlags::MS_RDONLY,
        DirectoryPermissions::NoExec => flags |= MsFlags::MS_RDONLY | MsFlags::MS_NOEXEC,
    }

    mount(None::<&str>, target, None::<&str>, flags, None::<&str>).map_err(|e| {
        UpletError::Filesystem(format!(
            "Failed to remount {} with {:?}: {}",
            target.display(),
            permissions,
            e
        ))
    })
}

fn create_minimal_devices(dev_path: &Path) {
    use nix::sys::stat::{makedev, mknod, Mode, SFlag};

    let devices = [("null", 1, 3), ("zero", 1, 5), ("random", 1, 8), ("urandom", 1, 9)];
    let mode = Mode::from_bits_truncate(0o666);

    for (name, major, minor) in devices {
        let device_path = dev_path.join(name);
        if let Err(e) = mknod(&device_path, SFlag::S_IFCHR, mode, makedev(major, minor)) {
            log::warn!("Failed to create device {}: {}", name, e);
        }
    }
}

/// Recursive copy used when bind mounting is unavailable
pub fn copy_directory_contents(source: &Path, target: &Path) -> Result<()> {
    if !source.is_dir() {
        return Err(UpletError::Filesystem(format!(
            "Source directory does not exist: {}",
            source.display()
        )));
    }

    fs::create_dir_all(target).map_err(|e| {
        UpletError::Filesystem(format!(
            "Failed to create target directory {}: {}",
            target.display(),
            e
        ))
    })?;

    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let source_path = entry.path();
        let target_path = target.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            copy_directory_contents(&source_path, &target_path)?;
        } else if file_type.is_file() {
            fs::copy(&source_path, &target_path)?;
        } else {
            log::debug!("Skipping non-regular entry {}", source_path.display());
        }
    }

    Ok(())
}
