/// Run-scoped workspaces
///
/// Every sandbox run gets its own directory under the workspace root, so
/// concurrent runs never share artifacts. The directory is removed on drop.
use crate::config::types::{Result, UpletError};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Scratch directory of one run
///
/// ```text
/// <base>/<run-id>/
///     inputs/<name>/     staged blobs, bound into the root
///     root/              sandbox root
///     root/output/       the only directory the payload writes
/// ```
#[derive(Debug)]
pub struct Workspace {
    run_id: String,
    run_dir: PathBuf,
}

impl Workspace {
    pub fn new(base_dir: &Path) -> Result<Self> {
        let run_id = Uuid::new_v4().to_string();
        let run_dir = base_dir.join(&run_id);

        for dir in [run_dir.join("inputs"), run_dir.join("root").join("output")] {
            fs::create_dir_all(&dir).map_err(|e| {
                UpletError::Filesystem(format!(
                    "Failed to create workspace directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        Ok(Self { run_id, run_dir })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn root_dir(&self) -> PathBuf {
        self.run_dir.join("root")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root_dir().join("output")
    }

    /// Create (or reuse) the staging directory for one input
    pub fn input_dir(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name == ".." {
            return Err(UpletError::Validation(format!(
                "invalid workspace input name: {:?}",
                name
            )));
        }
        let dir = self.run_dir.join("inputs").join(name);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Hand the output directory to the payload user
    pub fn chown_output(&self, uid: u32, gid: u32) -> Result<()> {
        nix::unistd::chown(
            &self.output_dir(),
            Some(nix::unistd::Uid::from_raw(uid)),
            Some(nix::unistd::Gid::from_raw(gid)),
        )
        .map_err(|e| {
            UpletError::Privilege(format!(
                "Failed to chown {} to {}:{}: {}",
                self.output_dir().display(),
                uid,
                gid,
                e
            ))
        })
    }

    /// Cleanup workspace (idempotent)
    pub fn cleanup(&self) -> Result<()> {
        match fs::remove_dir_all(&self.run_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(UpletError::Filesystem(format!(
                "Failed to remove run directory {}: {}",
                self.run_dir.display(),
                e
            ))),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            log::warn!("{}", e);
        }
    }
}

/// Creates workspaces under one base directory
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    base_dir: PathBuf,
}

impl WorkspaceManager {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_dir).map_err(|e| {
            UpletError::Filesystem(format!(
                "Failed to create workspace base directory {}: {}",
                base_dir.display(),
                e
            ))
        })?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn create_workspace(&self) -> Result<Workspace> {
        Workspace::new(&self.base_dir)
    }
}
