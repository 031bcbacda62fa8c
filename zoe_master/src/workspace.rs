use std::path::{Path, PathBuf};

use zoe_definitions::state::User;
use zoe_definitions::structs::VolumeBind;
use zoe_definitions::Config;

/// Where user workspaces appear inside service containers
pub const WORKSPACE_MOUNT_POINT: &str = "/mnt/workspace";

/// Filesystem-backed user workspaces
///
/// Workspaces live on a shared filesystem mounted on every node, so injecting
/// one into a container is a plain host-path bind.
pub struct FsWorkspace {
    base_path: PathBuf,
}

impl FsWorkspace {
    pub fn new(config: &Config) -> FsWorkspace {
        FsWorkspace {
            base_path: PathBuf::from(config.workspace_path()),
        }
    }

    pub fn exists(&self, username: &str) -> bool {
        self.get_path(username).exists()
    }

    pub fn get_path(&self, username: &str) -> PathBuf {
        self.base_path.join(username)
    }

    /// The workspace bind for a user, if their workspace directory exists
    pub fn get(&self, user: &User) -> Option<VolumeBind> {
        let path = self.get_path(&user.username);
        if !path.exists() {
            warn!("Workspace for user {} does not exist", user.username);
            return None;
        }
        check_owner(&path, user);
        Some(VolumeBind {
            host_path: path.to_string_lossy().to_string(),
            mount_point: WORKSPACE_MOUNT_POINT.to_string(),
            read_only: false,
        })
    }
}

#[cfg(unix)]
fn check_owner(path: &Path, user: &User) {
    use std::os::unix::fs::MetadataExt;
    if let Ok(meta) = path.metadata() {
        if meta.uid() != user.fs_uid as u32 {
            warn!(
                "The fs_uid in the database does not match the workspace owner for user {}",
                user.username
            );
        }
    }
}

#[cfg(not(unix))]
fn check_owner(_path: &Path, _user: &User) {}
