//! UID/GID transition and privilege lockdown for the payload.
//!
//! setresgid runs before setresuid; once the UID is gone the GID can no
//! longer be changed.

use crate::config::types::{Result, UpletError};
use nix::unistd::{getegid, geteuid, getgid, getuid, setgroups, setresgid, setresuid, Gid, Uid};

/// Clear groups, set GID, set UID, then verify.
pub fn transition_to_unprivileged(uid: u32, gid: u32, strict_mode: bool) -> Result<()> {
    if uid == 0 || gid == 0 {
        return permissive_or_fail(
            strict_mode,
            format!("refusing to run payload as uid={} gid={}", uid, gid),
        );
    }

    if let Err(e) = setgroups(&[]) {
        permissive_or_fail(
            strict_mode,
            format!("Failed to clear supplementary groups: {}", e),
        )?;
    }

    let gid = Gid::from_raw(gid);
    if let Err(e) = setresgid(gid, gid, gid) {
        permissive_or_fail(strict_mode, format!("Failed to setresgid({}): {}", gid, e))?;
    }

    let uid = Uid::from_raw(uid);
    if let Err(e) = setresuid(uid, uid, uid) {
        permissive_or_fail(strict_mode, format!("Failed to setresuid({}): {}", uid, e))?;
    }

    if getuid() != uid || geteuid() != uid {
        permissive_or_fail(
            strict_mode,
            format!(
                "UID verification failed: expected {}, got real={}, effective={}",
                uid,
                getuid(),
                geteuid()
            ),
        )?;
    }
    if getgid() != gid || getegid() != gid {
        permissive_or_fail(
            strict_mode,
            format!(
                "GID verification failed: expected {}, got real={}, effective={}",
                gid,
                getgid(),
                getegid()
            ),
        )?;
    }

    log::debug!("Transitioned to UID={}, GID={}", uid, gid);
    Ok(())
}

fn permissive_or_fail(strict_mode: bool, msg: String) -> Result<()> {
    if strict_mode {
        Err(UpletError::Privilege(msg))
    } else {
        log::warn!("{} (permissive mode)", msg);
        Ok(())
    }
}

/// `prctl(PR_SET_NO_NEW_PRIVS, 1)`; idempotent.
pub fn set_no_new_privs() -> Result<()> {
    let result = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if result != 0 {
        return Err(UpletError::Privilege(format!(
            "Failed to set PR_SET_NO_NEW_PRIVS: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

pub fn check_no_new_privs() -> Result<bool> {
    let result = unsafe { libc::prctl(libc::PR_GET_NO_NEW_PRIVS, 0, 0, 0, 0) };
    if result < 0 {
        return Err(UpletError::Privilege(
            "Failed to read PR_GET_NO_NEW_PRIVS".to_string(),
        ));
    }
    Ok(result == 1)
}
