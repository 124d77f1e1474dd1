use crate::config::types::{Result, UpletError};
use crate::core::types::{ProxyStatus, SandboxLaunchRequest};
use crate::exec::preexec::{FreshChild, Sandbox};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, dup2, fork, pipe, pipe2, setpgid, ForkResult, Pid};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd};
use std::os::unix::io::RawFd;
use std::thread;
use std::time::Instant;

fn to_process_error(prefix: &str, err: impl std::fmt::Display) -> UpletError {
    UpletError::Process(format!("{prefix}: {err}"))
}

fn read_json_from_fd<T: DeserializeOwned>(fd: RawFd) -> Result<T> {
    let mut file = unsafe { File::from_raw_fd(fd) };
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    serde_json::from_slice(&data)
        .map_err(|e| UpletError::Process(format!("failed to decode json on fd {fd}: {e}")))
}

fn write_json_to_fd<T: Serialize>(fd: RawFd, value: &T) -> Result<()> {
    let mut file = unsafe { File::from_raw_fd(fd) };
    let payload = serde_json::to_vec(value)
        .map_err(|e| UpletError::Process(format!("failed to encode json for fd {fd}: {e}")))?;
    file.write_all(&payload)?;
    file.flush()?;
    Ok(())
}

pub fn write_request_to_fd(fd: RawFd, req: &SandboxLaunchRequest) -> Result<()> {
    write_json_to_fd(fd, req)
}

pub fn read_proxy_status_from_fd(fd: RawFd) -> Result<ProxyStatus> {
    read_json_from_fd(fd)
}

/// Drain `reader` on a thread, keeping at most `limit` bytes. The stream is
/// read to EOF either way so the writer never blocks on a full pipe.
pub fn read_stream_async<R>(mut reader: R, limit: usize) -> thread::JoinHandle<(Vec<u8>, bool)>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        let mut truncated = false;

        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let remaining = limit.saturating_sub(out.len());
                    if n > remaining {
                        truncated = true;
                    }
                    out.extend_from_slice(&buf[..n.min(remaining)]);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }

        (out, truncated)
    })
}

fn exec_payload_with_typestate(req: &SandboxLaunchRequest, setup_fd: RawFd) -> Result<()> {
    let profile = &req.profile;
    Sandbox::<FreshChild>::new(req.run_id.clone(), profile.strict_mode)
        .setup_namespaces(profile.enable_mount_namespace, profile.enable_network_namespace)?
        .harden_mount_propagation()?
        .prepare_root(profile)?
        .apply_runtime_hygiene(profile, Some(setup_fd))?
        .drop_credentials(profile.uid, profile.gid)?
        .lock_privileges()?
        .ready_for_exec()
        .exec_payload(&profile.command)
}

fn wait_for_payload_and_reap(payload_pid: Pid) -> Result<(Option<i32>, Option<i32>, u32)> {
    let mut payload_exit: Option<i32> = None;
    let mut payload_signal: Option<i32> = None;
    let mut reaped_descendants: u32 = 0;

    loop {
        match waitpid(payload_pid, None) {
            Ok(WaitStatus::Exited(_, code)) => {
                payload_exit = Some(code);
                break;
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                payload_signal = Some(sig as i32);
                break;
            }
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(to_process_error("waitpid(payload)", e)),
        }
    }

    // as PID 1 of the sandbox we inherit orphaned descendants
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(_) => reaped_descendants += 1,
            Err(Errno::ECHILD) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(to_process_error("waitpid(reap)", e)),
        }
    }

    Ok((payload_exit, payload_signal, reaped_descendants))
}

fn redirect_child_stdio(stdout_write: RawFd, stderr_write: RawFd) -> Result<()> {
    let devnull = File::open("/dev/null")?;
    dup2(devnull.as_raw_fd(), libc::STDIN_FILENO).map_err(|e| to_process_error("dup2(stdin)", e))?;
    dup2(stdout_write, libc::STDOUT_FILENO).map_err(|e| to_process_error("dup2(stdout)", e))?;
    dup2(stderr_write, libc::STDERR_FILENO).map_err(|e| to_process_error("dup2(stderr)", e))?;
    let _ = close(stdout_write);
    let _ = close(stderr_write);
    Ok(())
}

fn run_proxy(req: SandboxLaunchRequest) -> Result<ProxyStatus> {
    let start = Instant::now();

    let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));
    crate::exec::preexec::setup_parent_death_signal()?;

    let (stdout_read, stdout_write) = pipe().map_err(|e| to_process_error("pipe(stdout)", e))?;
    let (stderr_read, stderr_write) = pipe().map_err(|e| to_process_error("pipe(stderr)", e))?;
    // closed by a successful exec, so any bytes on it are a setup failure
    let (setup_read, setup_write) =
        pipe2(OFlag::O_CLOEXEC).map_err(|e| to_process_error("pipe(setup)", e))?;

    let payload_pid = match unsafe { fork() }.map_err(|e| to_process_error("fork(payload)", e))? {
        ForkResult::Child => {
            let _ = close(stdout_read);
            let _ = close(stderr_read);
            let _ = close(setup_read);

            let outcome = redirect_child_stdio(stdout_write, stderr_write)
                .and_then(|_| exec_payload_with_typestate(&req, setup_write));
            if let Err(err) = outcome {
                let mut setup = unsafe { File::from_raw_fd(setup_write) };
                let _ = write!(setup, "{err}");
            }
            std::process::exit(127);
        }
        ForkResult::Parent { child } => child,
    };

    let _ = close(stdout_write);
    let _ = close(stderr_write);
    let _ = close(setup_write);

    let limit = req.profile.output_limit;
    let stdout_handle = read_stream_async(unsafe { File::from_raw_fd(stdout_read) }, limit);
    let stderr_handle = read_stream_async(unsafe { File::from_raw_fd(stderr_read) }, limit);

    let mut setup_error = String::new();
    let mut setup = unsafe { File::from_raw_fd(setup_read) };
    let _ = setup.read_to_string(&mut setup_error);

    let (exit_code, term_signal, reaped_descendants) = wait_for_payload_and_reap(payload_pid)?;
    let (stdout_bytes, stdout_truncated) = stdout_handle.join().unwrap_or_default();
    let (stderr_bytes, stderr_truncated) = stderr_handle.join().unwrap_or_default();

    Ok(ProxyStatus {
        payload_pid: Some(payload_pid.as_raw()),
        exit_code,
        term_signal,
        timed_out: false,
        wall_time_ms: start.elapsed().as_millis() as u64,
        stdout: String::from_utf8_lossy(&stdout_bytes).into_owned(),
        stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
        output_truncated: stdout_truncated || stderr_truncated,
        setup_error: (!setup_error.is_empty()).then_some(setup_error),
        internal_error: None,
        reaped_descendants,
    })
}

/// Child entrypoint executed by the clone()-created proxy process.
pub fn run_proxy_main_from_fds(launch_fd: RawFd, status_fd: RawFd) -> ! {
    let outcome = match read_json_from_fd::<SandboxLaunchRequest>(launch_fd).and_then(run_proxy) {
        Ok(status) => status,
        Err(err) => ProxyStatus {
            internal_error: Some(err.to_string()),
            ..ProxyStatus::default()
        },
    };

    let _ = write_json_to_fd(status_fd, &outcome);
    let code = outcome
        .exit_code
        .unwrap_or(if outcome.internal_error.is_some() { 126 } else { 0 });
    std::process::exit(code);
}
