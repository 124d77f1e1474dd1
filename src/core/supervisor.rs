use crate::config::types::{Result, UpletError};
use crate::core::proxy::{
    read_proxy_status_from_fd, read_stream_async, run_proxy_main_from_fds, write_request_to_fd,
};
use crate::core::types::{
    KillReport, LaunchEvidence, ProxyStatus, SandboxLaunchOutcome, SandboxLaunchRequest,
};
use crate::kernel::mount::SandboxRoot;
use nix::sched::{clone, CloneFlags};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, pipe, Pid};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

fn to_process_error(prefix: &str, err: impl std::fmt::Display) -> UpletError {
    UpletError::Process(format!("{prefix}: {err}"))
}

fn build_configured_controls(req: &SandboxLaunchRequest) -> Vec<String> {
    let profile = &req.profile;
    let mut controls = Vec::new();
    if profile.enable_pid_namespace {
        controls.push("pid_namespace".to_string());
    }
    if profile.enable_mount_namespace {
        controls.push("mount_namespace".to_string());
    }
    if profile.enable_network_namespace {
        controls.push("network_namespace".to_string());
    }
    if profile.memory_limit.is_some() {
        controls.push("memory_limit".to_string());
    }
    if profile.process_limit.is_some() {
        controls.push("process_limit".to_string());
    }
    if profile.uid.is_some() {
        controls.push("credential_drop".to_string());
    }
    controls.push("no_new_privileges".to_string());
    controls
}

fn build_launch_evidence(
    req: &SandboxLaunchRequest,
    running_as_root: bool,
    degraded: bool,
    proxy_status: &ProxyStatus,
) -> LaunchEvidence {
    let configured = build_configured_controls(req);
    // Every control is applied in the payload's pre-exec chain; none of them
    // hold when that chain failed or never ran.
    let setup_succeeded = !degraded
        && proxy_status.setup_error.is_none()
        && proxy_status.internal_error.is_none();

    let (applied, missing): (Vec<String>, Vec<String>) = configured
        .iter()
        .cloned()
        .partition(|_| setup_succeeded);

    let mode_decision_reason = if degraded {
        format!(
            "Degraded launch without isolation; missing controls: {}",
            missing.join(", ")
        )
    } else if missing.is_empty() {
        "All configured controls applied".to_string()
    } else {
        format!("Payload setup failed; missing controls: {}", missing.join(", "))
    };

    LaunchEvidence {
        strict_requested: req.profile.strict_mode,
        running_as_root,
        degraded,
        configured_controls: configured,
        applied_controls: applied,
        missing_controls: missing,
        mode_decision_reason,
    }
}

/// SIGTERM the process group, wait `grace`, then SIGKILL it.
pub fn terminate_proxy_group(proxy_pid: Pid, grace: Duration) -> KillReport {
    let mut report = KillReport::default();
    let start = Instant::now();

    let term_rc = unsafe { libc::kill(-proxy_pid.as_raw(), libc::SIGTERM) };
    if term_rc != 0 {
        let _ = unsafe { libc::kill(proxy_pid.as_raw(), libc::SIGTERM) };
        report.notes.push(format!(
            "group SIGTERM fallback used: {}",
            std::io::Error::last_os_error()
        ));
    }
    report.term_sent = true;

    std::thread::sleep(grace);

    let kill_rc = unsafe { libc::kill(-proxy_pid.as_raw(), libc::SIGKILL) };
    if kill_rc != 0 {
        let _ = unsafe { libc::kill(proxy_pid.as_raw(), libc::SIGKILL) };
        report.notes.push(format!(
            "group SIGKILL fallback used: {}",
            std::io::Error::last_os_error()
        ));
    }
    report.kill_sent = true;

    report.waited_ms = start.elapsed().as_millis() as u64;
    report
}

/// Deadline and cancellation watch shared by both launch paths
struct Watchdog<'a> {
    started: Instant,
    deadline: Duration,
    cancel: &'a AtomicBool,
    grace: Duration,
    timed_out: bool,
    canceled: bool,
    kill_report: Option<KillReport>,
}

impl<'a> Watchdog<'a> {
    fn new(deadline: Duration, cancel: &'a AtomicBool, grace: Duration) -> Self {
        Self {
            started: Instant::now(),
            deadline,
            cancel,
            grace,
            timed_out: false,
            canceled: false,
            kill_report: None,
        }
    }

    /// Tear the group down once, on deadline expiry or cancellation
    fn check(&mut self, pgid: Pid) {
        if self.kill_report.is_some() {
            return;
        }
        let expired = self.started.elapsed() > self.deadline;
        let canceled = self.cancel.load(Ordering::SeqCst);
        if expired || canceled {
            self.timed_out = true;
            self.canceled = canceled && !expired;
            log::warn!(
                "Tearing down process group {} ({})",
                pgid,
                if self.canceled { "canceled" } else { "deadline exceeded" }
            );
            self.kill_report = Some(terminate_proxy_group(pgid, self.grace));
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Launch a request using the supervisor -> proxy -> payload model and wait
/// for it, tearing everything down on `deadline` or when `cancel` is set.
pub fn launch_with_supervisor(
    req: SandboxLaunchRequest,
    deadline: Duration,
    cancel: &AtomicBool,
) -> Result<SandboxLaunchOutcome> {
    if req.profile.command.is_empty() {
        return Err(UpletError::Config("empty command".to_string()));
    }

    if req.profile.strict_mode && !nix::unistd::geteuid().is_root() {
        return Err(UpletError::Privilege(
            "strict sandbox launch requires root".to_string(),
        ));
    }

    let (launch_read, launch_write) = pipe().map_err(|e| to_process_error("pipe(launch)", e))?;
    let (status_read, status_write) = pipe().map_err(|e| to_process_error("pipe(status)", e))?;

    // CLONE_NEWPID makes the proxy PID 1 of the sandbox
    let mut clone_flags = CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWIPC;
    if req.profile.enable_mount_namespace {
        clone_flags |= CloneFlags::CLONE_NEWNS;
    }
    if req.profile.enable_network_namespace {
        clone_flags |= CloneFlags::CLONE_NEWNET;
    }

    let mut child_stack = vec![0u8; 2 * 1024 * 1024];
    let child_cb: Box<dyn FnMut() -> isize> = Box::new(move || {
        // the parent's pipe ends must close here or read_to_end never sees EOF
        let _ = close(launch_write);
        let _ = close(status_read);
        run_proxy_main_from_fds(launch_read, status_write)
    });

    let clone_result =
        unsafe { clone(child_cb, &mut child_stack, clone_flags, Some(libc::SIGCHLD)) };

    let proxy_pid = match clone_result {
        Ok(pid) => pid,
        Err(errno) => {
            for fd in [launch_read, launch_write, status_read, status_write] {
                let _ = close(fd);
            }
            return match errno {
                nix::errno::Errno::EPERM if !req.profile.strict_mode && req.profile.allow_degraded => {
                    launch_degraded(req, deadline, cancel)
                }
                nix::errno::Errno::EPERM => Err(UpletError::Privilege(
                    "Root privileges required for namespace isolation; \
                     allow_degraded permits unisolated development runs"
                        .to_string(),
                )),
                e => Err(to_process_error("clone(proxy)", e)),
            };
        }
    };

    let _ = close(launch_read);
    let _ = close(status_write);

    if let Err(e) = write_request_to_fd(launch_write, &req) {
        terminate_proxy_group(proxy_pid, Duration::ZERO);
        let _ = waitpid(proxy_pid, None);
        let _ = close(status_read);
        return Err(e);
    }

    let grace = Duration::from_millis(req.profile.kill_grace_ms);
    let mut watchdog = Watchdog::new(deadline, cancel, grace);
    let mut proxy_exit_code = None;
    let mut proxy_signal = None;

    loop {
        match waitpid(proxy_pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                watchdog.check(proxy_pid);
                std::thread::sleep(POLL_INTERVAL);
            }
            Ok(WaitStatus::Exited(_, code)) => {
                proxy_exit_code = Some(code);
                break;
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                proxy_signal = Some(sig as i32);
                break;
            }
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(to_process_error("waitpid(proxy)", e)),
        }
    }

    let mut status = read_proxy_status_from_fd(status_read).unwrap_or_else(|e| ProxyStatus {
        exit_code: proxy_exit_code,
        term_signal: proxy_signal,
        wall_time_ms: watchdog.elapsed_ms(),
        // a killed proxy never reports; that is the timeout, not a fault
        internal_error: (!watchdog.timed_out).then(|| e.to_string()),
        ..ProxyStatus::default()
    });
    status.timed_out = watchdog.timed_out;

    let running_as_root = nix::unistd::geteuid().is_root();
    let evidence = build_launch_evidence(&req, running_as_root, false, &status);

    Ok(SandboxLaunchOutcome {
        proxy_host_pid: proxy_pid.as_raw(),
        payload_host_pid: status.payload_pid,
        timed_out: watchdog.timed_out,
        canceled: watchdog.canceled,
        status,
        evidence,
        kill_report: watchdog.kill_report,
    })
}

/// Degraded launch path for permissive non-root execution.
/// Uses Command::spawn instead of clone(); no namespace isolation.
fn launch_degraded(
    req: SandboxLaunchRequest,
    deadline: Duration,
    cancel: &AtomicBool,
) -> Result<SandboxLaunchOutcome> {
    use std::os::unix::process::{CommandExt, ExitStatusExt};
    use std::process::{Command, Stdio};

    let profile = &req.profile;
    log::warn!(
        "Falling back to degraded launch (no namespace isolation) for run {}",
        req.run_id
    );

    SandboxRoot::new(&profile.root_dir, false)
        .setup_directory_bindings(&profile.directory_bindings, false)?;

    let mut cmd = Command::new(&profile.command[0]);
    cmd.args(&profile.command[1..])
        .current_dir(&profile.root_dir)
        .env_clear()
        .envs(profile.environment.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| UpletError::Process(format!("spawn(degraded): {}", e)))?;
    let child_pid = child.id() as i32;

    let stdout_handle = child
        .stdout
        .take()
        .map(|out| read_stream_async(out, profile.output_limit));
    let stderr_handle = child
        .stderr
        .take()
        .map(|err| read_stream_async(err, profile.output_limit));

    let grace = Duration::from_millis(profile.kill_grace_ms);
    let mut watchdog = Watchdog::new(deadline, cancel, grace);
    let exit_status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                watchdog.check(Pid::from_raw(child_pid));
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) => return Err(UpletError::Process(format!("wait(degraded): {}", e))),
        }
    };

    let (stdout, stdout_truncated) = stdout_handle
        .map(|h| h.join().unwrap_or_default())
        .unwrap_or_default();
    let (stderr, stderr_truncated) = stderr_handle
        .map(|h| h.join().unwrap_or_default())
        .unwrap_or_default();

    let status = ProxyStatus {
        payload_pid: Some(child_pid),
        exit_code: exit_status.code(),
        term_signal: exit_status.signal(),
        timed_out: watchdog.timed_out,
        wall_time_ms: watchdog.elapsed_ms(),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        output_truncated: stdout_truncated || stderr_truncated,
        ..ProxyStatus::default()
    };

    let evidence = build_launch_evidence(&req, false, true, &status);

    Ok(SandboxLaunchOutcome {
        proxy_host_pid: child_pid,
        payload_host_pid: Some(child_pid),
        timed_out: watchdog.timed_out,
        canceled: watchdog.canceled,
        status,
        evidence,
        kill_report: watchdog.kill_report,
    })
}
