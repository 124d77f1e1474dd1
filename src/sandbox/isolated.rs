use crate::config::types::{DirectoryBinding, Result, SandboxConfig, SandboxFailureKind, UpletError};
use crate::core::supervisor::launch_with_supervisor;
use crate::core::types::{ExecutionProfile, SandboxLaunchRequest};
use crate::safety::{Workspace, WorkspaceManager};
use crate::sandbox::{
    RunInputs, RunOp, RunPhase, RunRecord, SandboxRunner, Score, TrainOutput, VerdictClassifier,
};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

const HISTORY_LIMIT: usize = 64;

fn execution_failure(msg: impl Into<String>) -> UpletError {
    UpletError::sandbox(SandboxFailureKind::ExecutionFailure, msg)
}

fn setup_failure(err: UpletError) -> UpletError {
    match err {
        UpletError::Sandbox { .. } => err,
        other => UpletError::sandbox(SandboxFailureKind::SetupFailure, other.to_string()),
    }
}

/// Read a regular file the payload left in `output/`. Symlinks are refused;
/// the supervisor must never follow a path chosen by sandboxed code.
fn read_output_file(output_dir: &Path, name: &str) -> Result<Vec<u8>> {
    let path = output_dir.join(name);
    let metadata = fs::symlink_metadata(&path)
        .map_err(|_| execution_failure(format!("output/{} was not produced", name)))?;
    if !metadata.file_type().is_file() {
        return Err(execution_failure(format!("output/{} is not a regular file", name)));
    }
    fs::read(&path).map_err(|e| execution_failure(format!("reading output/{}: {}", name, e)))
}

fn read_score(output_dir: &Path) -> Result<Score> {
    let raw = read_output_file(output_dir, "perf.json")?;
    let score: Score = serde_json::from_slice(&raw)
        .map_err(|e| execution_failure(format!("malformed output/perf.json: {}", e)))?;
    if !score.perf.is_finite() || score.metrics.values().any(|v| !v.is_finite()) {
        return Err(execution_failure("output/perf.json holds a non-finite value"));
    }
    Ok(score)
}

/// Runs algorithm code in the namespace sandbox, one fresh workspace per run
pub struct IsolatedRunner {
    config: SandboxConfig,
    workspaces: WorkspaceManager,
    history: Mutex<VecDeque<RunRecord>>,
}

impl IsolatedRunner {
    pub fn new(config: SandboxConfig) -> Result<Self> {
        let workspaces = WorkspaceManager::new(config.workspace_root.clone())?;
        Ok(Self {
            config,
            workspaces,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LIMIT)),
        })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Most recent runs, oldest first
    pub fn history(&self) -> Vec<RunRecord> {
        self.lock_history().iter().cloned().collect()
    }

    pub fn last_run(&self) -> Option<RunRecord> {
        self.lock_history().back().cloned()
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, VecDeque<RunRecord>> {
        self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remember(&self, record: RunRecord) {
        let mut history = self.lock_history();
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(record);
    }

    /// Run `op` and hand the output directory to `collect` before teardown
    fn execute<T>(
        &self,
        op: RunOp,
        inputs: &RunInputs,
        timeout: Duration,
        collect: impl FnOnce(&Path) -> Result<T>,
    ) -> Result<T> {
        let workspace = match self.workspaces.create_workspace() {
            Ok(workspace) => workspace,
            Err(e) => {
                let mut record = RunRecord::new("unallocated", op);
                record.advance(RunPhase::TornDown)?;
                self.remember(record);
                return Err(setup_failure(e));
            }
        };

        let mut record = RunRecord::new(workspace.run_id(), op);
        record.workspace = Some(workspace.run_dir().to_path_buf());

        let outcome = self.run_in(&workspace, &mut record, op, inputs, timeout, collect);

        drop(workspace);
        record.advance(RunPhase::TornDown)?;
        log::debug!("Run {} torn down ({:?})", record.run_id, record.history);
        self.remember(record);
        outcome
    }

    fn run_in<T>(
        &self,
        workspace: &Workspace,
        record: &mut RunRecord,
        op: RunOp,
        inputs: &RunInputs,
        timeout: Duration,
        collect: impl FnOnce(&Path) -> Result<T>,
    ) -> Result<T> {
        record.advance(RunPhase::Started)?;

        let launch = self.prepare(workspace, op, inputs).and_then(|request| {
            log::info!("Run {}: {} started (timeout {:?})", request.run_id, op, timeout);
            launch_with_supervisor(request, timeout, &inputs.cancel)
        });

        let outcome = match launch {
            Ok(outcome) => outcome,
            Err(e) => {
                record.advance(RunPhase::StartFailed)?;
                log::warn!("Run {}: {} failed to start: {}", record.run_id, op, e);
                return Err(setup_failure(e));
            }
        };

        record.proxy_pid = Some(outcome.proxy_host_pid);
        record.advance(RunPhase::Running)?;
        if outcome.evidence.degraded {
            log::warn!("Run {}: {}", record.run_id, outcome.evidence.mode_decision_reason);
        }

        let verdict = VerdictClassifier::classify(&outcome);
        record.advance(verdict.phase())?;
        log::info!(
            "Run {}: {} finished as {:?} in {} ms",
            record.run_id,
            op,
            verdict.phase(),
            outcome.status.wall_time_ms
        );
        verdict.into_result()?;

        collect(&workspace.output_dir())
    }

    fn prepare(&self, workspace: &Workspace, op: RunOp, inputs: &RunInputs) -> Result<SandboxLaunchRequest> {
        let mut bindings = vec![
            DirectoryBinding::read_only(&inputs.algo_dir, "algo"),
            DirectoryBinding::inert(&inputs.data_dir, "data"),
        ];
        match &inputs.model_dir {
            Some(dir) => bindings.push(DirectoryBinding::inert(dir, "model")),
            None => fs::create_dir_all(workspace.root_dir().join("model"))?,
        }

        if let Some(uid) = self.config.uid {
            workspace.chown_output(uid, self.config.gid.unwrap_or(uid))?;
        }

        let mut command = self.config.entrypoint.clone();
        command.push(op.as_str().to_string());

        Ok(SandboxLaunchRequest {
            run_id: workspace.run_id().to_string(),
            profile: ExecutionProfile::from_config(
                &self.config,
                command,
                workspace.root_dir(),
                bindings,
            ),
        })
    }
}

impl SandboxRunner for IsolatedRunner {
    fn train(&self, inputs: &RunInputs, timeout: Duration) -> Result<TrainOutput> {
        self.execute(RunOp::Train, inputs, timeout, |output| {
            Ok(TrainOutput {
                score: read_score(output)?,
                model: read_output_file(output, "model")?,
            })
        })
    }

    fn test(&self, inputs: &RunInputs, timeout: Duration) -> Result<Score> {
        self.execute(RunOp::Test, inputs, timeout, read_score)
    }

    fn predict(&self, inputs: &RunInputs, timeout: Duration) -> Result<Vec<u8>> {
        self.execute(RunOp::Predict, inputs, timeout, |output| {
            read_output_file(output, "prediction")
        })
    }
}
