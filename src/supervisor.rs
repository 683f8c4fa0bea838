//! Watchdog that keeps the scan worker alive.
//!
//! Each run is a separate OS process. The supervisor waits for it with a
//! deadline, SIGKILLs it when the deadline passes, and starts a new one
//! after a fixed delay. It only stops when the cancellation token fires.

use std::ffi::OsString;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::process::{Child, ChildStdin, Command};
use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::settings::Settings;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

/// A running worker that can be awaited or killed.
pub trait WorkerProcess {
    fn id(&self) -> Option<u32>;

    /// Resolves when the worker exits on its own, with its exit code
    /// (`None` when it was ended by a signal).
    fn wait(&mut self) -> impl Future<Output = Result<Option<i32>>> + Send;

    /// Forcibly terminates the worker and reaps it.
    fn kill(&mut self) -> impl Future<Output = Result<()>> + Send;
}

pub trait WorkerLauncher {
    type Process: WorkerProcess + Send;

    fn launch(&mut self) -> Result<Self::Process>;
}

/// Re-executes a binary with the `worker` subcommand.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessLauncher {
    /// Launches this same executable, forwarding the settings file if any.
    pub fn current_exe(config: Option<&Path>) -> Result<Self> {
        let program = std::env::current_exe().context("failed to locate own executable")?;
        Ok(Self::new(program, config))
    }

    pub fn new(program: PathBuf, config: Option<&Path>) -> Self {
        let mut args: Vec<OsString> = Vec::new();
        if let Some(path) = config {
            args.push("--config".into());
            args.push(path.as_os_str().to_owned());
        }
        args.push("worker".into());
        args.push("--watch-parent".into());
        Self::with_args(program, args)
    }

    pub fn with_args(program: PathBuf, args: Vec<OsString>) -> Self {
        Self { program, args }
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }
}

impl WorkerLauncher for ProcessLauncher {
    type Process = ChildWorker;

    fn launch(&mut self) -> Result<ChildWorker> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program.display()))?;
        let stdin = child.stdin.take();
        Ok(ChildWorker { child, _stdin: stdin })
    }
}

/// Worker child process. Holding the stdin pipe keeps the worker's parent
/// watch from firing; the pipe closes when this is dropped.
pub struct ChildWorker {
    child: Child,
    _stdin: Option<ChildStdin>,
}

impl WorkerProcess for ChildWorker {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<Option<i32>> {
        let status = self
            .child
            .wait()
            .await
            .context("failed to wait on worker process")?;
        Ok(status.code())
    }

    async fn kill(&mut self) -> Result<()> {
        self.child
            .kill()
            .await
            .context("failed to kill worker process")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Starting,
    Running,
    Completed,
    TimedOut,
}

/// One supervised invocation of the worker.
#[derive(Debug, Clone)]
pub struct WorkerRun {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub deadline: Duration,
    pub state: RunState,
    pub pid: Option<u32>,
}

impl WorkerRun {
    fn new(deadline: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            deadline,
            state: RunState::Starting,
            pid: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    pub launched: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub failed_launches: u64,
    pub kill_failures: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    pub process_timeout: Duration,
    pub restart_delay: Duration,
    pub teardown_timeout: Duration,
}

impl From<&Settings> for SupervisorConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            process_timeout: settings.process_timeout(),
            restart_delay: settings.restart_delay(),
            teardown_timeout: settings.teardown_timeout(),
        }
    }
}

enum Waited {
    Interrupted,
    Exited(Result<Option<i32>>),
    DeadlineExceeded,
}

pub struct Supervisor<L> {
    launcher: L,
    config: SupervisorConfig,
    stats: SupervisorStats,
}

impl<L: WorkerLauncher> Supervisor<L> {
    pub fn new(launcher: L, config: SupervisorConfig) -> Self {
        Self {
            launcher,
            config,
            stats: SupervisorStats::default(),
        }
    }

    /// Runs workers back to back until `cancel` fires. Every failure is
    /// absorbed into a restart; the in-flight worker is killed before this
    /// returns.
    pub async fn supervise_forever(&mut self, cancel: CancellationToken) -> SupervisorStats {
        log_info!(
            "supervisor started (timeout {}s, restart delay {}ms)",
            self.config.process_timeout.as_secs(),
            self.config.restart_delay.as_millis()
        );

        while !cancel.is_cancelled() {
            if let Some(run) = self.run_once(&cancel).await {
                log_debug!(
                    "worker run {} (started {}) ended {:?}",
                    run.id,
                    run.started_at.to_rfc3339(),
                    run.state
                );
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = time::sleep(self.config.restart_delay) => {}
            }
        }

        log_info!(
            "supervisor stopped: {} runs, {} timed out, {} completed",
            self.stats.launched,
            self.stats.timed_out,
            self.stats.completed
        );
        self.stats
    }

    async fn run_once(&mut self, cancel: &CancellationToken) -> Option<WorkerRun> {
        let mut run = WorkerRun::new(self.config.process_timeout);
        log_info!("starting worker (run {})", run.id);

        let mut process = match self.launcher.launch() {
            Ok(process) => process,
            Err(err) => {
                self.stats.failed_launches += 1;
                log_error!("failed to launch worker: {err:#}");
                return None;
            }
        };
        self.stats.launched += 1;
        run.pid = process.id();
        run.state = RunState::Running;
        log_debug!("worker run {} running as pid {:?}", run.id, run.pid);

        let waited = tokio::select! {
            biased;
            _ = cancel.cancelled() => Waited::Interrupted,
            result = time::timeout(run.deadline, process.wait()) => match result {
                Ok(exit) => Waited::Exited(exit),
                Err(_) => Waited::DeadlineExceeded,
            },
        };

        match waited {
            Waited::Interrupted => {
                log_info!("interrupt received, stopping worker run {}", run.id);
                self.terminate(&mut process, &run).await;
            }
            Waited::DeadlineExceeded => {
                run.state = RunState::TimedOut;
                self.stats.timed_out += 1;
                log_warn!(
                    "worker run {} frozen after {}s, restarting",
                    run.id,
                    run.deadline.as_secs()
                );
                self.terminate(&mut process, &run).await;
            }
            Waited::Exited(Ok(code)) => {
                run.state = RunState::Completed;
                self.stats.completed += 1;
                log_info!(
                    "worker run {} completed (exit code {:?}), restarting in {}ms",
                    run.id,
                    code,
                    self.config.restart_delay.as_millis()
                );
            }
            Waited::Exited(Err(err)) => {
                run.state = RunState::Completed;
                self.stats.completed += 1;
                log_error!("lost track of worker run {}: {err:#}", run.id);
                self.terminate(&mut process, &run).await;
            }
        }

        Some(run)
    }

    async fn terminate<P: WorkerProcess>(&mut self, process: &mut P, run: &WorkerRun) {
        let started = Instant::now();
        match time::timeout(self.config.teardown_timeout, process.kill()).await {
            Ok(Ok(())) => log_debug!(
                "worker run {} killed in {}ms",
                run.id,
                started.elapsed().as_millis()
            ),
            Ok(Err(err)) => {
                self.stats.kill_failures += 1;
                log_error!("failed to kill worker run {}: {err:#}", run.id);
            }
            Err(_) => {
                self.stats.kill_failures += 1;
                log_error!(
                    "worker run {} still alive {}s after kill",
                    run.id,
                    self.config.teardown_timeout.as_secs()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Copy)]
    enum Behaviour {
        Hang,
        ExitAfter(Duration),
    }

    #[derive(Clone, Default)]
    struct Tally {
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
        attempts: Arc<AtomicUsize>,
        kills: Arc<Mutex<Vec<u32>>>,
    }

    impl Tally {
        fn launches(&self) -> usize {
            self.kills.lock().unwrap().len()
        }

        fn kills(&self) -> Vec<u32> {
            self.kills.lock().unwrap().clone()
        }
    }

    struct FakeLauncher {
        behaviour: Behaviour,
        tally: Tally,
        fail_attempts: Vec<usize>,
        cancel_on_launch: Option<(usize, CancellationToken)>,
    }

    impl FakeLauncher {
        fn new(behaviour: Behaviour, tally: &Tally) -> Self {
            Self {
                behaviour,
                tally: tally.clone(),
                fail_attempts: Vec::new(),
                cancel_on_launch: None,
            }
        }
    }

    impl WorkerLauncher for FakeLauncher {
        type Process = FakeProcess;

        fn launch(&mut self) -> Result<FakeProcess> {
            let attempt = self.tally.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_attempts.contains(&attempt) {
                return Err(anyhow!("exec failed"));
            }

            let now_active = self.tally.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.tally.max_active.fetch_max(now_active, Ordering::SeqCst);
            let index = {
                let mut kills = self.tally.kills.lock().unwrap();
                kills.push(0);
                kills.len() - 1
            };

            if let Some((launch, token)) = &self.cancel_on_launch {
                if *launch == index + 1 {
                    token.cancel();
                }
            }

            Ok(FakeProcess {
                index,
                behaviour: self.behaviour,
                tally: self.tally.clone(),
                alive: true,
            })
        }
    }

    struct FakeProcess {
        index: usize,
        behaviour: Behaviour,
        tally: Tally,
        alive: bool,
    }

    impl FakeProcess {
        fn finish(&mut self) {
            if self.alive {
                self.alive = false;
                self.tally.active.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    impl Drop for FakeProcess {
        fn drop(&mut self) {
            self.finish();
        }
    }

    impl WorkerProcess for FakeProcess {
        fn id(&self) -> Option<u32> {
            Some(self.index as u32 + 100)
        }

        async fn wait(&mut self) -> Result<Option<i32>> {
            match self.behaviour {
                Behaviour::Hang => std::future::pending().await,
                Behaviour::ExitAfter(after) => {
                    time::sleep(after).await;
                    self.finish();
                    Ok(Some(0))
                }
            }
        }

        async fn kill(&mut self) -> Result<()> {
            self.tally.kills.lock().unwrap()[self.index] += 1;
            self.finish();
            Ok(())
        }
    }

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            process_timeout: Duration::from_secs(10),
            restart_delay: Duration::from_secs(1),
            teardown_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_worker_is_killed_once_then_restarted() {
        let tally = Tally::default();
        let cancel = CancellationToken::new();
        let mut launcher = FakeLauncher::new(Behaviour::Hang, &tally);
        launcher.cancel_on_launch = Some((4, cancel.clone()));

        let started = Instant::now();
        let stats = Supervisor::new(launcher, config())
            .supervise_forever(cancel)
            .await;

        assert_eq!(stats.launched, 4);
        assert_eq!(stats.timed_out, 3);
        assert_eq!(stats.completed, 0);
        // Three timed-out runs plus the one interrupted at launch.
        assert_eq!(tally.kills(), vec![1, 1, 1, 1]);
        assert_eq!(tally.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(tally.active.load(Ordering::SeqCst), 0);
        assert_eq!(started.elapsed(), Duration::from_secs(33));
    }

    #[tokio::test(start_paused = true)]
    async fn completed_worker_is_restarted_without_kill() {
        let tally = Tally::default();
        let cancel = CancellationToken::new();
        let mut launcher = FakeLauncher::new(Behaviour::ExitAfter(Duration::from_secs(2)), &tally);
        launcher.cancel_on_launch = Some((3, cancel.clone()));

        let stats = Supervisor::new(launcher, config())
            .supervise_forever(cancel)
            .await;

        assert_eq!(stats.launched, 3);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.timed_out, 0);
        assert_eq!(tally.kills(), vec![0, 0, 1]);
        assert_eq!(tally.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_during_wait_stops_restarts() {
        let tally = Tally::default();
        let cancel = CancellationToken::new();
        let launcher = FakeLauncher::new(Behaviour::Hang, &tally);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_secs(15)).await;
            trigger.cancel();
        });

        let stats = Supervisor::new(launcher, config())
            .supervise_forever(cancel)
            .await;

        // First run timed out at 10s, second started at 11s and was
        // interrupted at 15s.
        assert_eq!(stats.launched, 2);
        assert_eq!(stats.timed_out, 1);
        assert_eq!(tally.kills(), vec![1, 1]);

        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(tally.launches(), 2);
        assert_eq!(tally.active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_during_restart_delay_stops_restarts() {
        let tally = Tally::default();
        let cancel = CancellationToken::new();
        let launcher = FakeLauncher::new(Behaviour::Hang, &tally);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(10_500)).await;
            trigger.cancel();
        });

        let stats = Supervisor::new(launcher, config())
            .supervise_forever(cancel)
            .await;

        assert_eq!(stats.launched, 1);
        assert_eq!(tally.kills(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_launch_is_retried() {
        let tally = Tally::default();
        let cancel = CancellationToken::new();
        let mut launcher = FakeLauncher::new(Behaviour::ExitAfter(Duration::from_secs(1)), &tally);
        launcher.fail_attempts = vec![1, 2];
        launcher.cancel_on_launch = Some((2, cancel.clone()));

        let stats = Supervisor::new(launcher, config())
            .supervise_forever(cancel)
            .await;

        assert_eq!(stats.failed_launches, 2);
        assert_eq!(stats.launched, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(tally.attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn already_cancelled_token_launches_nothing() {
        let tally = Tally::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let stats = Supervisor::new(FakeLauncher::new(Behaviour::Hang, &tally), config())
            .supervise_forever(cancel)
            .await;

        assert_eq!(stats, SupervisorStats::default());
        assert_eq!(tally.launches(), 0);
    }

    #[cfg(unix)]
    fn shell(script: &str) -> ProcessLauncher {
        ProcessLauncher::with_args(PathBuf::from("/bin/sh"), vec!["-c".into(), script.into()])
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hung_child_process_is_killed_and_restarted() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(2_500)).await;
            trigger.cancel();
        });

        let config = SupervisorConfig {
            process_timeout: Duration::from_secs(1),
            restart_delay: Duration::from_millis(200),
            teardown_timeout: Duration::from_secs(5),
        };
        let stats = Supervisor::new(shell("exec sleep 100"), config)
            .supervise_forever(cancel)
            .await;

        assert!(stats.timed_out >= 1, "{stats:?}");
        assert!(stats.launched >= 2, "{stats:?}");
        assert_eq!(stats.completed, 0);
        assert_eq!(stats.kill_failures, 0);
        assert_eq!(stats.failed_launches, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_exit_code_is_reported() {
        let mut worker = shell("exit 3").launch().unwrap();
        assert!(worker.id().is_some());
        assert_eq!(worker.wait().await.unwrap(), Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn closing_the_stdin_pipe_releases_the_child() {
        let mut worker = shell("cat > /dev/null; exit 7").launch().unwrap();
        assert!(time::timeout(Duration::from_millis(300), worker.wait())
            .await
            .is_err());

        drop(worker._stdin.take());
        let code = time::timeout(Duration::from_secs(5), worker.wait())
            .await
            .expect("child kept running after its stdin closed")
            .unwrap();
        assert_eq!(code, Some(7));
    }

    #[cfg(target_os = "linux")]
    fn process_alive(pid: u32) -> bool {
        // A reaped pid has no stat file; an unreaped one reports state Z.
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => !stat
                .rsplit(')')
                .next()
                .is_some_and(|rest| rest.trim_start().starts_with('Z')),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn dropped_child_is_killed() {
        let worker = shell("exec sleep 100").launch().unwrap();
        let pid = worker.id().unwrap();
        assert!(process_alive(pid));

        drop(worker);
        let deadline = Instant::now() + Duration::from_secs(5);
        while process_alive(pid) {
            assert!(Instant::now() < deadline, "pid {pid} still running");
            time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_reaps_a_hung_child() {
        let mut worker = shell("exec sleep 100").launch().unwrap();
        time::timeout(Duration::from_secs(5), worker.kill())
            .await
            .expect("kill did not return")
            .unwrap();
        assert!(worker.id().is_none());
    }

    #[test]
    fn launcher_forwards_config_and_worker_flags() {
        let launcher = ProcessLauncher::new(
            PathBuf::from("/usr/local/bin/tapfill"),
            Some(Path::new("/etc/tapfill.json")),
        );
        let args: Vec<_> = launcher
            .args()
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec!["--config", "/etc/tapfill.json", "worker", "--watch-parent"]
        );
    }

    #[test]
    fn config_follows_settings() {
        let config = SupervisorConfig::from(&Settings::default());
        assert_eq!(config.process_timeout, Duration::from_secs(10));
        assert_eq!(config.restart_delay, Duration::from_secs(1));
    }
}
