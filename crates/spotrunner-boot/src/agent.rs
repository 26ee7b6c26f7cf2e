use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use crate::install::{RUNNER_ENTRYPOINT, ensure_runner};
use crate::metadata::MetadataClient;
use crate::payload::BootPayload;

/// How long the runner gets to stop after the watchdog fired.
const FORCED_STOP_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// The runner finished its job (or crashed) on its own.
    RunnerExited(Option<i32>),
    /// The machine received a spot interruption notice.
    Preempted,
    /// The watchdog fired before the runner finished.
    TimedOut,
    InstallFailed(String),
    StartFailed(String),
}

enum AgentEvent {
    RunnerExited(std::io::Result<std::process::ExitStatus>),
    Timeout,
    Interrupted(String),
}

/// Installs and runs the job runner until it exits, the watchdog fires or the machine is
/// about to be reclaimed.
///
/// This function never terminates the machine, see [`run_to_completion`].
pub async fn run_agent(payload: &BootPayload, client: &reqwest::Client) -> ExitReason {
    if let Err(error) = ensure_runner(&payload.runner, client).await {
        log::error!("Cannot install runner: {error}");
        return ExitReason::InstallFailed(error.to_string());
    }

    let install_dir = &payload.runner.install_dir;
    let mut command = Command::new(install_dir.join(RUNNER_ENTRYPOINT));
    command
        .arg("--jitconfig")
        .arg(&payload.jit_config)
        .current_dir(install_dir)
        .process_group(0)
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(error) => {
            log::error!("Cannot start runner: {error}");
            return ExitReason::StartFailed(error.to_string());
        }
    };
    log::info!(
        "Runner for job {} started, timeout {}s",
        payload.job_id,
        payload.timeout_secs
    );

    let metadata = MetadataClient::new(client.clone(), &payload.preemption.metadata_url);
    let event = tokio::select! {
        status = child.wait() => AgentEvent::RunnerExited(status),
        _ = tokio::time::sleep(payload.timeout()) => AgentEvent::Timeout,
        notice = wait_for_interruption(&metadata, payload.preemption.poll_interval()) => {
            AgentEvent::Interrupted(notice)
        }
    };

    match event {
        AgentEvent::RunnerExited(Ok(status)) => {
            log::info!("Runner exited with {status}");
            ExitReason::RunnerExited(status.code())
        }
        AgentEvent::RunnerExited(Err(error)) => {
            log::error!("Cannot wait for runner: {error}");
            ExitReason::RunnerExited(None)
        }
        AgentEvent::Timeout => {
            log::warn!(
                "Job {} exceeded its timeout of {}s, stopping runner",
                payload.job_id,
                payload.timeout_secs
            );
            stop_runner(&mut child, FORCED_STOP_GRACE).await;
            ExitReason::TimedOut
        }
        AgentEvent::Interrupted(notice) => {
            log::warn!("Spot interruption notice received: {notice}");
            stop_runner(&mut child, payload.preemption.grace_period()).await;
            ExitReason::Preempted
        }
    }
}

/// Runs the agent and terminates the machine afterwards, whatever the outcome was.
pub async fn run_to_completion(payload: &BootPayload, client: &reqwest::Client) -> ExitReason {
    let reason = run_agent(payload, client).await;
    log::info!("Job {} finished: {reason:?}", payload.job_id);
    if let Err(error) = self_terminate(&payload.shutdown_command).await {
        log::error!("Cannot terminate machine: {error}");
    }
    reason
}

async fn wait_for_interruption(metadata: &MetadataClient, poll_interval: Duration) -> String {
    loop {
        match metadata.interruption_notice().await {
            Ok(Some(notice)) => return notice,
            Ok(None) => {}
            Err(error) => log::debug!("Cannot query interruption notice: {error}"),
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Sends SIGTERM to the runner process group and kills it if it does not exit within `grace`.
pub async fn stop_runner(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        // Already reaped
        return;
    };
    let pgid = Pid::from_raw(pid as i32);
    if let Err(error) = signal::killpg(pgid, Signal::SIGTERM) {
        log::warn!("Cannot send SIGTERM to runner process group {pgid}: {error:?}");
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            log::info!("Runner stopped gracefully with {status}");
            return;
        }
        Ok(Err(error)) => log::warn!("Cannot wait for runner: {error}"),
        Err(_) => log::warn!("Runner did not stop within {}s", grace.as_secs()),
    }
    if let Err(error) = signal::killpg(pgid, Signal::SIGKILL) {
        log::error!("Cannot kill runner process group {pgid}: {error:?}");
    }
    if let Err(error) = child.wait().await {
        log::error!("Cannot wait for killed runner: {error}");
    }
}

pub async fn self_terminate(command: &[String]) -> crate::Result<()> {
    let Some((program, args)) = command.split_first() else {
        return Err(crate::BootError::GenericError(
            "Shutdown command is empty".to_string(),
        ));
    };
    log::info!("Terminating machine: {}", command.join(" "));
    let status = Command::new(program).args(args).status().await?;
    if !status.success() {
        return Err(crate::BootError::GenericError(format!(
            "Shutdown command exited with {status}"
        )));
    }
    Ok(())
}
