//! Optimizer processes launched alongside the bridge
//!
//! Each process gets the bridge endpoint in [`ADDRESS_VAR`], has its stdout
//! and stderr forwarded line by line to the log, and is killed when the
//! transport shuts down.

use simlink_core::{ADDRESS_VAR, Endpoint, OptimizerProcessConfig, Result, SimLinkError};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A launched optimizer, supervised by a task on the transport runtime
pub struct OptimizerProcess {
    name: String,
    pid: Option<u32>,
    stop: Option<oneshot::Sender<()>>,
    supervisor: JoinHandle<()>,
}

impl OptimizerProcess {
    /// Start the process on `handle`'s runtime
    pub fn spawn(config: &OptimizerProcessConfig, bridge: &Endpoint, handle: &Handle) -> Result<Self> {
        let _runtime = handle.enter();

        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .env(ADDRESS_VAR, bridge.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            SimLinkError::FatalInit(format!(
                "failed to start optimizer {} ({}): {}",
                config.name, config.command, e
            ))
        })?;
        let pid = child.id();
        info!("Started optimizer {} (pid {:?})", config.name, pid);

        if let Some(stdout) = child.stdout.take() {
            handle.spawn(forward_output(config.name.clone(), stdout, false));
        }
        if let Some(stderr) = child.stderr.take() {
            handle.spawn(forward_output(config.name.clone(), stderr, true));
        }

        let (stop, stop_rx) = oneshot::channel();
        let supervisor = handle.spawn(supervise(config.name.clone(), child, stop_rx));
        Ok(Self {
            name: config.name.clone(),
            pid,
            stop: Some(stop),
            supervisor,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS process id, if the process was still running when spawned
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        !self.supervisor.is_finished()
    }

    /// Kill the process and wait up to `timeout` for it to be reaped
    pub async fn stop(mut self, timeout: Duration) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if tokio::time::timeout(timeout, &mut self.supervisor).await.is_err() {
            warn!("Optimizer {} did not stop within {:?}", self.name, timeout);
            self.supervisor.abort();
        }
    }
}

/// Wait for the process to exit on its own, or kill it when asked
async fn supervise(name: String, mut child: Child, stop: oneshot::Receiver<()>) {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => warn!("Optimizer {} exited ({})", name, status),
            Err(e) => warn!("Lost track of optimizer {}: {}", name, e),
        },
        _ = stop => {
            if let Err(e) = child.start_kill() {
                debug!("Killing optimizer {}: {}", name, e);
            }
            match child.wait().await {
                Ok(status) => info!("Optimizer {} stopped ({})", name, status),
                Err(e) => warn!("Waiting for optimizer {}: {}", name, e),
            }
        }
    }
}

async fn forward_output<R>(name: String, stream: R, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if is_stderr => warn!("[{}] {}", name, line),
            Ok(Some(line)) => info!("[{}] {}", name, line),
            Ok(None) => break,
            Err(e) => {
                warn!("Reading output of optimizer {}: {}", name, e);
                break;
            }
        }
    }
    debug!("Output of optimizer {} closed", name);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(name: &str, script: &str) -> OptimizerProcessConfig {
        OptimizerProcessConfig {
            name: name.into(),
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_exit_is_noticed() {
        let bridge = Endpoint::Tcp("127.0.0.1:5559".into());
        let process = OptimizerProcess::spawn(&shell("quick", "exit 3"), &bridge, &Handle::current()).unwrap();
        assert_eq!(process.name(), "quick");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while process.is_running() {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_stop_kills_long_running_process() {
        let bridge = Endpoint::Tcp("127.0.0.1:5559".into());
        let process = OptimizerProcess::spawn(&shell("sleeper", "exec sleep 30"), &bridge, &Handle::current()).unwrap();
        assert!(process.pid().is_some());
        assert!(process.is_running());

        let started = std::time::Instant::now();
        process.stop(Duration::from_secs(5)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_binary_is_fatal() {
        let config = OptimizerProcessConfig {
            command: "/nonexistent/simlink-optimizer".into(),
            ..Default::default()
        };
        let bridge = Endpoint::Tcp("127.0.0.1:5559".into());
        assert!(matches!(
            OptimizerProcess::spawn(&config, &bridge, &Handle::current()),
            Err(SimLinkError::FatalInit(_))
        ));
    }
}
