use std::time::Duration;

use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};

/// How long a service gets to honor the interrupt before SIGKILL.
pub const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_millis(5000);

/// Delay before a crashed service is restarted.
pub const RESTART_DELAY: Duration = Duration::from_millis(3000);

/// Exit notification from a service's monitor task.
#[derive(Debug)]
pub struct ExitEvent {
    pub name: String,
    /// Exit code; `None` when the process died on a signal.
    pub code: Option<i32>,
}

/// Own the child until it exits and report the exit to the kernel.
///
/// The monitor is the only task that waits on the child. Receiving on
/// `kill_rx` escalates to a hard kill; the exit still flows through the
/// normal path afterwards.
pub(crate) async fn monitor(
    name: String,
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<ExitEvent>,
) {
    let mut armed = true;
    let status = loop {
        if armed {
            tokio::select! {
                status = child.wait() => break status,
                fired = &mut kill_rx => {
                    armed = false;
                    if fired.is_ok() {
                        tracing::warn!("[{name}] graceful stop timed out, killing");
                        let _ = child.start_kill();
                    }
                }
            }
        } else {
            break child.wait().await;
        }
    };
    let code = match status {
        Ok(s) => s.code(),
        Err(e) => {
            tracing::warn!("[{name}] wait failed: {e}");
            None
        }
    };
    let _ = events.send(ExitEvent { name, code });
}

/// Deliver the graceful interrupt to a running service.
///
/// POSIX targets get a real SIGINT; elsewhere the reserved `"SIGINT"`
/// string is relayed in-band and the child translates it locally.
pub(crate) fn send_interrupt(name: &str, pid: u32, outbound: &mpsc::Sender<String>) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        let _ = outbound;
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
            tracing::warn!("[{name}] cannot signal pid {pid}: {e}");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        let line = serde_json::to_string(crate::ipc::SIGINT_SENTINEL)
            .expect("sentinel serializes");
        if outbound.try_send(line).is_err() {
            tracing::warn!("[{name}] cannot relay interrupt");
        }
    }
}
