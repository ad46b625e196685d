//! Config-file watcher: notify runs on its own OS thread, change events
//! are debounced and forwarded into the supervisor's tokio world.

use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::time::{Duration, Instant};

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

const DEBOUNCE_MS: u64 = 500;

/// Watch the config file and send `()` on the channel when it changes.
/// Returns a sender that stops the watcher thread when any value is sent
/// (or when it is dropped).
///
/// The parent directory is watched rather than the file itself so that
/// editors doing the write-rename dance still produce events.
pub fn spawn_watcher(config_path: PathBuf, tx: mpsc::Sender<()>) -> std_mpsc::SyncSender<()> {
    let (stop_tx, stop_rx) = std_mpsc::sync_channel::<()>(1);

    std::thread::spawn(move || {
        let (raw_tx, raw_rx) = std_mpsc::channel::<notify::Result<Event>>();
        let mut watcher = match RecommendedWatcher::new(raw_tx, notify::Config::default()) {
            Ok(w) => w,
            Err(e) => {
                tracing::error!("watcher init failed for {}: {e}", config_path.display());
                return;
            }
        };

        let dir = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
            tracing::error!("cannot watch {}: {e}", dir.display());
            return;
        }
        let file_name = config_path.file_name().map(|n| n.to_os_string());

        let mut last_trigger = Instant::now()
            .checked_sub(Duration::from_millis(DEBOUNCE_MS + 1))
            .unwrap_or_else(Instant::now);

        loop {
            // Check stop signal (non-blocking)
            if stop_rx.try_recv().is_ok() {
                break;
            }

            // Poll for file events with a short timeout so we can check stop regularly
            match raw_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(Ok(event)) => {
                    let relevant = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if !relevant {
                        continue;
                    }
                    let now = Instant::now();
                    if now.duration_since(last_trigger) >= Duration::from_millis(DEBOUNCE_MS) {
                        last_trigger = now;
                        let _ = tx.blocking_send(());
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!("watch error for {}: {e}", config_path.display())
                }
                Err(std_mpsc::RecvTimeoutError::Timeout) => {}
                Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
    });

    stop_tx
}
