//! Port-enumeration diff watcher.
//!
//! Polling `enumerate()` and diffing the `(path, vid, pid)` tuples between
//! two polls is the only reliable cross-platform hot-unplug signal. The
//! watcher emits `PortsChanged` on any difference and `PortDisappeared`
//! when the link's active port is among the removed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{enumerate, PortInfo};
use crate::event::{Event, EventSender};

/// Default poll period.
pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_secs(2);

pub struct PortWatcher {
    ports_rx: watch::Receiver<Vec<PortInfo>>,
    active: Arc<Mutex<Option<String>>>,
    task: JoinHandle<()>,
}

impl PortWatcher {
    /// Spawn the poll loop. `period` is the enumeration interval.
    pub fn spawn(period: Duration, events: EventSender) -> Self {
        let initial = enumerate().unwrap_or_default();
        let (ports_tx, ports_rx) = watch::channel(initial.clone());
        let active = Arc::new(Mutex::new(None::<String>));
        let active_for_task = Arc::clone(&active);

        let task = tokio::spawn(async move {
            let mut known = initial;
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Ok(current) = enumerate() else { continue };
                if identities(&current) == identities(&known) {
                    continue;
                }
                let gone: Vec<&PortInfo> = known
                    .iter()
                    .filter(|k| !current.iter().any(|c| c.identity() == k.identity()))
                    .collect();
                events.emit(Event::PortsChanged(current.clone())).await;
                let active_path = active_for_task.lock().unwrap().clone();
                if let Some(path) = active_path {
                    if gone.iter().any(|p| p.path == path) {
                        events.emit(Event::PortDisappeared { path }).await;
                    }
                }
                let _ = ports_tx.send(current.clone());
                known = current;
            }
        });

        Self {
            ports_rx,
            active,
            task,
        }
    }

    /// Mark `path` as the port the link currently holds open, or `None`.
    pub fn set_active_port(&self, path: Option<String>) {
        *self.active.lock().unwrap() = path;
    }

    /// Receiver over the current port set; detection watches this to abort
    /// when its port vanishes mid-probe.
    pub fn subscribe(&self) -> watch::Receiver<Vec<PortInfo>> {
        self.ports_rx.clone()
    }
}

impl Drop for PortWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn identities(ports: &[PortInfo]) -> Vec<(&str, Option<u16>, Option<u16>)> {
    let mut ids: Vec<_> = ports.iter().map(PortInfo::identity).collect();
    ids.sort();
    ids
}
