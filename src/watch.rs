//! Watching helper processes while a response is delayed.

use log::{debug, warn};
use std::collections::HashMap;
use std::io;
use std::process::{Child, ExitStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub type ChildExit = io::Result<ExitStatus>;

/// Identifies one registered child watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchHandle(u64);

impl WatchHandle {
    pub fn id(self) -> u64 {
        self.0
    }
}

#[derive(Debug)]
pub(crate) struct Watcher {
    next_id: u64,
    sender: Sender<(WatchHandle, ChildExit)>,
    receiver: Receiver<(WatchHandle, ChildExit)>,
    active: HashMap<WatchHandle, Arc<AtomicBool>>,
}

impl Default for Watcher {
    fn default() -> Self {
        let (sender, receiver) = mpsc::channel();
        Watcher {
            next_id: 1,
            sender,
            receiver,
            active: HashMap::new(),
        }
    }
}

impl Watcher {
    pub fn watch_child(&mut self, mut child: Child) -> WatchHandle {
        let handle = WatchHandle(self.next_id);
        self.next_id += 1;
        let cancelled = Arc::new(AtomicBool::new(false));
        self.active.insert(handle, cancelled.clone());
        let sender = self.sender.clone();
        let pid = child.id();
        thread::spawn(move || {
            loop {
                if cancelled.load(Ordering::Relaxed) {
                    debug!("watch {} on pid {pid} cancelled", handle.0);
                    // still reap it, nobody else will
                    if let Err(e) = child.wait() {
                        warn!("waiting for cancelled pid {pid} failed: {e}");
                    }
                    return;
                }
                match child.try_wait() {
                    Ok(Some(status)) => {
                        let _ = sender.send((handle, Ok(status)));
                        return;
                    }
                    Ok(None) => thread::sleep(POLL_INTERVAL),
                    Err(e) => {
                        let _ = sender.send((handle, Err(e)));
                        return;
                    }
                }
            }
        });
        handle
    }

    /// Deregisters a watch. Returns false if it was not active.
    pub fn cancel(&mut self, handle: WatchHandle) -> bool {
        match self.active.remove(&handle) {
            Some(cancelled) => {
                cancelled.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) -> usize {
        let count = self.active.len();
        for (_, cancelled) in self.active.drain() {
            cancelled.store(true, Ordering::Relaxed);
        }
        count
    }

    pub fn has_active(&self) -> bool {
        !self.active.is_empty()
    }

    /// Waits up to `timeout` for an active watch to complete. Completions of
    /// cancelled watches are dropped.
    pub fn wait(&mut self, timeout: Duration) -> Option<(WatchHandle, ChildExit)> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.receiver.recv_timeout(remaining) {
                Ok((handle, exit)) => {
                    if self.active.remove(&handle).is_some() {
                        return Some((handle, exit));
                    }
                    debug!("dropping stale completion of watch {}", handle.0);
                }
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("watch channel disconnected");
                    return None;
                }
            }
        }
    }
}
