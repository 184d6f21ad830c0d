//! Polling directory watcher with a size-stability heuristic.
//!
//! Cards are written to by cameras while the host reads them, so a file that
//! just appeared may still be growing. A new name is held back until its size
//! has stayed put for more than twice the check interval; only then is it
//! reported as new.

use crate::error::Result;
use crate::fat32::DirEntry;
use crate::fs::{Directory, FileSystemAdapter, Node};
use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Time source seam; the watcher never calls `Instant::now` directly.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The wall clock.
#[derive(Debug, Default, Copy, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Default pass interval.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5);
/// A candidate size must hold for more than this many intervals.
const STABILITY_FACTOR: u32 = 2;

/// Change reported by one detection pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A file appeared and its size settled.
    New(DirEntry),
    /// A known file changed size or modification time.
    Modified(DirEntry),
    /// A known file vanished; carries the last seen entry.
    Removed(DirEntry),
}

/// A not-yet-stable candidate file.
struct PendingFile {
    size: u32,
    detected_at: Instant,
}

/// Watches one directory by polling.
///
/// Subdirectories are ignored; every name is tracked as either known or
/// pending-stability, never both.
pub struct DirectoryWatcher<A, C = SystemClock> {
    directory: Directory<A>,
    clock: C,
    check_interval: Duration,
    known: HashMap<String, DirEntry>,
    unstable: HashMap<String, PendingFile>,
}

impl<A: FileSystemAdapter> DirectoryWatcher<A> {
    pub fn new(directory: Directory<A>) -> DirectoryWatcher<A> {
        Self::with_clock(directory, SystemClock)
    }
}

impl<A: FileSystemAdapter, C: Clock> DirectoryWatcher<A, C> {
    pub fn with_clock(directory: Directory<A>, clock: C) -> DirectoryWatcher<A, C> {
        DirectoryWatcher {
            directory,
            clock,
            check_interval: DEFAULT_CHECK_INTERVAL,
            known: HashMap::new(),
            unstable: HashMap::new(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> DirectoryWatcher<A, C> {
        self.check_interval = interval;
        self
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Takes the files currently present as the baseline: none of them will
    /// be reported unless they change later.
    pub fn seed(&mut self) -> Result<()> {
        self.known.clear();
        self.unstable.clear();
        for entry in self.current_files()? {
            self.known.insert(entry.name.clone(), entry);
        }
        log::debug!(
            "watch: {} seeded with {} files",
            self.directory.path(),
            self.known.len()
        );
        Ok(())
    }

    /// One detection pass. Events come back in dispatch order: all new files
    /// first, then modified, then removed.
    pub fn poll_once(&mut self) -> Result<Vec<WatchEvent>> {
        let now = self.clock.now();
        let current = self.current_files()?;
        let threshold = self.check_interval * STABILITY_FACTOR;

        let mut new_events = Vec::new();
        let mut modified = Vec::new();
        let mut removed = Vec::new();

        for entry in &current {
            if let Some(previous) = self.known.get_mut(&entry.name) {
                if previous.size != entry.size || previous.modified != entry.modified {
                    *previous = entry.clone();
                    modified.push(WatchEvent::Modified(entry.clone()));
                }
            } else {
                match self.unstable.get(&entry.name) {
                    Some(pending) if pending.size == entry.size => {}
                    _ => {
                        // first sighting, or still growing: restart the clock
                        self.unstable.insert(
                            entry.name.clone(),
                            PendingFile {
                                size: entry.size,
                                detected_at: now,
                            },
                        );
                    }
                }
            }
        }

        let current_by_name: HashMap<&str, &DirEntry> =
            current.iter().map(|e| (e.name.as_str(), e)).collect();

        let mut promoted = Vec::new();
        let mut vanished = Vec::new();
        for (name, pending) in &self.unstable {
            match current_by_name.get(name.as_str()) {
                None => vanished.push(name.clone()),
                Some(entry)
                    if entry.size == pending.size
                        && now.duration_since(pending.detected_at) > threshold =>
                {
                    promoted.push((*entry).clone());
                }
                Some(_) => {}
            }
        }
        for name in vanished {
            self.unstable.remove(&name);
        }
        for entry in promoted {
            self.unstable.remove(&entry.name);
            self.known.insert(entry.name.clone(), entry.clone());
            new_events.push(WatchEvent::New(entry));
        }

        let gone: Vec<String> = self
            .known
            .keys()
            .filter(|name| !current_by_name.contains_key(name.as_str()))
            .cloned()
            .collect();
        for name in gone {
            if let Some(entry) = self.known.remove(&name) {
                removed.push(WatchEvent::Removed(entry));
            }
        }

        let mut events = new_events;
        events.extend(modified);
        events.extend(removed);
        Ok(events)
    }

    fn current_files(&self) -> Result<Vec<DirEntry>> {
        Ok(self
            .directory
            .refresh()?
            .into_iter()
            .filter_map(|node| match node {
                Node::File(file) => Some(file.entry().clone()),
                Node::Directory(_) => None,
            })
            .collect())
    }
}

impl<A, C> DirectoryWatcher<A, C>
where
    A: FileSystemAdapter + 'static,
    C: Clock + 'static,
{
    /// Seeds, runs an immediate pass, then a pass per interval on a
    /// background thread. Pass failures are logged; the schedule keeps going.
    pub fn start(
        mut self,
        mut callback: impl FnMut(WatchEvent) + Send + 'static,
    ) -> WatcherHandle {
        let interval = self.check_interval;
        let (stop, stopped) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("wifi-sdcf-watch".into())
            .spawn(move || {
                if let Err(err) = self.seed() {
                    log::warn!("watch: initial listing failed: {err}");
                }
                loop {
                    match self.poll_once() {
                        Ok(events) => events.into_iter().for_each(&mut callback),
                        Err(err) => log::warn!("watch: detection pass failed: {err}"),
                    }
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                }
            })
            .expect("failed to spawn watcher thread");

        WatcherHandle {
            stop,
            thread: Some(thread),
        }
    }
}

/// Running watcher; stop it explicitly or by dropping.
pub struct WatcherHandle {
    stop: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl WatcherHandle {
    /// Cancels the schedule and waits for the watcher thread; all watch
    /// state is dropped with it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
