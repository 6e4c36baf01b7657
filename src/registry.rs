//! File coordination registry (§4.2) and client registry (§4.3).
//!
//! The file registry enforces multi-reader/single-writer access per
//! filename. A single registry-wide `tokio::sync::Mutex` guards the map
//! and the admission test; `tokio::sync::Notify` stands in for the
//! original's condition variable. Per-entry counters live behind a
//! `std::sync::Mutex` purely so `Arc<FileEntry>` can be mutated through a
//! shared reference — it is never contended, since every access happens
//! while the registry-wide lock is already held.
//!
//! Entries are refcounted via `Arc`: a waiter that cloned an `Arc<FileEntry>`
//! keeps the entry alive (and its `Notify` valid) even if garbage
//! collection removes the map's own slot for that filename, so the
//! use-after-free hazard called out in the source design notes cannot
//! arise here. Garbage collection itself only fires when a filename's
//! reader/writer counters are both zero, which by construction cannot
//! happen while anything is still waiting on that entry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

#[derive(Default)]
struct Counters {
    num_readers: usize,
    active_readers: usize,
    num_writers: usize,
    write_locked: bool,
}

struct FileEntry {
    counters: std::sync::Mutex<Counters>,
    notify: Notify,
}

impl FileEntry {
    fn new() -> Self {
        Self {
            counters: std::sync::Mutex::new(Counters::default()),
            notify: Notify::new(),
        }
    }
}

/// A held read or write lock on a filename, returned by `begin_read` /
/// `begin_write`. Callers release it explicitly via `FileRegistry::end_read`
/// / `end_write` from the session's CLEANUP step (§4.7) — release is not
/// tied to `Drop` because it must run `.await` to re-acquire the registry
/// lock and garbage-collect.
pub struct FileLock {
    filename: String,
    entry: Arc<FileEntry>,
}

#[derive(Clone)]
pub struct FileRegistry {
    entries: Arc<Mutex<HashMap<String, Arc<FileEntry>>>>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// §4.2 `begin_read`. Readers are admitted strictly when no writer
    /// holds the write lock; admission is never inferred from
    /// `num_readers` (the source's bug, corrected per §9).
    pub async fn begin_read(&self, filename: &str) -> FileLock {
        let entry = {
            let mut map = self.entries.lock().await;
            let entry = map
                .entry(filename.to_string())
                .or_insert_with(|| Arc::new(FileEntry::new()))
                .clone();
            entry.counters.lock().unwrap().num_readers += 1;
            entry
        };

        loop {
            let notified = entry.notify.notified();
            {
                let mut c = entry.counters.lock().unwrap();
                if !c.write_locked {
                    c.active_readers += 1;
                    break;
                }
            }
            notified.await;
        }

        FileLock {
            filename: filename.to_string(),
            entry,
        }
    }

    /// §4.2 `end_read`.
    pub async fn end_read(&self, lock: FileLock) {
        let mut map = self.entries.lock().await;
        {
            let mut c = lock.entry.counters.lock().unwrap();
            c.active_readers -= 1;
            c.num_readers -= 1;
        }
        lock.entry.notify.notify_waiters();
        self.gc(&mut map, &lock.filename);
    }

    /// §4.2 `begin_write`. Waits until the write lock is free AND no
    /// reader is active.
    pub async fn begin_write(&self, filename: &str) -> FileLock {
        let entry = {
            let mut map = self.entries.lock().await;
            let entry = map
                .entry(filename.to_string())
                .or_insert_with(|| Arc::new(FileEntry::new()))
                .clone();
            entry.counters.lock().unwrap().num_writers += 1;
            entry
        };

        loop {
            let notified = entry.notify.notified();
            {
                let mut c = entry.counters.lock().unwrap();
                if !c.write_locked && c.active_readers == 0 {
                    c.write_locked = true;
                    break;
                }
            }
            notified.await;
        }

        FileLock {
            filename: filename.to_string(),
            entry,
        }
    }

    /// §4.2 `end_write`.
    pub async fn end_write(&self, lock: FileLock) {
        let mut map = self.entries.lock().await;
        {
            let mut c = lock.entry.counters.lock().unwrap();
            c.num_writers -= 1;
            c.write_locked = false;
        }
        lock.entry.notify.notify_waiters();
        self.gc(&mut map, &lock.filename);
    }

    /// Garbage-collect an idle entry. Must be called with `map` already
    /// locked (every caller above holds it).
    fn gc(&self, map: &mut HashMap<String, Arc<FileEntry>>, filename: &str) {
        let Some(entry) = map.get(filename) else {
            return;
        };
        let c = entry.counters.lock().unwrap();
        if c.num_readers == 0 && c.num_writers == 0 && !c.write_locked {
            drop(c);
            map.remove(filename);
        }
    }
}

impl Default for FileRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// §4.3: dedupes retransmitted initial requests keyed on `(peer, bytes)`.
#[derive(Clone)]
pub struct ClientRegistry {
    active: Arc<Mutex<HashSet<(std::net::SocketAddr, Vec<u8>)>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Registers `(peer, bytes)` if absent. Returns `true` if this is a
    /// new session (caller should proceed), `false` if it is a duplicate
    /// of an in-flight initial request (caller should drop the datagram).
    pub async fn try_register(&self, peer: std::net::SocketAddr, initial_packet: Vec<u8>) -> bool {
        self.active.lock().await.insert((peer, initial_packet))
    }

    pub async fn unregister(&self, peer: std::net::SocketAddr, initial_packet: &[u8]) {
        self.active
            .lock()
            .await
            .remove(&(peer, initial_packet.to_vec()));
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_readers_do_not_block_each_other() {
        let reg = FileRegistry::new();
        let lock_a = reg.begin_read("f").await;
        let second = tokio::time::timeout(Duration::from_millis(200), reg.begin_read("f")).await;
        assert!(second.is_ok(), "second reader should not block on first");
        let lock_b = second.unwrap();
        reg.end_read(lock_a).await;
        reg.end_read(lock_b).await;
    }

    #[tokio::test]
    async fn writer_excludes_reader_until_released() {
        let reg = FileRegistry::new();
        let write_lock = reg.begin_write("f").await;

        let reg2 = reg.clone();
        let reader = tokio::spawn(async move { reg2.begin_read("f").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reader.is_finished(), "reader must wait for writer");

        reg.end_write(write_lock).await;
        let read_lock = tokio::time::timeout(Duration::from_millis(200), reader)
            .await
            .expect("reader should complete after writer releases")
            .unwrap();
        reg.end_read(read_lock).await;
    }

    #[tokio::test]
    async fn reader_excludes_writer_until_released() {
        let reg = FileRegistry::new();
        let read_lock = reg.begin_read("f").await;

        let reg2 = reg.clone();
        let writer = tokio::spawn(async move { reg2.begin_write("f").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished(), "writer must wait for active reader");

        reg.end_read(read_lock).await;
        let write_lock = tokio::time::timeout(Duration::from_millis(200), writer)
            .await
            .expect("writer should complete after reader releases")
            .unwrap();
        reg.end_write(write_lock).await;
    }

    #[tokio::test]
    async fn client_registry_suppresses_duplicate_initial_request() {
        let clients = ClientRegistry::new();
        let peer: std::net::SocketAddr = "127.0.0.1:1234".parse().unwrap();
        let bytes = b"whatever".to_vec();
        assert!(clients.try_register(peer, bytes.clone()).await);
        assert!(!clients.try_register(peer, bytes.clone()).await);
        clients.unregister(peer, &bytes).await;
        assert!(clients.try_register(peer, bytes).await);
    }
}
