use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use crate::{MemoryDb, MemoryError};

/// Background write-back worker.
///
/// Wakes every `interval`, takes the database lock and flushes if there are
/// unsaved writes. Holding the lock for the flush means it never overlaps a
/// store or forget. Stopping (or dropping) the worker wakes it immediately and
/// joins the thread.
pub struct AutoSaver {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl AutoSaver {
    pub fn spawn(db: Arc<Mutex<MemoryDb>>, interval: Duration) -> Result<Self, MemoryError> {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name("memstash-autosave".into())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => tick(&db),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(MemoryError::Worker)?;
        debug!(?interval, "auto-save worker started");
        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("auto-save worker panicked");
            }
            debug!("auto-save worker stopped");
        }
    }
}

impl Drop for AutoSaver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn tick(db: &Mutex<MemoryDb>) {
    let Ok(mut db) = db.lock() else {
        warn!("auto-save skipped: memory store lock poisoned");
        return;
    };
    if !db.is_ready() {
        return;
    }
    match db.flush_if_dirty() {
        Ok(true) => debug!("auto-save flushed pending writes"),
        Ok(false) => {}
        Err(e) => warn!(error = %e, "auto-save flush failed, will retry next tick"),
    }
}
