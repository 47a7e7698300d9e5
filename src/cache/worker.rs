use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crate::cache::flight::Flight;
use crate::cache::tier::TierKey;
use crate::cache::CacheShared;

pub(crate) struct BuildJob {
    pub key: TierKey,
    pub flight: Arc<Flight>,
}

/// Background threads draining a shared queue of tile builds.
pub(crate) struct WorkerPool {
    sender: Option<Sender<BuildJob>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn(count: usize, shared: &Arc<CacheShared>) -> Self {
        let (tx, rx) = mpsc::channel::<BuildJob>();
        let rx = Arc::new(Mutex::new(rx));
        let handles: Vec<JoinHandle<()>> = (0..count)
            .filter_map(|idx| {
                let rx = rx.clone();
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("tier-builder-{idx}"))
                    .spawn(move || worker_loop(&rx, &shared))
                    .map_err(|err| log::warn!("failed to start tier builder {idx}: {err}"))
                    .ok()
            })
            .collect();
        let sender = if handles.is_empty() { None } else { Some(tx) };
        Self { sender, handles }
    }

    /// Hands the job back when no worker can take it.
    pub(crate) fn submit(&self, job: BuildJob) -> Result<(), BuildJob> {
        match &self.sender {
            Some(tx) => tx.send(job).map_err(|err| err.0),
            None => Err(job),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                log::warn!("tier builder panicked");
            }
        }
    }
}

fn worker_loop(rx: &Mutex<Receiver<BuildJob>>, shared: &CacheShared) {
    loop {
        let job = {
            let rx = rx.lock().unwrap_or_else(PoisonError::into_inner);
            rx.recv()
        };
        match job {
            Ok(job) => shared.run_job(job),
            Err(_) => break,
        }
    }
    log::debug!("tier builder exiting");
}
