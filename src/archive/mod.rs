mod http;
mod sqlite;

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::model::HistoryItem;

pub use http::HttpArchive;
pub use sqlite::SqliteArchive;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("invalid archive url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("archive request failed")]
    Http(#[from] reqwest::Error),
    #[error("archive responded with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode archived run")]
    Decode(#[from] serde_json::Error),
    #[error("archive database error")]
    Storage(#[from] rusqlite::Error),
    #[error("archive worker unavailable")]
    Worker(#[from] std::io::Error),
}

/// Storage for completed runs.
pub trait Archive {
    /// All runs, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error when the archive cannot be read.
    fn list(&self) -> Result<Vec<HistoryItem>, ArchiveError>;

    /// # Errors
    ///
    /// Returns an error when the archive cannot be read.
    fn fetch(&self, id: &str) -> Result<Option<HistoryItem>, ArchiveError>;

    /// # Errors
    ///
    /// Returns an error when the archive rejects the deletion.
    fn delete(&self, id: &str) -> Result<(), ArchiveError>;

    /// Remove every run, returning how many were removed. Stops at the first
    /// deletion the archive rejects.
    ///
    /// # Errors
    ///
    /// Returns an error when listing or any deletion fails.
    fn clear(&self) -> Result<usize, ArchiveError> {
        let items = self.list()?;
        for item in &items {
            self.delete(&item.id)?;
        }
        Ok(items.len())
    }
}

impl<A: Archive + ?Sized> Archive for Box<A> {
    fn list(&self) -> Result<Vec<HistoryItem>, ArchiveError> {
        (**self).list()
    }

    fn fetch(&self, id: &str) -> Result<Option<HistoryItem>, ArchiveError> {
        (**self).fetch(id)
    }

    fn delete(&self, id: &str) -> Result<(), ArchiveError> {
        (**self).delete(id)
    }

    fn clear(&self) -> Result<usize, ArchiveError> {
        (**self).clear()
    }
}

/// Outcome of a queued history request, reported by
/// [`HistoryRepository::pump`] once it has been applied to the local list.
#[derive(Debug)]
pub enum ArchiveUpdate {
    Refreshed { count: usize },
    RefreshFailed(ArchiveError),
    Deleted { id: String },
    DeleteFailed { id: String, error: ArchiveError },
}

enum Job {
    List,
    Delete(String),
}

enum Reply {
    Listed(Result<Vec<HistoryItem>, ArchiveError>),
    Deleted {
        id: String,
        result: Result<(), ArchiveError>,
    },
}

/// Local view over an [`Archive`], independent of any live session.
///
/// `refresh`, `fetch` and `delete` call the archive on the caller's thread.
/// `request_refresh` and `request_delete` hand the call to a worker thread
/// and return at once; their outcomes are applied when [`pump`](Self::pump)
/// or [`wait`](Self::wait) picks them up.
pub struct HistoryRepository<A> {
    archive: Arc<Mutex<A>>,
    items: Vec<HistoryItem>,
    last_error: Option<String>,
    jobs: Option<Sender<Job>>,
    replies_tx: Sender<Reply>,
    replies: Receiver<Reply>,
    pending: usize,
}

impl<A: Archive> HistoryRepository<A> {
    pub fn new(archive: A) -> Self {
        let (replies_tx, replies) = mpsc::channel();
        Self {
            archive: Arc::new(Mutex::new(archive)),
            items: Vec::new(),
            last_error: None,
            jobs: None,
            replies_tx,
            replies,
            pending: 0,
        }
    }

    /// Replace the local list with the archive's current contents. On failure
    /// the list is emptied and the error remembered.
    ///
    /// # Errors
    ///
    /// Returns the archive error after recording it.
    pub fn refresh(&mut self) -> Result<&[HistoryItem], ArchiveError> {
        let listed = self.archive().list();
        self.apply_listing(listed)?;
        Ok(&self.items)
    }

    #[must_use]
    pub fn items(&self) -> &[HistoryItem] {
        &self.items
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&HistoryItem> {
        self.items.iter().find(|item| item.id == id)
    }

    /// Fetch one run straight from the archive, bypassing the local list.
    ///
    /// # Errors
    ///
    /// Returns an error when the archive cannot be read.
    pub fn fetch(&self, id: &str) -> Result<Option<HistoryItem>, ArchiveError> {
        self.archive().fetch(id)
    }

    /// Delete a run. The local list only changes once the archive confirms.
    ///
    /// # Errors
    ///
    /// Returns the archive error; the local list is left as it was.
    pub fn delete(&mut self, id: &str) -> Result<(), ArchiveError> {
        let result = self.archive().delete(id);
        self.apply_deletion(id, result)
    }

    /// Remove every archived run and empty the local list.
    ///
    /// # Errors
    ///
    /// Returns the archive error. The local list is reloaded so it shows
    /// whatever survived.
    pub fn clear(&mut self) -> Result<usize, ArchiveError> {
        let cleared = self.archive().clear();
        match cleared {
            Ok(count) => {
                self.items.clear();
                self.last_error = None;
                debug!(count, "history cleared");
                Ok(count)
            }
            Err(err) => {
                warn!(error = %err, "failed to clear history");
                let _ = self.refresh();
                self.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Apply every outcome the worker has reported so far, without blocking.
    pub fn pump(&mut self) -> Vec<ArchiveUpdate> {
        let mut updates = Vec::new();
        while let Ok(reply) = self.replies.try_recv() {
            updates.push(self.apply(reply));
        }
        updates
    }

    /// Block up to `timeout` for the next outcome, then drain the rest.
    pub fn wait(&mut self, timeout: Duration) -> Vec<ArchiveUpdate> {
        if self.pending == 0 {
            return Vec::new();
        }
        match self.replies.recv_timeout(timeout) {
            Ok(reply) => {
                let mut updates = vec![self.apply(reply)];
                updates.extend(self.pump());
                updates
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => Vec::new(),
        }
    }

    /// Whether a queued request has not reported back yet.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending > 0
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Direct access to the archive. Blocks while the worker is mid-request.
    pub fn archive(&self) -> MutexGuard<'_, A> {
        self.archive.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&mut self, reply: Reply) -> ArchiveUpdate {
        self.pending = self.pending.saturating_sub(1);
        match reply {
            Reply::Listed(listed) => match self.apply_listing(listed) {
                Ok(()) => ArchiveUpdate::Refreshed {
                    count: self.items.len(),
                },
                Err(err) => ArchiveUpdate::RefreshFailed(err),
            },
            Reply::Deleted { id, result } => match self.apply_deletion(&id, result) {
                Ok(()) => ArchiveUpdate::Deleted { id },
                Err(error) => ArchiveUpdate::DeleteFailed { id, error },
            },
        }
    }

    fn apply_listing(
        &mut self,
        listed: Result<Vec<HistoryItem>, ArchiveError>,
    ) -> Result<(), ArchiveError> {
        match listed {
            Ok(items) => {
                debug!(count = items.len(), "history refreshed");
                self.items = items;
                self.last_error = None;
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "failed to load history");
                self.items.clear();
                self.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    fn apply_deletion(
        &mut self,
        id: &str,
        result: Result<(), ArchiveError>,
    ) -> Result<(), ArchiveError> {
        match result {
            Ok(()) => {
                self.items.retain(|item| item.id != id);
                self.last_error = None;
                debug!(id, "history item deleted");
                Ok(())
            }
            Err(err) => {
                warn!(id, error = %err, "failed to delete history item");
                self.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }
}

impl<A: Archive + Send + 'static> HistoryRepository<A> {
    /// Queue a reload of the local list. Reported as
    /// [`ArchiveUpdate::Refreshed`] or [`ArchiveUpdate::RefreshFailed`].
    ///
    /// # Errors
    ///
    /// Returns an error when the worker thread cannot be started.
    pub fn request_refresh(&mut self) -> Result<(), ArchiveError> {
        self.submit(Job::List)
    }

    /// Queue a deletion. Reported as [`ArchiveUpdate::Deleted`] or
    /// [`ArchiveUpdate::DeleteFailed`].
    ///
    /// # Errors
    ///
    /// Returns an error when the worker thread cannot be started.
    pub fn request_delete(&mut self, id: impl Into<String>) -> Result<(), ArchiveError> {
        self.submit(Job::Delete(id.into()))
    }

    fn submit(&mut self, job: Job) -> Result<(), ArchiveError> {
        let jobs = match self.jobs.take() {
            Some(jobs) => jobs,
            None => self.spawn_worker()?,
        };
        if let Err(mpsc::SendError(job)) = jobs.send(job) {
            // The worker died mid-request; start a fresh one for this job.
            warn!("archive worker exited; restarting");
            let jobs = self.spawn_worker()?;
            jobs.send(job)
                .map_err(|_| std::io::Error::other("archive worker exited"))?;
            self.jobs = Some(jobs);
        } else {
            self.jobs = Some(jobs);
        }
        self.pending += 1;
        Ok(())
    }

    fn spawn_worker(&self) -> Result<Sender<Job>, ArchiveError> {
        let (jobs, queue) = mpsc::channel();
        let archive = Arc::clone(&self.archive);
        let replies = self.replies_tx.clone();
        thread::Builder::new()
            .name("odeon-archive".to_string())
            .spawn(move || run_worker(&archive, &queue, &replies))?;
        Ok(jobs)
    }
}

/// Serve jobs in submission order until the repository goes away.
fn run_worker<A: Archive>(archive: &Mutex<A>, queue: &Receiver<Job>, replies: &Sender<Reply>) {
    for job in queue {
        let reply = {
            let archive = archive.lock().unwrap_or_else(PoisonError::into_inner);
            match job {
                Job::List => Reply::Listed(archive.list()),
                Job::Delete(id) => {
                    let result = archive.delete(&id);
                    Reply::Deleted { id, result }
                }
            }
        };
        if replies.send(reply).is_err() {
            break;
        }
    }
    debug!("archive worker stopped");
}
