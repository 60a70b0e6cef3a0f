//! Locator / naming collaborator
//!
//! A tiny directory plus mutual-exclusion service consulted only at
//! bootstrap: newcomers read the known instance URLs from it, the first
//! instance to lock it wins the right to create the ring, and the system
//! table host publishes its replica locations there.

use crate::error::{Result, RingDbError, StartupError};
use crate::types::DatabaseId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

#[async_trait]
pub trait LocatorService: Send + Sync {
    /// URLs of instances known to hold the system table (or to be alive)
    async fn get_locations(&self) -> Result<Vec<String>>;

    async fn set_locations(&self, urls: Vec<String>) -> Result<()>;

    /// Try to take the creation lock for `requester`
    async fn lock_locators(&self, requester: &DatabaseId) -> Result<bool>;

    /// Release the creation lock after the ring exists
    async fn commit_locators(&self, requester: &DatabaseId) -> Result<bool>;
}

#[derive(Default)]
struct LocatorState {
    locations: Vec<String>,
    lock_holder: Option<DatabaseId>,
}

/// In-process locator shared by every instance of an embedded cluster
#[derive(Default)]
pub struct InMemoryLocator {
    state: Mutex<LocatorState>,
    unreachable: AtomicBool,
}

impl InMemoryLocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_locations(locations: Vec<String>) -> Self {
        let locator = Self::default();
        locator.state.lock().locations = locations;
        locator
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn lock_holder(&self) -> Option<DatabaseId> {
        self.state.lock().lock_holder.clone()
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StartupError::LocatorUnreachable("in-memory locator switched off".to_string()).into());
        }
        Ok(())
    }
}

#[async_trait]
impl LocatorService for InMemoryLocator {
    async fn get_locations(&self) -> Result<Vec<String>> {
        self.check_reachable()?;
        Ok(self.state.lock().locations.clone())
    }

    async fn set_locations(&self, urls: Vec<String>) -> Result<()> {
        self.check_reachable()?;
        tracing::debug!(locations = ?urls, "locator updated");
        self.state.lock().locations = urls;
        Ok(())
    }

    async fn lock_locators(&self, requester: &DatabaseId) -> Result<bool> {
        self.check_reachable()?;
        let mut state = self.state.lock();
        match &state.lock_holder {
            Some(holder) if holder != requester => Ok(false),
            _ => {
                state.lock_holder = Some(requester.clone());
                Ok(true)
            }
        }
    }

    async fn commit_locators(&self, requester: &DatabaseId) -> Result<bool> {
        self.check_reachable()?;
        let mut state = self.state.lock();
        match &state.lock_holder {
            Some(holder) if holder == requester => {
                state.lock_holder = None;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(RingDbError::Internal("commit_locators without holding the lock".to_string())),
        }
    }
}
