//! Bounded pool of authenticated portal sessions.
//!
//! A session is checked out for the length of one scrape loop and comes back
//! when its [`SessionGuard`] drops, on every exit path including errors and
//! cancelled futures.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::info;

use crate::traits::{PortalSession, SessionFactory};

pub struct SessionPool<S> {
    idle: Mutex<Vec<S>>,
    permits: Semaphore,
    size: usize,
}

impl<S: PortalSession> SessionPool<S> {
    /// Create `size` sessions and renew each one up front so the first
    /// request on each doesn't land on a stale login.
    pub async fn create<F>(factory: &F, size: usize) -> Result<Self>
    where
        F: SessionFactory<Session = S>,
    {
        let size = size.max(1);
        let mut sessions = Vec::with_capacity(size);
        for _ in 0..size {
            let mut session = factory.create()?;
            session.renew().await?;
            sessions.push(session);
        }
        info!(size, "Session pool ready");
        Ok(Self::from_sessions(sessions))
    }

    /// Wrap already-prepared sessions.
    pub fn from_sessions(sessions: Vec<S>) -> Self {
        let size = sessions.len();
        Self {
            idle: Mutex::new(sessions),
            permits: Semaphore::new(size),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Sessions currently checked in.
    pub fn available(&self) -> usize {
        self.idle_sessions().len()
    }

    /// Wait for a free session.
    pub async fn checkout(&self) -> Result<SessionGuard<'_, S>> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| anyhow!("session pool closed"))?;
        let session = self
            .idle_sessions()
            .pop()
            .ok_or_else(|| anyhow!("session pool permit granted with no idle session"))?;
        Ok(SessionGuard {
            pool: self,
            session: Some(session),
            _permit: permit,
        })
    }

    fn idle_sessions(&self) -> MutexGuard<'_, Vec<S>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Exclusive use of one pooled session.
pub struct SessionGuard<'a, S: PortalSession> {
    pool: &'a SessionPool<S>,
    session: Option<S>,
    // Released after `drop` has put the session back.
    _permit: SemaphorePermit<'a>,
}

impl<S: PortalSession> Deref for SessionGuard<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.session.as_ref().expect("session present until drop")
    }
}

impl<S: PortalSession> DerefMut for SessionGuard<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        self.session.as_mut().expect("session present until drop")
    }
}

impl<S: PortalSession> Drop for SessionGuard<'_, S> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.idle_sessions().push(session);
        }
    }
}
