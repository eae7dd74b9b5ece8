pub mod sqlite;

pub use sqlite::SqliteBackend;

use crate::error::{FairSlotError, Result};
use crate::session::Session;
use crate::types::{Address, Role};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Durable home for committed sessions.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn save(&self, session: &Session) -> Result<()>;
    async fn delete(&self, address: &Address) -> Result<()>;
    async fn load_all(&self) -> Result<Vec<Session>>;
}

/// Sessions keyed by contract address. Mutation of one address is
/// serialized; different addresses never wait on each other.
pub struct SessionStore {
    rounds_per_chain: u32,
    sessions: RwLock<HashMap<Address, Arc<Mutex<Session>>>>,
    backend: Option<Arc<dyn SessionBackend>>,
}

impl SessionStore {
    pub fn in_memory(rounds_per_chain: u32) -> Self {
        Self {
            rounds_per_chain,
            sessions: RwLock::new(HashMap::new()),
            backend: None,
        }
    }

    /// Open a store over `backend`, loading every session it retained.
    pub async fn open(rounds_per_chain: u32, backend: Arc<dyn SessionBackend>) -> Result<Self> {
        let restored = backend.load_all().await?;

        let mut sessions = HashMap::new();
        for session in restored {
            sessions.insert(session.address, Arc::new(Mutex::new(session)));
        }

        tracing::info!("Session store opened with {} retained sessions", sessions.len());

        Ok(Self {
            rounds_per_chain,
            sessions: RwLock::new(sessions),
            backend: Some(backend),
        })
    }

    fn entry(&self, address: &Address) -> Result<Arc<Mutex<Session>>> {
        self.sessions
            .read()
            .get(address)
            .cloned()
            .ok_or(FairSlotError::UnknownSession(*address))
    }

    /// Create the session for `address`, or return the existing one.
    pub async fn create(&self, address: Address, role: Role) -> Result<Session> {
        if let Ok(existing) = self.entry(&address) {
            let session = existing.lock().await.clone();
            if session.role != role {
                return Err(FairSlotError::invalid_state(format!(
                    "Session {} already exists as {}",
                    address, session.role
                )));
            }
            tracing::debug!("Session {} already exists", address);
            return Ok(session);
        }

        let session = Session::new(address, role, self.rounds_per_chain);
        if let Some(backend) = &self.backend {
            backend.save(&session).await?;
        }

        let created = {
            let mut sessions = self.sessions.write();
            sessions
                .entry(address)
                .or_insert_with(|| Arc::new(Mutex::new(session)))
                .clone()
        };

        tracing::info!("Created {} session for {}", role, address);
        let session = created.lock().await.clone();
        Ok(session)
    }

    /// Snapshot of the session.
    pub async fn get(&self, address: &Address) -> Result<Session> {
        let entry = self.entry(address)?;
        let session = entry.lock().await.clone();
        Ok(session)
    }

    /// Take the per-address lock. Changes become visible only through
    /// [`SessionGuard::commit`]; dropping the guard discards them.
    pub async fn lock(&self, address: &Address) -> Result<SessionGuard> {
        let entry = self.entry(address)?;
        let guard = entry.lock_owned().await;
        Ok(SessionGuard {
            guard,
            backend: self.backend.clone(),
        })
    }

    /// Atomic read-modify-write. The session is untouched if `f` fails.
    pub async fn mutate<R, F>(&self, address: &Address, f: F) -> Result<R>
    where
        F: FnOnce(&mut Session) -> Result<R>,
    {
        let guard = self.lock(address).await?;
        let mut working = guard.snapshot();
        let out = f(&mut working)?;
        guard.commit(working).await?;
        Ok(out)
    }

    pub async fn reset(&self, address: &Address) -> Result<Session> {
        self.mutate(address, |session| {
            session.reset();
            Ok(session.clone())
        })
        .await
    }

    /// Forget the session entirely.
    pub async fn remove(&self, address: &Address) -> Result<()> {
        let removed = self.sessions.write().remove(address);
        if removed.is_none() {
            return Err(FairSlotError::UnknownSession(*address));
        }
        if let Some(backend) = &self.backend {
            backend.delete(address).await?;
        }
        Ok(())
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.sessions.read().contains_key(address)
    }

    pub fn addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> = self.sessions.read().keys().copied().collect();
        addresses.sort();
        addresses
    }

    pub async fn list(&self) -> Vec<Session> {
        let entries: Vec<Arc<Mutex<Session>>> = {
            let sessions = self.sessions.read();
            let mut pairs: Vec<_> = sessions.iter().collect();
            pairs.sort_by_key(|(address, _)| **address);
            pairs.into_iter().map(|(_, entry)| entry.clone()).collect()
        };

        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            out.push(entry.lock().await.clone());
        }
        out
    }
}

/// Exclusive access to one session.
pub struct SessionGuard {
    guard: OwnedMutexGuard<Session>,
    backend: Option<Arc<dyn SessionBackend>>,
}

impl SessionGuard {
    pub fn snapshot(&self) -> Session {
        self.guard.clone()
    }

    /// Persist `session` and make it the current state.
    pub async fn commit(mut self, session: Session) -> Result<()> {
        if let Some(backend) = &self.backend {
            backend.save(&session).await?;
        }
        *self.guard = session;
        Ok(())
    }
}

impl Deref for SessionGuard {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.guard
    }
}
