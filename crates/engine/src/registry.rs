//! Session registry keyed by bus position

use crate::error::SessionError;
use crate::session::DeviceSession;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Where a device sits on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey {
    pub bus: u8,
    pub address: u8,
}

impl DeviceKey {
    pub fn new(bus: u8, address: u8) -> Self {
        Self { bus, address }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}:{:03}", self.bus, self.address)
    }
}

/// Live sessions, one per device
///
/// Lookups hand out shared references; removing a session shuts it down
/// even while other holders keep their reference.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<DeviceKey, Arc<DeviceSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<DeviceKey, Arc<DeviceSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, session: DeviceSession) -> Result<Arc<DeviceSession>, SessionError> {
        let key = session.key();
        let mut sessions = self.sessions();
        if sessions.contains_key(&key) {
            return Err(SessionError::AlreadyRegistered(key));
        }
        let session = Arc::new(session);
        sessions.insert(key, session.clone());
        debug!(session = %key, count = sessions.len(), "Session registered");
        Ok(session)
    }

    pub fn get(&self, key: DeviceKey) -> Option<Arc<DeviceSession>> {
        self.sessions().get(&key).cloned()
    }

    /// Remove and shut down a session
    pub fn remove(&self, key: DeviceKey) -> Option<Arc<DeviceSession>> {
        let session = self.sessions().remove(&key)?;
        session.shutdown();
        info!(session = %key, "Session removed");
        Some(session)
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    /// Registered keys in bus order
    pub fn keys(&self) -> Vec<DeviceKey> {
        let mut keys: Vec<_> = self.sessions().keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn shutdown_all(&self) {
        let drained: Vec<_> = self.sessions().drain().collect();
        for (key, session) in drained {
            debug!(session = %key, "Shutting down");
            session.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display_and_order() {
        let a = DeviceKey::new(1, 4);
        let b = DeviceKey::new(2, 1);
        assert_eq!(a.to_string(), "001:004");
        assert!(a < b);
    }
}
