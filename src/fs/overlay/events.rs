//! Lifecycle hooks
//!
//! Synchronous, named notification channels. Listeners run in registration
//! order on the calling thread; the first listener error aborts the trigger
//! and is returned to the caller of the filesystem operation.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Hook channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    BeforeRead,
    AfterRead,
    BeforeWrite,
    AfterWrite,
    BeforeDelete,
    AfterDelete,
    AfterMkdir,
    AfterRmdir,
    AfterCopyUp,
}

impl HookEvent {
    pub const ALL: [HookEvent; 9] = [
        HookEvent::BeforeRead,
        HookEvent::AfterRead,
        HookEvent::BeforeWrite,
        HookEvent::AfterWrite,
        HookEvent::BeforeDelete,
        HookEvent::AfterDelete,
        HookEvent::AfterMkdir,
        HookEvent::AfterRmdir,
        HookEvent::AfterCopyUp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::BeforeRead => "before_read",
            HookEvent::AfterRead => "after_read",
            HookEvent::BeforeWrite => "before_write",
            HookEvent::AfterWrite => "after_write",
            HookEvent::BeforeDelete => "before_delete",
            HookEvent::AfterDelete => "after_delete",
            HookEvent::AfterMkdir => "after_mkdir",
            HookEvent::AfterRmdir => "after_rmdir",
            HookEvent::AfterCopyUp => "after_copy_up",
        }
    }
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookEvent {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        HookEvent::ALL
            .iter()
            .copied()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| Error::InvalidOperation(format!("unknown hook event: {}", s)))
    }
}

/// Fields passed to listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookPayload {
    pub event: HookEvent,
    /// Logical path the operation targets
    pub path: PathBuf,
    /// Physical source (copy-up, copy, move)
    pub source: Option<PathBuf>,
    /// Physical destination (copy-up, write)
    pub destination: Option<PathBuf>,
    /// Bytes read or written
    pub bytes: Option<usize>,
}

impl HookPayload {
    pub fn new(event: HookEvent, path: impl Into<PathBuf>) -> Self {
        Self {
            event,
            path: path.into(),
            source: None,
            destination: None,
            bytes: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_bytes(mut self, bytes: usize) -> Self {
        self.bytes = Some(bytes);
        self
    }
}

/// A registered listener
pub type Listener = Arc<dyn Fn(&HookPayload) -> Result<()> + Send + Sync>;

/// Listener registry
#[derive(Default)]
pub struct Hooks {
    listeners: RwLock<HashMap<HookEvent, Vec<Listener>>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `listener` to `event`
    pub fn on<F>(&self, event: HookEvent, listener: F)
    where
        F: Fn(&HookPayload) -> Result<()> + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .entry(event)
            .or_default()
            .push(Arc::new(listener));
    }

    /// Invoke listeners for `payload.event` in registration order
    pub fn trigger(&self, payload: HookPayload) -> Result<()> {
        // clone out so listeners may call back into the filesystem
        let listeners: Vec<Listener> = match self.listeners.read().get(&payload.event) {
            Some(list) => list.clone(),
            None => return Ok(()),
        };

        for listener in listeners {
            listener(&payload)?;
        }
        Ok(())
    }

    /// Remove listeners for one channel, or all channels
    pub fn clear(&self, event: Option<HookEvent>) {
        let mut listeners = self.listeners.write();
        match event {
            Some(event) => {
                listeners.remove(&event);
            }
            None => listeners.clear(),
        }
    }

    pub fn count(&self, event: HookEvent) -> usize {
        self.listeners.read().get(&event).map_or(0, Vec::len)
    }
}
