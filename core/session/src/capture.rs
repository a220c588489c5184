//! Capture multiplexer: one switch over every hookable event source.
//!
//! All sources are hooked or unhooked together. Whatever the host observes
//! through an active [`SourceTap`] lands in a single [`CaptureQueue`], so
//! local order is preserved across sources. The controller drains that queue
//! on the loop thread.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use tandem_protocol::ArtifactEvent;
use tracing::{debug, error};

use crate::error::{Result, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Database,
    Processor,
    Decompiler,
    View,
    Ui,
}

impl SourceKind {
    pub const ALL: [SourceKind; 5] = [
        SourceKind::Database,
        SourceKind::Processor,
        SourceKind::Decompiler,
        SourceKind::View,
        SourceKind::Ui,
    ];
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceKind::Database => "database",
            SourceKind::Processor => "processor",
            SourceKind::Decompiler => "decompiler",
            SourceKind::View => "view",
            SourceKind::Ui => "ui",
        };
        f.write_str(name)
    }
}

/// A host event source that can be subscribed to and unsubscribed from.
/// Both operations must be idempotent.
pub trait EventSource {
    fn kind(&self) -> SourceKind;
    fn hook(&mut self) -> std::result::Result<(), String>;
    fn unhook(&mut self);
}

#[derive(Debug, Clone, Default)]
pub struct CaptureQueue(Rc<RefCell<VecDeque<ArtifactEvent>>>);

impl CaptureQueue {
    fn push(&self, event: ArtifactEvent) {
        self.0.borrow_mut().push_back(event);
    }

    pub fn drain(&self) -> Vec<ArtifactEvent> {
        self.0.borrow_mut().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }
}

/// Handle the host calls with every mutation a source observes. Recording
/// through an unhooked tap is a no-op.
#[derive(Debug, Clone)]
pub struct SourceTap {
    kind: SourceKind,
    active: Rc<Cell<bool>>,
    queue: CaptureQueue,
}

impl SourceTap {
    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    /// Returns whether the event was captured.
    pub fn record(&self, event: ArtifactEvent) -> bool {
        if !self.active.get() {
            return false;
        }
        self.queue.push(event);
        true
    }
}

/// Built-in source for hosts that push mutations through a [`SourceTap`]
/// instead of exposing their own hook API.
#[derive(Debug)]
pub struct TapSource {
    kind: SourceKind,
    active: Rc<Cell<bool>>,
}

impl EventSource for TapSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn hook(&mut self) -> std::result::Result<(), String> {
        self.active.set(true);
        Ok(())
    }

    fn unhook(&mut self) {
        self.active.set(false);
    }
}

#[derive(Default)]
pub struct CaptureMultiplexer {
    sources: Vec<Box<dyn EventSource>>,
    enabled: bool,
    queue: CaptureQueue,
}

impl CaptureMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A multiplexer with one tap per [`SourceKind`].
    pub fn with_taps() -> (Self, Vec<SourceTap>) {
        let mut capture = Self::new();
        let taps = SourceKind::ALL
            .iter()
            .map(|kind| capture.add_tap(*kind))
            .collect();
        (capture, taps)
    }

    /// Sources must be added while capture is disabled.
    pub fn add_source(&mut self, source: Box<dyn EventSource>) {
        debug_assert!(!self.enabled, "source added while capture is enabled");
        self.sources.push(source);
    }

    pub fn add_tap(&mut self, kind: SourceKind) -> SourceTap {
        let active = Rc::new(Cell::new(false));
        self.add_source(Box::new(TapSource {
            kind,
            active: Rc::clone(&active),
        }));
        SourceTap {
            kind,
            active,
            queue: self.queue.clone(),
        }
    }

    pub fn queue(&self) -> CaptureQueue {
        self.queue.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Hooks every source. If any source fails, the ones already hooked are
    /// unhooked again and capture stays disabled.
    pub fn enable_all(&mut self) -> Result<()> {
        if self.enabled {
            return Ok(());
        }
        for index in 0..self.sources.len() {
            if let Err(message) = self.sources[index].hook() {
                let kind = self.sources[index].kind();
                for source in self.sources[..index].iter_mut().rev() {
                    source.unhook();
                }
                return Err(SessionError::Hook { kind, message });
            }
        }
        self.enabled = true;
        debug!(sources = self.sources.len(), "Capture enabled");
        Ok(())
    }

    pub fn disable_all(&mut self) {
        if !self.enabled {
            return;
        }
        for source in self.sources.iter_mut().rev() {
            source.unhook();
        }
        self.enabled = false;
        debug!(sources = self.sources.len(), "Capture disabled");
    }

    /// Suspends capture until the returned guard drops, then restores the
    /// previous state.
    pub fn suspend(&mut self) -> ReplayGuard<'_> {
        let resume = self.enabled;
        self.disable_all();
        ReplayGuard {
            capture: self,
            resume,
        }
    }

    pub fn drain(&self) -> Vec<ArtifactEvent> {
        self.queue.drain()
    }
}

/// Echo suppression scope for applying a remote event.
pub struct ReplayGuard<'a> {
    capture: &'a mut CaptureMultiplexer,
    resume: bool,
}

impl Drop for ReplayGuard<'_> {
    fn drop(&mut self) {
        if !self.resume {
            return;
        }
        if let Err(err) = self.capture.enable_all() {
            // Capture must never stay off after a replay.
            error!(error = %err, "Failed to restore capture after replay; aborting");
            std::process::abort();
        }
    }
}
