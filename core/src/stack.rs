//! Eviction stack and the global key ledger.
//!
//! Each consumer (a query instance) owns an [`EvictionStack`]: an ordered,
//! bounded sequence of [`StackFrame`]s, oldest first. A frame is a primary key
//! plus the derived keys of follow-up fetches chained to it.
//!
//! - Switching to a key that is already some frame's primary promotes that
//!   frame to the most-recently-used end instead of duplicating it.
//! - Switching to a new key appends a frame.
//! - A derived key joins the current frame.
//! - After an append, the oldest frames are dropped until the frame count is
//!   back at the stack size. The caller evicts every key of a dropped frame.
//!
//! Several consumers may track the same key, so evicting a frame must not drop
//! a store entry another consumer still tracks. The client keeps a
//! [`KeyLedger`] of every tracked key for that purpose.

use crate::identity::IdentityKey;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::VecDeque;

/// Stack size used when a consumer does not pick one.
pub const DEFAULT_STACK_SIZE: usize = 3;

/// A primary key and its derived follow-up keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    primary: IdentityKey,
    derived: SmallVec<[IdentityKey; 2]>,
}

impl StackFrame {
    /// Frame holding only a primary key.
    #[must_use]
    pub fn new(primary: IdentityKey) -> Self {
        Self {
            primary,
            derived: SmallVec::new(),
        }
    }

    /// The primary key.
    #[must_use]
    pub const fn primary(&self) -> &IdentityKey {
        &self.primary
    }

    /// Derived keys, in the order they were added.
    #[must_use]
    pub fn derived(&self) -> &[IdentityKey] {
        &self.derived
    }

    /// Primary key followed by derived keys.
    pub fn keys(&self) -> impl Iterator<Item = &IdentityKey> {
        std::iter::once(&self.primary).chain(self.derived.iter())
    }

    /// Consume the frame into its keys, primary first.
    #[must_use]
    pub fn into_keys(self) -> Vec<IdentityKey> {
        let mut keys = Vec::with_capacity(1 + self.derived.len());
        keys.push(self.primary);
        keys.extend(self.derived);
        keys
    }
}

/// What [`EvictionStack::activate`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackChange {
    /// The key already was the current primary.
    Unchanged,
    /// An existing frame was moved to the most-recently-used end.
    Promoted,
    /// A new frame was appended; `evicted` holds the frames dropped to get
    /// back under the stack size, oldest first.
    Pushed {
        /// Frames removed from the bottom of the stack
        evicted: Vec<StackFrame>,
    },
}

impl StackChange {
    /// Frames dropped by this change.
    #[must_use]
    pub fn evicted(&self) -> &[StackFrame] {
        match self {
            Self::Pushed { evicted } => evicted,
            Self::Unchanged | Self::Promoted => &[],
        }
    }
}

/// Bounded, ordered sequence of stack frames.
///
/// # Examples
///
/// ```
/// use fetch_cache_core::identity::IdentityKey;
/// use fetch_cache_core::stack::EvictionStack;
///
/// let mut stack = EvictionStack::new(3);
/// for key in ["A", "B", "C", "D"] {
///     stack.activate(IdentityKey::new(key));
/// }
///
/// let primaries: Vec<_> = stack.frames().map(|f| f.primary().as_str()).collect();
/// assert_eq!(primaries, ["B", "C", "D"]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionStack {
    frames: VecDeque<StackFrame>,
    stack_size: usize,
}

impl EvictionStack {
    /// Empty stack keeping at most `stack_size` frames (at least one).
    #[must_use]
    pub fn new(stack_size: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            stack_size: stack_size.max(1),
        }
    }

    /// Maximum number of frames.
    #[must_use]
    pub const fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Make `key` the current primary key.
    pub fn activate(&mut self, key: IdentityKey) -> StackChange {
        if self.current().is_some_and(|frame| frame.primary == key) {
            return StackChange::Unchanged;
        }

        if let Some(index) = self.frames.iter().position(|frame| frame.primary == key) {
            if let Some(frame) = self.frames.remove(index) {
                self.frames.push_back(frame);
            }
            return StackChange::Promoted;
        }

        self.frames.push_back(StackFrame::new(key));

        let overflow = self.frames.len().saturating_sub(self.stack_size);
        let evicted: Vec<StackFrame> = self.frames.drain(..overflow).collect();
        StackChange::Pushed { evicted }
    }

    /// Attach a derived key to the current frame.
    ///
    /// Returns `false` when there is no current frame or the frame already
    /// holds the key.
    pub fn push_derived(&mut self, key: IdentityKey) -> bool {
        match self.frames.back_mut() {
            Some(frame) if !frame.keys().any(|existing| *existing == key) => {
                frame.derived.push(key);
                true
            },
            _ => false,
        }
    }

    /// The most recently used frame.
    #[must_use]
    pub fn current(&self) -> Option<&StackFrame> {
        self.frames.back()
    }

    /// Frames, oldest first.
    pub fn frames(&self) -> impl Iterator<Item = &StackFrame> {
        self.frames.iter()
    }

    /// Every key across all frames, oldest frame first.
    #[must_use]
    pub fn keys(&self) -> Vec<IdentityKey> {
        self.frames.iter().flat_map(StackFrame::keys).cloned().collect()
    }

    /// Number of frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the stack holds no frames.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Remove and return every frame, oldest first.
    pub fn drain(&mut self) -> Vec<StackFrame> {
        self.frames.drain(..).collect()
    }
}

impl Default for EvictionStack {
    fn default() -> Self {
        Self::new(DEFAULT_STACK_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LedgerEntry {
    key: IdentityKey,
    claimed: bool,
}

/// Ordered record of every key tracked by any eviction stack.
///
/// There is one entry per tracking frame, so a key tracked by two consumers
/// appears twice. Entries restored from a snapshot start out unclaimed: the
/// first consumer to retain such a key claims the existing entry instead of
/// appending a new one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyLedger {
    entries: Vec<LedgerEntry>,
}

impl KeyLedger {
    /// Empty ledger.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Ledger of unclaimed entries restored from a snapshot.
    #[must_use]
    pub fn restored(keys: Vec<IdentityKey>) -> Self {
        Self {
            entries: keys
                .into_iter()
                .map(|key| LedgerEntry {
                    key,
                    claimed: false,
                })
                .collect(),
        }
    }

    /// Record that a consumer tracks `key`.
    pub fn retain(&mut self, key: &IdentityKey) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| !entry.claimed && entry.key == *key)
        {
            entry.claimed = true;
            return;
        }

        self.entries.push(LedgerEntry {
            key: key.clone(),
            claimed: true,
        });
    }

    /// Record that a consumer stopped tracking `key`.
    ///
    /// Returns `true` when no entry for `key` remains, meaning the caller
    /// should evict it from the store.
    pub fn release(&mut self, key: &IdentityKey) -> bool {
        let position = self
            .entries
            .iter()
            .position(|entry| entry.claimed && entry.key == *key)
            .or_else(|| self.entries.iter().position(|entry| entry.key == *key));

        if let Some(index) = position {
            self.entries.remove(index);
        }

        !self.contains(key)
    }

    /// Whether any entry tracks `key`.
    #[must_use]
    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.entries.iter().any(|entry| entry.key == *key)
    }

    /// Tracked keys in order, duplicates included.
    #[must_use]
    pub fn keys(&self) -> Vec<IdentityKey> {
        self.entries.iter().map(|entry| entry.key.clone()).collect()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ledger is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
