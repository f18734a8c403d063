//! Identity, handle and flag types shared between the engine and providers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Stable identity of a discovery operation.
///
/// The token is handed to the provider when the operation starts and comes
/// back unchanged with every result, so the multiplexer can route the result
/// to the operation that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(u64);

impl OpId {
    /// Allocates a process-unique identity.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Wraps a raw identity value.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw identity value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Opaque handle issued by a provider.
///
/// Handles are neither `Copy` nor `Clone`: whoever holds one is responsible for
/// giving it back to the provider exactly once.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct NativeHandle(u64);

impl NativeHandle {
    /// Wraps a provider-specific raw handle value.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the provider-specific raw handle value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Network interface an operation is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct InterfaceIndex(u32);

impl InterfaceIndex {
    /// All interfaces. This is the default for every operation.
    pub const ANY: Self = Self(0);

    /// Restricts the operation to the local machine.
    pub const LOCAL_ONLY: Self = Self(u32::MAX);

    /// Creates an interface index from its OS value.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the value passed to the provider.
    pub fn get(&self) -> u32 {
        self.0
    }

    pub fn is_any(&self) -> bool {
        *self == Self::ANY
    }
}

impl From<u32> for InterfaceIndex {
    fn from(index: u32) -> Self {
        Self(index)
    }
}

impl fmt::Display for InterfaceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ANY => write!(f, "any"),
            Self::LOCAL_ONLY => write!(f, "local-only"),
            Self(index) => write!(f, "{}", index),
        }
    }
}

/// Request and reply flags exchanged with the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Flags(u32);

impl Flags {
    /// On replies: the result was added rather than removed.
    pub const ADD: Self = Self(0x2);

    /// On registration: report name conflicts instead of renaming.
    pub const NO_AUTO_RENAME: Self = Self(0x8);

    /// On requests: the operation runs on the shared connection.
    pub const SHARE_CONNECTION: Self = Self(0x4000);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets or clears `flag`.
    pub fn set(&mut self, flag: Self, enabled: bool) {
        if enabled {
            self.0 |= flag.0;
        } else {
            self.0 &= !flag.0;
        }
    }

    /// Returns a copy with `flag` set or cleared.
    pub fn with(mut self, flag: Self, enabled: bool) -> Self {
        self.set(flag, enabled);
        self
    }
}

impl BitOr for Flags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}
