//! Identifiers for registration flows.
//!
//! Every flow kind gets its own newtype so a background id can never be
//! passed where a beacon id is expected. All of them are `Copy`, hashable and
//! serialize transparently.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlates one navigation-tied registration family across its
/// foreground and background legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributionSrcToken(Uuid);

impl AttributionSrcToken {
    /// Generate a fresh random token.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AttributionSrcToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AttributionSrcToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for AttributionSrcToken {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident($inner:ty), $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name($inner);

        impl $name {
            #[must_use]
            pub const fn new(value: $inner) -> Self {
                Self(value)
            }

            #[must_use]
            pub const fn get(self) -> $inner {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

numeric_id!(
    /// Browser navigation identifier.
    NavigationId(i64),
    "nav"
);
numeric_id!(
    /// One background keep-alive registration request.
    BackgroundRegistrationId(u64),
    "bg"
);
numeric_id!(
    /// One fenced-frame reporting beacon.
    BeaconId(u64),
    "beacon"
);
numeric_id!(
    /// Handle for a registered channel, issued by the coordinator.
    ChannelId(u64),
    "channel"
);

/// Identity of the frame that issued a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrameId {
    pub child_id: i32,
    pub frame_routing_id: i32,
}

impl FrameId {
    #[must_use]
    pub const fn new(child_id: i32, frame_routing_id: i32) -> Self {
        Self {
            child_id,
            frame_routing_id,
        }
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame-{}:{}", self.child_id, self.frame_routing_id)
    }
}

/// Monotonic allocator for background registration ids.
///
/// Shared by every clone of a coordinator handle so ids stay unique per
/// coordinator instance.
#[derive(Debug)]
pub struct BackgroundIdAllocator {
    next: AtomicU64,
}

impl Default for BackgroundIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundIdAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn allocate(&self) -> BackgroundRegistrationId {
        BackgroundRegistrationId::new(self.next.fetch_add(1, Ordering::Relaxed))
    }
}
