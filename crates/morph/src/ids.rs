//! Strongly typed identifiers and the wrapping generator that hands them out.

use std::fmt;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub i32);

        impl $name {
            pub fn value(self) -> i32 {
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

id_type!(
    /// Process-wide apartment ID. Zero never names a live apartment.
    ApartmentId,
    "apartment"
);
id_type!(
    /// Servlet ID within one apartment. Zero is the default servlet.
    ServletId,
    "servlet"
);
id_type!(
    /// Process-wide apartment proxy ID.
    ApartmentProxyId,
    "proxy"
);
id_type!(
    /// Receiver-assigned sequence ID.
    SequenceId,
    "sequence"
);
id_type!(
    /// Sender-assigned sequence sender ID.
    SenderId,
    "sender"
);

impl ApartmentId {
    /// "Unspecified": resolve through the service instead.
    pub const DEFAULT: Self = Self(0);
}

impl ServletId {
    pub const DEFAULT: Self = Self(0);

    pub fn is_default(self) -> bool {
        self.0 == 0
    }
}

/// A monotonically increasing ID source that wraps from `i32::MAX` back to 1.
///
/// The first value is the seed itself, so a seed of 0 hands out 0 exactly once.
#[derive(Debug)]
pub struct IdSeed {
    next: AtomicI32,
}

impl IdSeed {
    pub fn new(first: i32) -> Self {
        Self { next: AtomicI32::new(first) }
    }

    pub fn generate(&self) -> i32 {
        let mut current = self.next.load(Ordering::Relaxed);
        loop {
            let following = if current == i32::MAX { 1 } else { current + 1 };
            match self.next.compare_exchange_weak(current, following, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return current,
                Err(actual) => current = actual,
            }
        }
    }

    /// Generates until `in_use` rejects a value, skipping IDs still held after a wrap.
    pub fn generate_free(&self, in_use: impl Fn(i32) -> bool) -> i32 {
        loop {
            let id = self.generate();
            if !in_use(id) {
                return id;
            }
        }
    }
}
