//! Validated configuration value types.
//!
//! Numeric knobs shared across backends and the runtime are newtypes
//! with validated ranges so an out-of-range value is rejected at
//! construction rather than deep inside a backend.

use nutype::nutype;

/// Maximum number of messages a bounded mailbox queue may hold.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 10_000
)]
pub struct QueueCapacity(usize);

impl QueueCapacity {
    /// Gets the value as usize.
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Maximum encoded message size in bytes accepted by a backend.
#[nutype(
    validate(greater_or_equal = 1024, less_or_equal = 104_857_600),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1_048_576
)]
pub struct MaxMessageSize(usize);

impl MaxMessageSize {
    /// Gets the value as usize.
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Time-to-live in seconds applied to mailbox state on broker-backed
/// exchanges; refreshed on every `get`.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 2_592_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 86_400
)]
pub struct MailboxTtlSecs(u64);

impl MailboxTtlSecs {
    /// Gets the value as i64 for broker expiry commands.
    #[must_use]
    pub fn as_secs(&self) -> i64 {
        self.into_inner() as i64
    }
}

/// Seconds a terminated mailbox's gravestone remains visible before the
/// mailbox reads as missing again.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 604_800),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 3600
)]
pub struct GravestoneTtlSecs(u64);

impl GravestoneTtlSecs {
    /// Gets the value as i64 for broker expiry commands.
    #[must_use]
    pub fn as_secs(&self) -> i64 {
        self.into_inner() as i64
    }
}

/// Maximum number of times a manager restarts a failed agent.
#[nutype(
    validate(less_or_equal = 100),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 0
)]
pub struct RestartLimit(u32);

impl RestartLimit {
    /// Gets the value as u32.
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(QueueCapacity::default().as_usize(), 10_000);
        assert_eq!(MaxMessageSize::default().as_usize(), 1_048_576);
        assert_eq!(RestartLimit::default().as_u32(), 0);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(QueueCapacity::try_new(0).is_err());
        assert!(MaxMessageSize::try_new(1).is_err());
        assert!(RestartLimit::try_new(1000).is_err());
    }
}
