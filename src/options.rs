//! # Options Carrier
//!
//! Functional options for clients and readers: a sum type of well-known
//! options plus an open-ended extension map for driver-specific settings.
//!
//! Options compose left to right; a later option overwrites an earlier one,
//! except event-type filters, which accumulate:
//!
//! ```
//! use gospel::{filter_by_event_type, read_buffer_size, ReaderOptions};
//!
//! let opts = ReaderOptions::new([
//!     read_buffer_size(500),
//!     read_buffer_size(50),                  // wins
//!     filter_by_event_type(["a"]),
//!     filter_by_event_type(["b", "c"]),      // extends: {a, b, c}
//! ]);
//! assert_eq!(opts.read_buffer_size(), 50);
//! assert_eq!(opts.event_type_filter(), Some(&["a".into(), "b".into(), "c".into()][..]));
//! ```
//!
//! ## Extensions
//!
//! Unknown settings travel in a typed map keyed by an interned
//! [`ExtensionKey`] token, so an outer layer can thread settings through to
//! a driver without this crate knowing about them. Unknown keys are ignored
//! unless something actually reads them.

use std::any::Any;
use std::collections::HashMap;
use std::time::Duration;

/// The default number of facts a reader buffers ahead of `next()`.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 100;

/// The smallest permitted read buffer. One slot for the current fact and one
/// for the lookahead.
pub const MIN_READ_BUFFER_SIZE: usize = 2;

/// The default "acceptable latency" for a reader. The reader tunes its poll
/// rate to hold the average fact latency near this value.
pub const DEFAULT_ACCEPTABLE_LATENCY: Duration = Duration::from_millis(200);

/// Multiplier used to derive the "starvation latency" when none is set:
///
/// ```text
/// starvation latency = acceptable latency * STARVATION_LATENCY_FACTOR
/// ```
pub const STARVATION_LATENCY_FACTOR: u32 = 10;

/// The default ceiling on polling queries per second, shared by all readers
/// of one client.
pub const DEFAULT_POLL_RATE_LIMIT: f64 = 500.0;

// =============================================================================
// Extension Map
// =============================================================================

/// An interned token identifying a driver-specific option.
///
/// Declare keys as constants so the same token is used on both sides:
///
/// ```
/// use gospel::ExtensionKey;
///
/// const COMPRESSION: ExtensionKey = ExtensionKey::new("my-driver.compression");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtensionKey(&'static str);

impl ExtensionKey {
    /// Creates a key. The name is only used for identity and debugging.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }
}

type ExtensionMap = HashMap<ExtensionKey, Box<dyn Any + Send + Sync>>;

fn get_extension<T: 'static>(map: &ExtensionMap, key: ExtensionKey) -> Option<&T> {
    map.get(&key).and_then(|v| v.downcast_ref())
}

// =============================================================================
// Client Options
// =============================================================================

/// A single option applied when opening a [`Client`].
///
/// Construct via [`poll_rate_limit`] and [`client_extension`].
///
/// [`Client`]: crate::Client
pub enum ClientOption {
    /// Overrides the global polling-rate ceiling.
    PollRateLimit(f64),

    /// A driver-specific setting.
    Extension(ExtensionKey, Box<dyn Any + Send + Sync>),
}

/// Sets the maximum number of polling queries per second, shared by all
/// readers opened through the client.
///
/// Defaults to [`DEFAULT_POLL_RATE_LIMIT`].
pub fn poll_rate_limit(rate: f64) -> ClientOption {
    ClientOption::PollRateLimit(rate)
}

/// Attaches a driver-specific client setting.
pub fn client_extension<T: Any + Send + Sync>(key: ExtensionKey, value: T) -> ClientOption {
    ClientOption::Extension(key, Box::new(value))
}

/// The resolved set of client options.
pub struct ClientOptions {
    poll_rate_limit: f64,
    extensions: ExtensionMap,
}

impl ClientOptions {
    /// Resolves a sequence of options, applying defaults for anything unset.
    pub fn new(opts: impl IntoIterator<Item = ClientOption>) -> Self {
        let mut resolved = Self {
            poll_rate_limit: DEFAULT_POLL_RATE_LIMIT,
            extensions: ExtensionMap::new(),
        };

        for opt in opts {
            match opt {
                ClientOption::PollRateLimit(rate) => resolved.poll_rate_limit = rate,
                ClientOption::Extension(key, value) => {
                    resolved.extensions.insert(key, value);
                }
            }
        }

        resolved
    }

    /// The global polling-rate ceiling in queries per second.
    pub fn poll_rate_limit(&self) -> f64 {
        self.poll_rate_limit
    }

    /// Returns the driver-specific setting stored under `key`, if present
    /// and of type `T`.
    pub fn extension<T: 'static>(&self, key: ExtensionKey) -> Option<&T> {
        get_extension(&self.extensions, key)
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::new([])
    }
}

// =============================================================================
// Reader Options
// =============================================================================

/// A single option applied when opening a reader.
///
/// Construct via [`filter_by_event_type`], [`read_buffer_size`],
/// [`acceptable_latency`], [`starvation_latency`] and [`reader_extension`].
pub enum ReaderOption {
    /// Limits the reader to facts whose events have one of these types.
    FilterByEventType(Vec<String>),

    /// Sets the number of facts buffered ahead of `next()`.
    ReadBufferSize(usize),

    /// Sets the latency the reader's rate adaptation aims for.
    AcceptableLatency(Duration),

    /// Sets the latency tolerated once the reader reaches the stream tail.
    StarvationLatency(Duration),

    /// A driver-specific setting.
    Extension(ExtensionKey, Box<dyn Any + Send + Sync>),
}

/// Limits the reader to facts with events of the given types.
///
/// Multiple `filter_by_event_type` options combine to expand the list of
/// allowed types.
pub fn filter_by_event_type<I, S>(types: I) -> ReaderOption
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    ReaderOption::FilterByEventType(types.into_iter().map(Into::into).collect())
}

/// Sets the number of facts to buffer in memory ahead of calls to `next()`.
///
/// Values below [`MIN_READ_BUFFER_SIZE`] are clamped up to it.
pub fn read_buffer_size(n: usize) -> ReaderOption {
    ReaderOption::ReadBufferSize(n.max(MIN_READ_BUFFER_SIZE))
}

/// Sets the amount of latency that is generally acceptable for the purposes
/// of the reader. The reader maintains this latency by adjusting its polling
/// rate against the average latency of delivered facts.
pub fn acceptable_latency(latency: Duration) -> ReaderOption {
    ReaderOption::AcceptableLatency(latency)
}

/// Sets the amount of latency that is acceptable once the reader has reached
/// the end of the stream and is "starving" for facts.
///
/// The setting is ignored if it is less than the acceptable latency.
pub fn starvation_latency(latency: Duration) -> ReaderOption {
    ReaderOption::StarvationLatency(latency)
}

/// Attaches a driver-specific reader setting.
pub fn reader_extension<T: Any + Send + Sync>(key: ExtensionKey, value: T) -> ReaderOption {
    ReaderOption::Extension(key, Box::new(value))
}

/// The resolved set of reader options.
pub struct ReaderOptions {
    event_types: Vec<String>,
    read_buffer_size: Option<usize>,
    acceptable_latency: Option<Duration>,
    starvation_latency: Option<Duration>,
    extensions: ExtensionMap,
}

impl ReaderOptions {
    /// Resolves a sequence of options, applying defaults for anything unset.
    pub fn new(opts: impl IntoIterator<Item = ReaderOption>) -> Self {
        let mut resolved = Self {
            event_types: Vec::new(),
            read_buffer_size: None,
            acceptable_latency: None,
            starvation_latency: None,
            extensions: ExtensionMap::new(),
        };

        for opt in opts {
            match opt {
                ReaderOption::FilterByEventType(types) => resolved.event_types.extend(types),
                ReaderOption::ReadBufferSize(n) => resolved.read_buffer_size = Some(n),
                ReaderOption::AcceptableLatency(d) => resolved.acceptable_latency = Some(d),
                ReaderOption::StarvationLatency(d) => resolved.starvation_latency = Some(d),
                ReaderOption::Extension(key, value) => {
                    resolved.extensions.insert(key, value);
                }
            }
        }

        resolved
    }

    /// The event types the reader is limited to, or `None` when unfiltered.
    pub fn event_type_filter(&self) -> Option<&[String]> {
        if self.event_types.is_empty() {
            None
        } else {
            Some(&self.event_types)
        }
    }

    /// The read-buffer size, falling back to [`DEFAULT_READ_BUFFER_SIZE`].
    pub fn read_buffer_size(&self) -> usize {
        self.read_buffer_size.unwrap_or(DEFAULT_READ_BUFFER_SIZE)
    }

    /// The acceptable latency, falling back to
    /// [`DEFAULT_ACCEPTABLE_LATENCY`].
    pub fn acceptable_latency(&self) -> Duration {
        self.acceptable_latency.unwrap_or(DEFAULT_ACCEPTABLE_LATENCY)
    }

    /// The starvation latency.
    ///
    /// Falls back to `acceptable_latency * 10` when unset, or when the
    /// configured value is smaller than the acceptable latency.
    pub fn starvation_latency(&self) -> Duration {
        let acceptable = self.acceptable_latency();

        match self.starvation_latency {
            Some(latency) if latency >= acceptable => latency,
            _ => acceptable * STARVATION_LATENCY_FACTOR,
        }
    }

    /// Returns the driver-specific setting stored under `key`, if present
    /// and of type `T`.
    pub fn extension<T: 'static>(&self, key: ExtensionKey) -> Option<&T> {
        get_extension(&self.extensions, key)
    }
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self::new([])
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_no_options_given() {
        let opts = ReaderOptions::default();
        assert_eq!(opts.read_buffer_size(), DEFAULT_READ_BUFFER_SIZE);
        assert_eq!(opts.acceptable_latency(), DEFAULT_ACCEPTABLE_LATENCY);
        assert_eq!(opts.starvation_latency(), DEFAULT_ACCEPTABLE_LATENCY * 10);
        assert!(opts.event_type_filter().is_none());

        let copts = ClientOptions::default();
        assert_eq!(copts.poll_rate_limit(), DEFAULT_POLL_RATE_LIMIT);
    }

    #[test]
    fn later_options_overwrite_earlier_ones() {
        let opts = ReaderOptions::new([read_buffer_size(500), read_buffer_size(50)]);
        assert_eq!(opts.read_buffer_size(), 50);
    }

    #[test]
    fn read_buffer_size_is_clamped_to_minimum() {
        let opts = ReaderOptions::new([read_buffer_size(0)]);
        assert_eq!(opts.read_buffer_size(), MIN_READ_BUFFER_SIZE);

        let opts = ReaderOptions::new([read_buffer_size(1)]);
        assert_eq!(opts.read_buffer_size(), MIN_READ_BUFFER_SIZE);
    }

    #[test]
    fn event_type_filters_accumulate() {
        let opts = ReaderOptions::new([
            filter_by_event_type(["a"]),
            filter_by_event_type(["b", "c"]),
        ]);
        assert_eq!(
            opts.event_type_filter().unwrap(),
            &["a".to_string(), "b".to_string(), "c".to_string()][..]
        );
    }

    #[test]
    fn empty_filter_means_unfiltered() {
        let opts = ReaderOptions::new([filter_by_event_type(Vec::<String>::new())]);
        assert!(opts.event_type_filter().is_none());
    }

    #[test]
    fn starvation_latency_below_acceptable_is_ignored() {
        let opts = ReaderOptions::new([
            acceptable_latency(Duration::from_millis(100)),
            starvation_latency(Duration::from_millis(50)),
        ]);
        assert_eq!(opts.starvation_latency(), Duration::from_millis(1000));
    }

    #[test]
    fn starvation_latency_at_or_above_acceptable_is_honored() {
        let opts = ReaderOptions::new([
            acceptable_latency(Duration::from_millis(100)),
            starvation_latency(Duration::from_millis(100)),
        ]);
        assert_eq!(opts.starvation_latency(), Duration::from_millis(100));
    }

    #[test]
    fn extensions_round_trip_by_key_and_type() {
        const KEY: ExtensionKey = ExtensionKey::new("test.setting");
        const OTHER: ExtensionKey = ExtensionKey::new("test.other");

        let opts = ReaderOptions::new([reader_extension(KEY, 42u32)]);
        assert_eq!(opts.extension::<u32>(KEY), Some(&42));
        assert_eq!(opts.extension::<u32>(OTHER), None);

        // Wrong type reads as absent rather than panicking.
        assert_eq!(opts.extension::<String>(KEY), None);
    }

    #[test]
    fn client_poll_rate_limit_option() {
        let opts = ClientOptions::new([poll_rate_limit(50.0)]);
        assert_eq!(opts.poll_rate_limit(), 50.0);
    }
}
