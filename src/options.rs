/// Hard cap on `shard_bits`; 2^12 shards is already far past the point of
/// diminishing returns and tiny capacity slices degenerate.
pub(crate) const MAX_SHARD_BITS: u32 = 12;

/// Cache options. Built with [OptionsBuilder].
#[derive(Debug, Clone)]
pub struct Options {
    pub(crate) shard_bits: Option<u32>,
    pub(crate) capacity: u64,
    pub(crate) estimated_entries: usize,
}

/// Builder for [Options].
///
/// # Example
///
/// ```rust
/// use pin_cache::{sync::Cache, DefaultHashBuilder, OptionsBuilder};
///
/// let cache = Cache::<String, String>::with_options(
///     OptionsBuilder::new()
///         .capacity(1 << 20)
///         .estimated_entries(10_000)
///         .build()
///         .unwrap(),
///     DefaultHashBuilder::default(),
/// );
/// # drop(cache);
/// ```
#[derive(Debug, Clone, Default)]
pub struct OptionsBuilder {
    shard_bits: Option<u32>,
    capacity: Option<u64>,
    estimated_entries: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct Error(&'static str);

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

impl OptionsBuilder {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Base-2 log of the shard count. Each shard gets an even slice of the
    /// capacity and its own lock, so operations on different shards never
    /// contend.
    ///
    /// Defaults to a value derived from the detected parallelism, lowered
    /// until every shard covers a meaningful slice of the capacity.
    #[inline]
    pub fn shard_bits(&mut self, shard_bits: u32) -> &mut Self {
        self.shard_bits = Some(shard_bits);
        self
    }

    /// The total charge the cache can hold, in whatever unit the caller
    /// charges entries with (commonly bytes).
    #[inline]
    pub fn capacity(&mut self, capacity: u64) -> &mut Self {
        self.capacity = Some(capacity);
        self
    }

    /// The estimated number of resident entries, roughly
    /// `capacity / average entry charge`. Used only to pre-size the per-shard
    /// index and entry arena; an estimate within an order of magnitude is
    /// good enough.
    #[inline]
    pub fn estimated_entries(&mut self, estimated_entries: usize) -> &mut Self {
        self.estimated_entries = Some(estimated_entries);
        self
    }

    /// Builds an [Options] struct for the `Cache::with_options` constructor.
    #[inline]
    pub fn build(&self) -> Result<Options, Error> {
        if self.shard_bits.is_some_and(|bits| bits > MAX_SHARD_BITS) {
            return Err(Error("shard_bits must be at most 12"));
        }
        let capacity = self.capacity.ok_or(Error("capacity is not set"))?;
        Ok(Options {
            shard_bits: self.shard_bits,
            capacity,
            estimated_entries: self.estimated_entries.unwrap_or(0),
        })
    }
}

/// Shard count heuristic: scale with the detected parallelism, then back off
/// while a shard's capacity slice would be too thin to behave like a cache.
pub(crate) fn default_shard_bits(capacity: u64) -> u32 {
    const MIN_SHARD_CAPACITY: u64 = 32;
    let threads = available_parallelism() * 4;
    let mut bits = threads.next_power_of_two().trailing_zeros().min(6);
    while bits > 0 && capacity >> bits < MIN_SHARD_CAPACITY {
        bits -= 1;
    }
    bits
}

/// Memoized wrapper for `std::thread::available_parallelism`, which can be incredibly slow.
fn available_parallelism() -> usize {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static AVAILABLE_PARALLELISM: AtomicUsize = AtomicUsize::new(0);
    let mut ap = AVAILABLE_PARALLELISM.load(Ordering::Relaxed);
    if ap == 0 {
        ap = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        AVAILABLE_PARALLELISM.store(ap, Ordering::Relaxed);
    }
    ap
}
