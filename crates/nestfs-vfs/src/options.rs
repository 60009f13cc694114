//! Immutable sets of named boolean options.
//!
//! An [`OptionSet`] is a value type: equality and hashing depend on flag
//! membership only, never on the order flags were supplied in. Two
//! families exist:
//!
//! - [`InputOption`] / [`input_options`] for reads
//! - [`SyncOption`] / [`sync_options`] for synchronization
//!
//! Each family exposes its named presets as process-wide statics.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// A flag that can be a member of an [`OptionSet`].
pub trait OptionFlag: Copy + Eq + fmt::Debug + 'static {
    /// Every flag of the family, in declaration order.
    const ALL: &'static [Self];

    /// The single bit representing this flag.
    fn bit(self) -> u32;

    /// External name of the flag, e.g. `CLEAR_CACHE`.
    fn name(self) -> &'static str;
}

/// An immutable set of option flags.
pub struct OptionSet<K> {
    bits: u32,
    _kind: PhantomData<fn() -> K>,
}

impl<K> OptionSet<K> {
    /// The set with no flags.
    pub const EMPTY: Self = Self::from_bits(0);

    const fn from_bits(bits: u32) -> Self {
        Self {
            bits,
            _kind: PhantomData,
        }
    }

    /// Check if no flag is set.
    pub const fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Number of flags set.
    pub const fn len(&self) -> usize {
        self.bits.count_ones() as usize
    }

    /// Flags in both sets.
    pub const fn intersection(self, other: Self) -> Self {
        Self::from_bits(self.bits & other.bits)
    }

    /// Flags in either set.
    pub const fn union(self, other: Self) -> Self {
        Self::from_bits(self.bits | other.bits)
    }

    /// Check if every flag of `other` is set in `self`.
    pub const fn contains_all(&self, other: Self) -> bool {
        self.bits & other.bits == other.bits
    }

    /// Check if any flag of `other` is set in `self`.
    pub const fn intersects(&self, other: Self) -> bool {
        self.bits & other.bits != 0
    }
}

impl<K: OptionFlag> OptionSet<K> {
    /// Build a set from zero or more flags. Duplicates collapse; the empty
    /// case is [`OptionSet::EMPTY`].
    pub fn of(flags: &[K]) -> Self {
        if flags.is_empty() {
            return Self::EMPTY;
        }
        Self::from_bits(flags.iter().fold(0, |bits, f| bits | f.bit()))
    }

    /// Check if a flag is set.
    pub fn contains(&self, flag: K) -> bool {
        self.bits & flag.bit() != 0
    }

    /// This set with `flag` added.
    pub fn with(self, flag: K) -> Self {
        Self::from_bits(self.bits | flag.bit())
    }

    /// This set with `flag` removed.
    pub fn without(self, flag: K) -> Self {
        Self::from_bits(self.bits & !flag.bit())
    }

    /// Flags of the family that are not in this set.
    pub fn complement(self) -> Self {
        Self::from_bits(Self::family_bits() & !self.bits)
    }

    /// Iterate the set flags in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = K> + '_ {
        K::ALL.iter().copied().filter(move |f| self.contains(*f))
    }

    fn family_bits() -> u32 {
        K::ALL.iter().fold(0, |bits, f| bits | f.bit())
    }
}

impl<K> Clone for OptionSet<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for OptionSet<K> {}

impl<K> PartialEq for OptionSet<K> {
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits
    }
}

impl<K> Eq for OptionSet<K> {}

impl<K> Hash for OptionSet<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bits.hash(state);
    }
}

impl<K> Default for OptionSet<K> {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl<K: OptionFlag> fmt::Debug for OptionSet<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, flag) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(flag.name())?;
        }
        f.write_str("}")
    }
}

impl<K: OptionFlag> FromIterator<K> for OptionSet<K> {
    fn from_iter<I: IntoIterator<Item = K>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::EMPTY, |set, flag| set.with(flag))
    }
}

impl<K: OptionFlag + Serialize> Serialize for OptionSet<K> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

impl<'de, K: OptionFlag + Deserialize<'de>> Deserialize<'de> for OptionSet<K> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let flags = Vec::<K>::deserialize(deserializer)?;
        Ok(Self::of(&flags))
    }
}

// ============================================================================
// Input options
// ============================================================================

/// Options for reading entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InputOption {
    /// Buffer the entry content in the selective cache of its mount point.
    Cache,
}

impl InputOption {
    const fn const_bit(self) -> u32 {
        1 << self as u32
    }
}

impl OptionFlag for InputOption {
    const ALL: &'static [Self] = &[Self::Cache];

    fn bit(self) -> u32 {
        self.const_bit()
    }

    fn name(self) -> &'static str {
        match self {
            Self::Cache => "CACHE",
        }
    }
}

/// A set of input options.
pub type InputOptions = OptionSet<InputOption>;

/// Named input option sets.
pub mod input_options {
    use super::{InputOption, InputOptions, OptionSet};

    /// No input options.
    pub static NONE: InputOptions = OptionSet::EMPTY;

    /// The options a caller may choose per call. Everything outside this
    /// mask is fixed by the controller; caller-supplied bits outside it are
    /// ignored, never rejected.
    pub static INPUT_PREFERENCES_MASK: InputOptions =
        OptionSet::from_bits(InputOption::Cache.const_bit());

    /// Build a set of input options. The empty case returns [`NONE`].
    pub fn of(options: &[InputOption]) -> InputOptions {
        if options.is_empty() {
            return NONE;
        }
        OptionSet::of(options)
    }

    /// Merge caller preferences with the controller's fixed options.
    pub fn effective(caller: InputOptions, fixed: InputOptions) -> InputOptions {
        caller
            .intersection(INPUT_PREFERENCES_MASK)
            .union(fixed.intersection(INPUT_PREFERENCES_MASK.complement()))
    }
}

// ============================================================================
// Synchronization options
// ============================================================================

/// Options controlling a synchronization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncOption {
    /// Forcibly close open input streams instead of failing or waiting.
    ForceCloseInput,
    /// Forcibly close open output streams instead of failing or waiting.
    ForceCloseOutput,
    /// Wait for other threads to close their input streams.
    WaitCloseInput,
    /// Wait for other threads to close their output streams.
    WaitCloseOutput,
    /// Clear the selective entry cache after flushing.
    ClearCache,
    /// Discard pending changes instead of committing them.
    AbortChanges,
}

impl SyncOption {
    const fn const_bit(self) -> u32 {
        1 << self as u32
    }
}

impl OptionFlag for SyncOption {
    const ALL: &'static [Self] = &[
        Self::ForceCloseInput,
        Self::ForceCloseOutput,
        Self::WaitCloseInput,
        Self::WaitCloseOutput,
        Self::ClearCache,
        Self::AbortChanges,
    ];

    fn bit(self) -> u32 {
        self.const_bit()
    }

    fn name(self) -> &'static str {
        match self {
            Self::ForceCloseInput => "FORCE_CLOSE_INPUT",
            Self::ForceCloseOutput => "FORCE_CLOSE_OUTPUT",
            Self::WaitCloseInput => "WAIT_CLOSE_INPUT",
            Self::WaitCloseOutput => "WAIT_CLOSE_OUTPUT",
            Self::ClearCache => "CLEAR_CACHE",
            Self::AbortChanges => "ABORT_CHANGES",
        }
    }
}

/// A set of synchronization options.
pub type SyncOptions = OptionSet<SyncOption>;

/// Named synchronization option sets.
pub mod sync_options {
    use super::{OptionSet, SyncOption, SyncOptions};

    /// No synchronization options.
    pub static NONE: SyncOptions = OptionSet::EMPTY;

    /// Forcibly close all streams, flush and clear the selective cache and
    /// commit all changes. Makes the controller eligible for reclamation.
    ///
    /// Other threads doing I/O on the archive will see their streams fail.
    pub static UNMOUNT: SyncOptions = OptionSet::from_bits(
        SyncOption::ForceCloseInput.const_bit()
            | SyncOption::ForceCloseOutput.const_bit()
            | SyncOption::ClearCache.const_bit(),
    );

    /// Wait for other threads to close their streams and commit all
    /// changes, keeping the selective cache.
    ///
    /// This deliberately excludes `CLEAR_CACHE`: clearing the cache while
    /// other threads access nested archives may deadlock or busy-loop.
    pub static SYNC: SyncOptions = OptionSet::from_bits(
        SyncOption::WaitCloseInput.const_bit() | SyncOption::WaitCloseOutput.const_bit(),
    );

    /// Abort all pending changes and clear the selective cache without
    /// flushing it. Only meaningful right before the federated file system
    /// itself is discarded.
    pub static RESET: SyncOptions = OptionSet::from_bits(SyncOption::AbortChanges.const_bit());

    /// Build a set of synchronization options. The empty case returns
    /// [`NONE`].
    pub fn of(options: &[SyncOption]) -> SyncOptions {
        if options.is_empty() {
            return NONE;
        }
        OptionSet::of(options)
    }

    /// Any `WAIT_CLOSE_*` option.
    pub(crate) static WAIT_ANY: SyncOptions = OptionSet::from_bits(
        SyncOption::WaitCloseInput.const_bit() | SyncOption::WaitCloseOutput.const_bit(),
    );

    /// Check for the documented deadlock hazard: clearing the cache while
    /// waiting for other threads.
    pub fn waits_and_clears(options: SyncOptions) -> bool {
        options.contains(SyncOption::ClearCache) && options.intersects(WAIT_ANY)
    }
}
