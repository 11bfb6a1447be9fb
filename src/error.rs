//! Error type for map operations.
//!
//! Expected outcomes of the stepwise operations (`NoData`, `OnlyKey`,
//! `DirtyData`, `Done`, …) are not errors; they are ordinary variants of
//! the step enums in [`crate::map`]. `MapError` covers back-pressure the
//! caller must react to (`ReadOnly`, `NoMemory`) and corruption or file
//! problems surfaced on attach, dump and load.

use std::io;

use thiserror::Error;

/// Errors that can occur during map operations.
#[derive(Debug, Error)]
pub enum MapError {
    /// The map was attached read-only; mutation refused.
    #[error("map is read-only")]
    ReadOnly,

    /// No chunk could be allocated and eviction was disabled or yielded
    /// nothing. The caller may `erase` and retry.
    #[error("out of chunk memory")]
    NoMemory,

    /// The supplied region is too small for the configured geometry.
    #[error("region too small: need at least {needed} bytes, have {have}")]
    RegionTooSmall { needed: usize, have: usize },

    /// Rejected configuration (chunk sizes, growth factor, ratio).
    #[error("invalid configuration: {0}")]
    Config(&'static str),

    /// A region or dump file carries an incompatible format version.
    #[error("version mismatch: found {found_major}.{found_minor}, expected {expect_major}.{expect_minor}")]
    VersionMismatch {
        found_major: u8,
        found_minor: u8,
        expect_major: u8,
        expect_minor: u8,
    },

    /// A dump file's length does not match the attached region.
    #[error("dump size mismatch: file holds {file} bytes, region holds {region}")]
    SizeMismatch { file: usize, region: usize },

    /// A packed payload could not be decoded back into key and value.
    #[error("payload decode error")]
    Decode,

    /// A structural invariant does not hold; the context names the check
    /// that failed. Mutation stops before making things worse.
    #[error("corrupt region: {0}")]
    Corrupt(&'static str),

    /// Writing a dump file failed.
    #[error("dump file error")]
    DumpFile(#[source] io::Error),

    /// Reading or validating a dump file failed.
    #[error("load file error")]
    LoadFile(#[source] io::Error),
}
