// vim: tw=80
//! Common type definitions used throughout the tiering engine

use divbuf::DivBuf;
use enum_primitive_derive::Primitive;
use num_traits::{FromPrimitive, ToPrimitive};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use std::{
    fmt::{self, Display, Formatter},
    io,
    ops::{Add, AddAssign, Sub},
};

/// Our `IoVec`.  Unlike the standard library's, ours is reference-counted so it
/// can have more than one owner.
pub type IoVec = DivBuf;

/// Our scatter-gather list.  A slice of reference-counted `IoVec`s.
pub type SGList = Vec<IoVec>;

/// Indexes a physical device within a pool.
pub type VdevT = u32;

/// The tiering engine's error type.  Basically just an errno
#[derive(Clone, Copy, Debug, Deserialize, Error, Eq, PartialEq, Primitive, Serialize)]
pub enum Error {
    // Standard errnos
    #[error("Operation not permitted")]
    EPERM           = libc::EPERM as isize,
    #[error("No such file or directory")]
    ENOENT          = libc::ENOENT as isize,
    #[error("Interrupted system call")]
    EINTR           = libc::EINTR as isize,
    #[error("Input/output error")]
    EIO             = libc::EIO as isize,
    #[error("Device not configured")]
    ENXIO           = libc::ENXIO as isize,
    #[error("Cannot allocate memory")]
    ENOMEM          = libc::ENOMEM as isize,
    #[error("Device busy")]
    EBUSY           = libc::EBUSY as isize,
    #[error("File exists")]
    EEXIST          = libc::EEXIST as isize,
    #[error("Operation not supported by device")]
    ENODEV          = libc::ENODEV as isize,
    #[error("Invalid argument")]
    EINVAL          = libc::EINVAL as isize,
    #[error("No space left on device")]
    ENOSPC          = libc::ENOSPC as isize,
    #[error("Read-only file system")]
    EROFS           = libc::EROFS as isize,
    #[error("Result too large")]
    ERANGE          = libc::ERANGE as isize,
    #[error("Resource temporarily unavailable")]
    EAGAIN          = libc::EAGAIN as isize,
    #[error("Operation already in progress")]
    EALREADY        = libc::EALREADY as isize,
    #[error("Can't send after socket shutdown")]
    ESHUTDOWN       = libc::ESHUTDOWN as isize,
    #[error("Operation timed out")]
    ETIMEDOUT       = libc::ETIMEDOUT as isize,
    #[error("Function not implemented")]
    ENOSYS          = libc::ENOSYS as isize,
    #[error("Value too large to be stored in data type")]
    EOVERFLOW       = libc::EOVERFLOW as isize,
    #[error("Operation canceled")]
    ECANCELED       = libc::ECANCELED as isize,
    #[error("Bad message")]
    EBADMSG         = libc::EBADMSG as isize,
    #[error("State not recoverable")]
    ENOTRECOVERABLE = libc::ENOTRECOVERABLE as isize,

    //// Tiering custom error types below
    #[error("Unknown error")]
    EUNKNOWN        = 256,
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        e.raw_os_error()
            .and_then(Error::from_i32)
            .unwrap_or(Error::EUNKNOWN)
    }
}

impl From<Error> for i32 {
    fn from(e: Error) -> Self {
        match e {
            Error::EUNKNOWN =>
                panic!("Unknown error codes should never be exposed"),
            _ => e.to_i32().unwrap()
        }
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

/// Transaction group numbers.
///
/// Txg 0 is never used for data.  Wherever a `TxgT` denotes an optional
/// boundary, 0 means "unset".
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq,
         PartialOrd, Serialize)]
pub struct TxgT(pub u64);

impl TxgT {
    pub const NONE: TxgT = TxgT(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl Add<u64> for TxgT {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        TxgT(self.0 + rhs)
    }
}

impl AddAssign<u64> for TxgT {
    fn add_assign(&mut self, rhs: u64) {
        *self = TxgT(self.0 + rhs)
    }
}

impl Display for TxgT {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for TxgT {
    fn from(t: u64) -> Self {
        TxgT(t)
    }
}

impl From<TxgT> for u64 {
    fn from(t: TxgT) -> Self {
        t.0
    }
}

impl Sub<u64> for TxgT {
    type Output = Self;

    fn sub(self, rhs: u64) -> Self::Output {
        TxgT(self.0.saturating_sub(rhs))
    }
}

/// Device Virtual Address.
///
/// Locates one copy of a block on one physical device.  The engine treats it
/// as opaque, except for ordering.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, Hash, Ord,
         PartialEq, PartialOrd)]
pub struct DVA {
    pub vdev: VdevT,
    pub offset: u64
}

impl DVA {
    pub fn new(vdev: VdevT, offset: u64) -> Self {
        DVA {vdev, offset}
    }
}

impl Display for DVA {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}:{:#x}", self.vdev, self.offset)
    }
}

/// Storage allocation class.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq,
         PartialOrd, Serialize)]
pub enum ClassT {
    /// The fast "special" class that absorbs write bursts
    Special,
    /// The bulk "normal" class
    Normal,
}

impl Display for ClassT {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            ClassT::Special => "special".fmt(f),
            ClassT::Normal => "normal".fmt(f),
        }
    }
}

/// Kinds of metadata that may have their own placement policy
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq,
         PartialOrd, Serialize)]
pub enum MetaKind {
    /// Indirect blocks of any object
    Indirect,
    /// Object descriptors
    Dnode,
    /// Deduplication table
    Ddt,
    /// Everything else
    Other,
}

impl MetaKind {
    pub const ALL: [MetaKind; 4] =
        [MetaKind::Indirect, MetaKind::Dnode, MetaKind::Ddt, MetaKind::Other];

    pub fn name(self) -> &'static str {
        match self {
            MetaKind::Indirect => "indirect",
            MetaKind::Dnode => "dnode",
            MetaKind::Ddt => "ddt",
            MetaKind::Other => "other",
        }
    }
}

/// What a block contains
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum BlockKind {
    Data,
    Metadata(MetaKind),
    /// Intent log blocks are never relocated
    IntentLog,
}

/// Compression algorithm of a stored block.  The engine relocates compressed
/// bytes verbatim, so it only carries this along.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq,
         Serialize)]
pub enum Compression {
    #[default]
    None,
    LZ4,
    Zstd,
}

/// Reference to one block, as found in the storage tree.
///
/// A block resident on the special class carries a second, predetermined
/// address on the normal class.  That is where the Mover will put it.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct BlockPointer {
    /// Primary copy
    pub dva: DVA,
    /// Predetermined bulk-class copy, if any
    pub bulk: Option<DVA>,
    /// Logical birth transaction
    pub birth: TxgT,
    /// Physical birth transaction.  Differs from `birth` only for blocks that
    /// were reused by content-addressed deduplication.
    pub phys_birth: TxgT,
    pub kind: BlockKind,
    /// Tree level.  0 for leaves.
    pub level: u8,
    pub compression: Compression,
    /// Logical size in bytes
    pub lsize: u32,
    /// Physical size in bytes
    pub psize: u32,
    /// MetroHash64 of the physical contents
    pub checksum: u64,
}

// LCOV_EXCL_STOP
