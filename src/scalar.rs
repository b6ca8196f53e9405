//! Scalar element kinds carried by ports.
//!
//! Every port moves fixed-width records of one of six scalar kinds. The kind is
//! resolved once when a port is built; afterwards records travel as plain
//! `Box<[T]>` slices and the type-erased [`RecordBuf`] is only unwrapped at the
//! task boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A fixed-length record of scalars
pub type Record<T> = Box<[T]>;

/// The closed set of element kinds a port may carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarKind {
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
}

impl ScalarKind {
    pub const ALL: [ScalarKind; 6] = [
        ScalarKind::Int8,
        ScalarKind::Int16,
        ScalarKind::Int32,
        ScalarKind::Int64,
        ScalarKind::Float32,
        ScalarKind::Float64,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScalarKind::Int8 => "int8",
            ScalarKind::Int16 => "int16",
            ScalarKind::Int32 => "int32",
            ScalarKind::Int64 => "int64",
            ScalarKind::Float32 => "float32",
            ScalarKind::Float64 => "float64",
        }
    }

    /// Size of one element in bytes
    pub fn size_of(&self) -> usize {
        match self {
            ScalarKind::Int8 => 1,
            ScalarKind::Int16 => 2,
            ScalarKind::Int32 | ScalarKind::Float32 => 4,
            ScalarKind::Int64 | ScalarKind::Float64 => 8,
        }
    }
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScalarKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ScalarKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown scalar kind '{s}'"))
    }
}

/// A record whose element type is only known at runtime
#[derive(Debug, Clone, PartialEq)]
pub enum RecordBuf {
    Int8(Record<i8>),
    Int16(Record<i16>),
    Int32(Record<i32>),
    Int64(Record<i64>),
    Float32(Record<f32>),
    Float64(Record<f64>),
}

impl RecordBuf {
    /// Allocate a zero-filled record of `len` elements
    pub fn zeroed(kind: ScalarKind, len: usize) -> Self {
        match kind {
            ScalarKind::Int8 => RecordBuf::Int8(zeroed(len)),
            ScalarKind::Int16 => RecordBuf::Int16(zeroed(len)),
            ScalarKind::Int32 => RecordBuf::Int32(zeroed(len)),
            ScalarKind::Int64 => RecordBuf::Int64(zeroed(len)),
            ScalarKind::Float32 => RecordBuf::Float32(zeroed(len)),
            ScalarKind::Float64 => RecordBuf::Float64(zeroed(len)),
        }
    }

    pub fn kind(&self) -> ScalarKind {
        match self {
            RecordBuf::Int8(_) => ScalarKind::Int8,
            RecordBuf::Int16(_) => ScalarKind::Int16,
            RecordBuf::Int32(_) => ScalarKind::Int32,
            RecordBuf::Int64(_) => ScalarKind::Int64,
            RecordBuf::Float32(_) => ScalarKind::Float32,
            RecordBuf::Float64(_) => ScalarKind::Float64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RecordBuf::Int8(r) => r.len(),
            RecordBuf::Int16(r) => r.len(),
            RecordBuf::Int32(r) => r.len(),
            RecordBuf::Int64(r) => r.len(),
            RecordBuf::Float32(r) => r.len(),
            RecordBuf::Float64(r) => r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Typed view, `None` if `T` is not this record's kind
    pub fn as_slice<T: Scalar>(&self) -> Option<&[T]> {
        T::view(self)
    }

    /// Typed mutable view, `None` if `T` is not this record's kind
    pub fn as_mut_slice<T: Scalar>(&mut self) -> Option<&mut [T]> {
        T::view_mut(self)
    }
}

pub(crate) fn zeroed<T: Scalar>(len: usize) -> Record<T> {
    vec![T::default(); len].into_boxed_slice()
}

/// Element types that may flow through a port
pub trait Scalar: Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
    const KIND: ScalarKind;

    fn view(buf: &RecordBuf) -> Option<&[Self]>;

    fn view_mut(buf: &mut RecordBuf) -> Option<&mut [Self]>;
}

macro_rules! impl_scalar {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl Scalar for $ty {
                const KIND: ScalarKind = ScalarKind::$variant;

                #[inline]
                fn view(buf: &RecordBuf) -> Option<&[Self]> {
                    match buf {
                        RecordBuf::$variant(r) => Some(r),
                        _ => None,
                    }
                }

                #[inline]
                fn view_mut(buf: &mut RecordBuf) -> Option<&mut [Self]> {
                    match buf {
                        RecordBuf::$variant(r) => Some(r),
                        _ => None,
                    }
                }
            }
        )*
    };
}

impl_scalar! {
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    f32 => Float32,
    f64 => Float64,
}
