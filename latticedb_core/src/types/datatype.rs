//! The closed set of cell datatypes and their physical representations.
//!
//! Every datatype except the string kinds has a fixed in-memory size. Calendar
//! and clock types are tagged with a [`TimeUnit`] and share the `i64`
//! representation. Dispatch into monomorphized inner loops happens through
//! [`PhysicalType`] and the [`dispatch_physical!`](crate::dispatch_physical)
//! macro, so per-cell hot paths never pay for dynamic dispatch.

use anyhow::{Result, bail};
use std::fmt;

/// Unit tag for the calendar/clock datatypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeUnit {
	Year,
	Month,
	Week,
	Day,
	Hour,
	Minute,
	Second,
	Millisecond,
	Microsecond,
	Nanosecond,
	Picosecond,
	Femtosecond,
	Attosecond,
}

/// The closed enumeration of scalar cell kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Datatype {
	Int8,
	Int16,
	Int32,
	Int64,
	UInt8,
	UInt16,
	UInt32,
	UInt64,
	Float32,
	Float64,
	/// Calendar instant, `i64` count of `TimeUnit`s since the epoch.
	DateTime(TimeUnit),
	/// Clock time, `i64` count of `TimeUnit`s.
	Time(TimeUnit),
	/// Fixed-length byte blob; length is governed by the cell value number.
	Blob,
	/// Variable-length ASCII string.
	StringAscii,
	/// Variable-length UTF-8 string.
	StringUtf8,
}

/// The physical representation backing a [`Datatype`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhysicalType {
	I8,
	I16,
	I32,
	I64,
	U8,
	U16,
	U32,
	U64,
	F32,
	F64,
	/// Raw bytes, compared lexicographically. Used by blob and string kinds.
	Bytes,
}

impl Datatype {
	/// The fixed size of one value in bytes, or `None` for the var-length
	/// string kinds.
	pub fn value_size(&self) -> Option<usize> {
		use Datatype::*;
		match self {
			Int8 | UInt8 | Blob => Some(1),
			Int16 | UInt16 => Some(2),
			Int32 | UInt32 | Float32 => Some(4),
			Int64 | UInt64 | Float64 | DateTime(_) | Time(_) => Some(8),
			StringAscii | StringUtf8 => None,
		}
	}

	/// The fixed value size, failing for var-length kinds.
	pub fn fixed_value_size(&self) -> Result<usize> {
		match self.value_size() {
			Some(s) => Ok(s),
			None => bail!("datatype {self} has no fixed value size"),
		}
	}

	/// `true` for the variable-length string kinds.
	pub fn is_string(&self) -> bool {
		matches!(self, Datatype::StringAscii | Datatype::StringUtf8)
	}

	/// `true` for signed/unsigned integers and the calendar/clock kinds.
	pub fn is_integral(&self) -> bool {
		use Datatype::*;
		matches!(
			self,
			Int8 | Int16 | Int32 | Int64 | UInt8 | UInt16 | UInt32 | UInt64 | DateTime(_) | Time(_)
		)
	}

	pub fn is_float(&self) -> bool {
		matches!(self, Datatype::Float32 | Datatype::Float64)
	}

	/// The physical representation used for comparisons and copies.
	pub fn physical(&self) -> PhysicalType {
		use Datatype::*;
		match self {
			Int8 => PhysicalType::I8,
			Int16 => PhysicalType::I16,
			Int32 => PhysicalType::I32,
			Int64 | DateTime(_) | Time(_) => PhysicalType::I64,
			UInt8 => PhysicalType::U8,
			UInt16 => PhysicalType::U16,
			UInt32 => PhysicalType::U32,
			UInt64 => PhysicalType::U64,
			Float32 => PhysicalType::F32,
			Float64 => PhysicalType::F64,
			Blob | StringAscii | StringUtf8 => PhysicalType::Bytes,
		}
	}
}

impl fmt::Display for Datatype {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{self:?}")
	}
}

/// Expands `$numeric` once per numeric [`PhysicalType`], with `$T` bound to the
/// concrete Rust type, and `$bytes` for [`PhysicalType::Bytes`].
///
/// This is the engine's single point of datatype polymorphism: bitmap
/// evaluation, comparators and the copy engine all monomorphize through it.
#[macro_export]
macro_rules! dispatch_physical {
	($phys:expr, $T:ident => $numeric:expr, $bytes:expr) => {
		match $phys {
			$crate::PhysicalType::I8 => {
				type $T = i8;
				$numeric
			}
			$crate::PhysicalType::I16 => {
				type $T = i16;
				$numeric
			}
			$crate::PhysicalType::I32 => {
				type $T = i32;
				$numeric
			}
			$crate::PhysicalType::I64 => {
				type $T = i64;
				$numeric
			}
			$crate::PhysicalType::U8 => {
				type $T = u8;
				$numeric
			}
			$crate::PhysicalType::U16 => {
				type $T = u16;
				$numeric
			}
			$crate::PhysicalType::U32 => {
				type $T = u32;
				$numeric
			}
			$crate::PhysicalType::U64 => {
				type $T = u64;
				$numeric
			}
			$crate::PhysicalType::F32 => {
				type $T = f32;
				$numeric
			}
			$crate::PhysicalType::F64 => {
				type $T = f64;
				$numeric
			}
			$crate::PhysicalType::Bytes => $bytes,
		}
	};
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_value_sizes() {
		assert_eq!(Datatype::Int8.value_size(), Some(1));
		assert_eq!(Datatype::UInt16.value_size(), Some(2));
		assert_eq!(Datatype::Float32.value_size(), Some(4));
		assert_eq!(Datatype::DateTime(TimeUnit::Millisecond).value_size(), Some(8));
		assert_eq!(Datatype::StringAscii.value_size(), None);
		assert!(Datatype::StringUtf8.fixed_value_size().is_err());
	}

	#[test]
	fn test_categories() {
		assert!(Datatype::Int64.is_integral());
		assert!(Datatype::Time(TimeUnit::Second).is_integral());
		assert!(!Datatype::Float64.is_integral());
		assert!(Datatype::Float64.is_float());
		assert!(Datatype::StringAscii.is_string());
		assert!(!Datatype::Blob.is_string());
	}

	#[test]
	fn test_physical_mapping() {
		assert_eq!(Datatype::DateTime(TimeUnit::Year).physical(), PhysicalType::I64);
		assert_eq!(Datatype::Blob.physical(), PhysicalType::Bytes);
		assert_eq!(Datatype::UInt32.physical(), PhysicalType::U32);
	}

	#[test]
	fn test_dispatch_macro() {
		let size = dispatch_physical!(Datatype::Int32.physical(), T => std::mem::size_of::<T>(), 0);
		assert_eq!(size, 4);
		let size = dispatch_physical!(Datatype::StringAscii.physical(), T => std::mem::size_of::<T>(), 0);
		assert_eq!(size, 0);
	}
}
