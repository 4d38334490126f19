//! The [`PhysicalValue`] trait: the per-kind operations that typed ranges,
//! bitmap evaluation and the copy engine are generic over.

use anyhow::{Result, bail, ensure};
use std::cmp::Ordering;
use std::fmt::Debug;

use super::Datatype;
use crate::dispatch_physical;

/// Operations every fixed-size physical value kind supports.
///
/// Implementations exist for the eight integer widths and the two float
/// widths. Byte-string values are handled separately via lexicographic slice
/// comparison.
pub trait PhysicalValue: Copy + PartialOrd + Debug + Send + Sync + 'static {
	const SIZE: usize;

	/// Decodes a value from its little-endian byte image.
	fn read_le(bytes: &[u8]) -> Self;

	/// Appends the little-endian byte image to `out`.
	fn append_le(self, out: &mut Vec<u8>);

	/// Total order; for floats this is IEEE `total_cmp`, so NaN sorts last.
	fn order(self, other: Self) -> Ordering;

	/// The midpoint of `[lo, hi]`, biased low. Never exceeds `hi`.
	fn midpoint(lo: Self, hi: Self) -> Self;

	/// The next representable value, or `None` at the maximum.
	fn successor(self) -> Option<Self>;

	/// Inclusive cardinality of `[lo, hi]` for integral kinds.
	fn interval_count(lo: Self, hi: Self) -> Option<u128>;

	fn to_f64_lossy(self) -> f64;

	/// The value as `i128`, for integral kinds only.
	fn to_i128(self) -> Option<i128>;

	/// Converts back from `i128`, failing on overflow or for float kinds.
	fn from_i128(value: i128) -> Option<Self>;
}

macro_rules! impl_physical_int {
	($($t:ty),*) => {$(
		impl PhysicalValue for $t {
			const SIZE: usize = std::mem::size_of::<$t>();

			fn read_le(bytes: &[u8]) -> Self {
				<$t>::from_le_bytes(bytes[..Self::SIZE].try_into().unwrap())
			}

			fn append_le(self, out: &mut Vec<u8>) {
				out.extend_from_slice(&self.to_le_bytes());
			}

			fn order(self, other: Self) -> Ordering {
				self.cmp(&other)
			}

			fn midpoint(lo: Self, hi: Self) -> Self {
				lo + (hi - lo) / 2
			}

			fn successor(self) -> Option<Self> {
				self.checked_add(1)
			}

			fn interval_count(lo: Self, hi: Self) -> Option<u128> {
				Some((hi as i128 - lo as i128) as u128 + 1)
			}

			fn to_f64_lossy(self) -> f64 {
				self as f64
			}

			fn to_i128(self) -> Option<i128> {
				Some(self as i128)
			}

			fn from_i128(value: i128) -> Option<Self> {
				<$t>::try_from(value).ok()
			}
		}
	)*};
}

impl_physical_int!(i8, i16, i32, i64, u8, u16, u32, u64);

macro_rules! impl_physical_float {
	($($t:ty),*) => {$(
		impl PhysicalValue for $t {
			const SIZE: usize = std::mem::size_of::<$t>();

			fn read_le(bytes: &[u8]) -> Self {
				<$t>::from_le_bytes(bytes[..Self::SIZE].try_into().unwrap())
			}

			fn append_le(self, out: &mut Vec<u8>) {
				out.extend_from_slice(&self.to_le_bytes());
			}

			fn order(self, other: Self) -> Ordering {
				self.total_cmp(&other)
			}

			fn midpoint(lo: Self, hi: Self) -> Self {
				let mid = lo + (hi - lo) / 2.0;
				// Rounding may land on hi when the interval spans one ulp.
				if mid >= hi { lo } else { mid }
			}

			fn successor(self) -> Option<Self> {
				let next = self.next_up();
				if next.is_infinite() { None } else { Some(next) }
			}

			fn interval_count(_lo: Self, _hi: Self) -> Option<u128> {
				None
			}

			fn to_f64_lossy(self) -> f64 {
				self as f64
			}

			fn to_i128(self) -> Option<i128> {
				None
			}

			fn from_i128(_value: i128) -> Option<Self> {
				None
			}
		}
	)*};
}

impl_physical_float!(f32, f64);

/// Compares two raw values of the given datatype.
///
/// Fixed-size kinds decode and compare numerically; byte kinds compare
/// lexicographically.
pub fn compare_values(datatype: Datatype, a: &[u8], b: &[u8]) -> Ordering {
	dispatch_physical!(
		datatype.physical(),
		T => T::read_le(a).order(T::read_le(b)),
		a.cmp(b)
	)
}

/// Decodes an integral value into `i128` for dense tile arithmetic.
pub fn value_to_i128(datatype: Datatype, bytes: &[u8]) -> Result<i128> {
	ensure!(
		datatype.is_integral(),
		"datatype {datatype} is not integral; cannot use it in dense arithmetic"
	);
	let value = dispatch_physical!(
		datatype.physical(),
		T => T::read_le(bytes).to_i128(),
		None
	);
	match value {
		Some(v) => Ok(v),
		None => bail!("cannot decode {datatype} value as integer"),
	}
}

/// Encodes an `i128` back into the little-endian image of an integral datatype.
pub fn i128_to_value(datatype: Datatype, value: i128) -> Result<Vec<u8>> {
	ensure!(
		datatype.is_integral(),
		"datatype {datatype} is not integral; cannot encode an integer value"
	);
	let bytes = dispatch_physical!(
		datatype.physical(),
		T => T::from_i128(value).map(|v| {
			let mut out = Vec::with_capacity(T::SIZE);
			v.append_le(&mut out);
			out
		}),
		None
	);
	match bytes {
		Some(b) => Ok(b),
		None => bail!("value {value} does not fit datatype {datatype}"),
	}
}
