//! Caller-registered output buffers.
//!
//! Each bound field owns a fixed buffer (values, or offsets for var-sized
//! fields), optionally a var buffer and a validity buffer. Capacities are
//! set when binding; sizes report the bytes written by the last submit.

use std::collections::BTreeMap;

/// Capacities requested when binding a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSpec {
	pub fixed_capacity: u64,
	pub var_capacity: Option<u64>,
	pub validity_capacity: Option<u64>,
}

impl BufferSpec {
	/// A fixed-size field buffer.
	pub fn fixed(capacity: u64) -> Self {
		Self {
			fixed_capacity: capacity,
			var_capacity: None,
			validity_capacity: None,
		}
	}

	/// An offsets + var-data buffer pair for a var-sized field.
	pub fn var(offsets_capacity: u64, var_capacity: u64) -> Self {
		Self {
			fixed_capacity: offsets_capacity,
			var_capacity: Some(var_capacity),
			validity_capacity: None,
		}
	}

	pub fn with_validity(mut self, capacity: u64) -> Self {
		self.validity_capacity = Some(capacity);
		self
	}
}

/// One bound output buffer with its write cursor.
#[derive(Debug)]
pub struct QueryBuffer {
	pub fixed: Vec<u8>,
	pub fixed_size: u64,
	pub var: Option<Vec<u8>>,
	pub var_size: u64,
	pub validity: Option<Vec<u8>>,
	pub validity_size: u64,
}

impl QueryBuffer {
	fn from_spec(spec: BufferSpec) -> Self {
		Self {
			fixed: vec![0u8; spec.fixed_capacity as usize],
			fixed_size: 0,
			var: spec.var_capacity.map(|c| vec![0u8; c as usize]),
			var_size: 0,
			validity: spec.validity_capacity.map(|c| vec![0u8; c as usize]),
			validity_size: 0,
		}
	}

	pub fn fixed_capacity(&self) -> u64 {
		self.fixed.len() as u64
	}

	pub fn var_capacity(&self) -> u64 {
		self.var.as_ref().map_or(0, |v| v.len() as u64)
	}

	pub fn validity_capacity(&self) -> u64 {
		self.validity.as_ref().map_or(0, |v| v.len() as u64)
	}

	pub fn reset_sizes(&mut self) {
		self.fixed_size = 0;
		self.var_size = 0;
		self.validity_size = 0;
	}

	/// The written portions of the buffers.
	pub fn view(&self) -> ResultBufferView<'_> {
		ResultBufferView {
			data: &self.fixed[..self.fixed_size as usize],
			var: self.var.as_ref().map(|v| &v[..self.var_size as usize]),
			validity: self.validity.as_ref().map(|v| &v[..self.validity_size as usize]),
		}
	}

	pub fn sizes(&self) -> (u64, Option<u64>, Option<u64>) {
		(
			self.fixed_size,
			self.var.as_ref().map(|_| self.var_size),
			self.validity.as_ref().map(|_| self.validity_size),
		)
	}
}

/// Read access to the bytes a submit call produced.
#[derive(Debug, Clone, Copy)]
pub struct ResultBufferView<'a> {
	/// Fixed values, or offsets for var-sized fields.
	pub data: &'a [u8],
	pub var: Option<&'a [u8]>,
	pub validity: Option<&'a [u8]>,
}

/// All buffers bound to one query, keyed by field name.
#[derive(Debug, Default)]
pub struct QueryBuffers {
	buffers: BTreeMap<String, QueryBuffer>,
}

impl QueryBuffers {
	pub fn set(&mut self, name: &str, spec: BufferSpec) {
		self.buffers.insert(name.to_string(), QueryBuffer::from_spec(spec));
	}

	pub fn get(&self, name: &str) -> Option<&QueryBuffer> {
		self.buffers.get(name)
	}

	pub fn get_mut(&mut self, name: &str) -> Option<&mut QueryBuffer> {
		self.buffers.get_mut(name)
	}

	pub fn names(&self) -> impl Iterator<Item = &str> {
		self.buffers.keys().map(String::as_str)
	}

	pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut QueryBuffer)> {
		self.buffers.iter_mut().map(|(k, v)| (k.as_str(), v))
	}

	pub fn is_empty(&self) -> bool {
		self.buffers.is_empty()
	}

	pub fn reset_sizes(&mut self) {
		for buffer in self.buffers.values_mut() {
			buffer.reset_sizes();
		}
	}

	/// `true` when the last submit wrote at least one byte somewhere.
	pub fn has_results(&self) -> bool {
		self
			.buffers
			.values()
			.any(|b| b.fixed_size > 0 || b.var_size > 0 || b.validity_size > 0)
	}
}
