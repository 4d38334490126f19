//! Byte-range I/O: the reader trait, its file and in-memory backends, and
//! little-endian value readers/writers for binary metadata.

mod data_reader;
pub use data_reader::*;

mod data_reader_blob;
pub use data_reader_blob::*;

mod data_reader_file;
pub use data_reader_file::*;

mod value_reader;
pub use value_reader::*;

mod value_writer;
pub use value_writer::*;
