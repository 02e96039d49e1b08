//! Raw access to the backing file of a store.

pub mod file_io;

pub use file_io::FileIo;
