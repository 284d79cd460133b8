#![warn(missing_docs)]

//! Silt storage layer: object store backends, the value model, sort layouts
//! and immutable data objects with seek indexes.
//!
//! Everything above this crate talks to storage through [`ObjectStore`] and
//! reads or writes records through [`ObjectWriter`] and [`ObjectReader`].

pub mod error;
pub mod frame;
pub mod id;
pub mod layout;
pub mod object;
pub mod reader;
pub mod seek;
pub mod store;
pub mod uri;
pub mod value;
pub mod vector;
pub mod writer;

pub use error::{ErrorKind, StorageError, StorageResult};
pub use frame::{decode_frames, encode_frame, encode_frames, frame_len, FrameDecoder};
pub use id::Id;
pub use layout::{Layout, Nulls, SortOrder, Span};
pub use object::{compare_objects, sort_objects, DataObject, BLOB_EXT};
pub use reader::{read_object, ObjectReader};
pub use seek::{SeekEntry, SeekIndex};
pub use store::{open_store, FileStore, MemoryStore, MemoryStoreStats, ObjectStore, SharedStore};
pub use uri::StorageUri;
pub use value::Value;
pub use vector::VectorObject;
pub use writer::{ObjectWriter, DEFAULT_SEEK_STRIDE};
