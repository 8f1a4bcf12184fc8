//! A chunk-addressed, frame-compressed content storage layer for moving large artifacts (VM
//! snapshots, disk images, and similar blobs) to and from an S3-compatible object store.
//!
//! Large payloads are split into uncompressed chunks, grouped into independently decodable zstd
//! frames, and indexed by a byte-exact [`frame_table::FrameTable`] so that a random read at any
//! uncompressed offset only ever has to decode the single frame that covers it. Uploads stream
//! frames directly into a concurrent S3 multipart session; reads go through a chunk-addressed
//! local cache that fronts any [`backend::RangeBackend`].
//!
//! # Getting started
//!
//! - [`encode::FramedEncoder`] turns a byte stream into a sequence of [`encode::Frame`]s plus the
//!   [`frame_table::FrameTable`] that indexes them.
//! - [`decode::decode_frame`] decompresses a single frame back into its uncompressed bytes.
//! - [`uploader::upload_stream`] drives a complete encode-then-upload pipeline against a
//!   [`backend::MultipartUpload`] session, bounded by a [`limiter::Limiter`] and retried via
//!   [`retry::RetryPolicy`].
//! - [`object::get_frame`] performs a single frame-aware random read against a
//!   [`backend::RangeBackend`].
//! - [`cache::ChunkCache`] wraps a backend with a read-through (and optionally write-through)
//!   local chunk cache.
//! - [`backend::Backend`] composes the capability traits (`BasicBackend`, `RangeBackend`,
//!   `ManagerBackend`, `PublicUploaderBackend`, `MultipartFactoryBackend`) a concrete adapter
//!   implements; [`backend::local::LocalBackend`] and [`backend::multipart::S3MultipartFactory`]
//!   are the two adapters this crate ships.
//! - [`config::StorageConfig`] and [`config::RetryConfig`] hold every tunable knob.

pub mod backend;
pub mod cache;
pub mod config;
pub mod decode;
pub mod encode;
pub mod error;
pub mod frame_table;
pub mod fsutil;
pub mod limiter;
pub mod object;
pub mod retry;
pub mod uploader;

pub use config::StorageConfig;
pub use error::{Error, Result};
pub use frame_table::{Compression, FrameTable};
