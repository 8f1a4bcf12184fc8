//! Byte-exact index of the frames inside a compressed object.
//!
//! A [`FrameTable`] is produced by [`crate::encode::FramedEncoder`] and carried alongside a
//! compressed object (as a sidecar, or kept in memory) so that a reader can translate an
//! uncompressed byte offset into the single compressed frame that covers it, without ever
//! decoding more than one frame's worth of data.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The compression codec a [`FrameTable`] was produced with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Compression {
    /// The object is stored uncompressed; `virt == raw` and there is effectively one frame.
    None,
    /// The object was compressed with zstd, one independent frame at a time.
    Zstd,
}

/// A position in both uncompressed (`u`) and compressed (`c`) byte coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameOffset {
    pub u: i64,
    pub c: i64,
}

impl FrameOffset {
    pub const ZERO: Self = Self { u: 0, c: 0 };

    fn add(self, size: FrameSize) -> Self {
        Self {
            u: self.u + i64::from(size.u),
            c: self.c + i64::from(size.c),
        }
    }
}

/// The uncompressed (`u`) and compressed (`c`) length of a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSize {
    pub u: i32,
    pub c: i32,
}

/// A byte range in uncompressed coordinates unless otherwise noted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: i64,
    pub length: usize,
}

impl Range {
    pub fn new(start: i64, length: usize) -> Self {
        Self { start, length }
    }

    fn end(&self) -> i64 {
        self.start + self.length as i64
    }
}

/// Byte-exact index mapping uncompressed offsets to frame locations.
///
/// # Examples
///
/// ```
/// use snapstore::frame_table::{FrameTable, FrameSize};
///
/// let mut table = FrameTable::new(snapstore::frame_table::Compression::Zstd);
/// table.push_frame(FrameSize { u: 100, c: 40 });
/// table.push_frame(FrameSize { u: 100, c: 45 });
///
/// let (start, size) = table.frame_for(150).unwrap();
/// assert_eq!(start.u, 100);
/// assert_eq!(size.u, 100);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameTable {
    compression: Compression,
    start_at: FrameOffset,
    frames: Vec<FrameSize>,
}

impl FrameTable {
    /// Creates a new, empty frame table starting at offset zero.
    pub fn new(compression: Compression) -> Self {
        Self {
            compression,
            start_at: FrameOffset::ZERO,
            frames: Vec::new(),
        }
    }

    /// Creates a frame table covering a non-zero-origin subset view.
    pub fn with_start_at(compression: Compression, start_at: FrameOffset) -> Self {
        Self {
            compression,
            start_at,
            frames: Vec::new(),
        }
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn start_at(&self) -> FrameOffset {
        self.start_at
    }

    pub fn frames(&self) -> &[FrameSize] {
        &self.frames
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    /// Appends a frame to the table. Called by the encoder as frames complete.
    pub fn push_frame(&mut self, size: FrameSize) {
        self.frames.push(size);
    }

    /// The total uncompressed length covered by this table.
    pub fn total_u(&self) -> i64 {
        self.frames.iter().map(|f| i64::from(f.u)).sum()
    }

    /// The total compressed length covered by this table.
    pub fn total_c(&self) -> i64 {
        self.frames.iter().map(|f| i64::from(f.c)).sum()
    }

    /// Returns the single frame containing `off_u`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::OutOfRange`] if `off_u` lies outside `[start_at.u, start_at.u +
    /// total_u())`.
    pub fn frame_for(&self, off_u: i64) -> Result<(FrameOffset, FrameSize)> {
        if off_u < self.start_at.u || off_u >= self.start_at.u + self.total_u() {
            return Err(Error::OutOfRange);
        }

        let mut cursor = self.start_at;
        for &size in &self.frames {
            let next = cursor.add(size);
            if off_u < next.u {
                return Ok((cursor, size));
            }
            cursor = next;
        }

        // Unreachable: the bounds check above guarantees off_u falls within some frame.
        Err(Error::Fatal("frame_for: no frame found within bounds".into()))
    }

    /// Returns the minimal frame table covering `r`, always expanding to whole frames.
    ///
    /// `r.length == 0` returns an empty table. A range that extends past the end of this table
    /// is silently truncated at the last frame; a range starting before `start_at` fails with
    /// [`Error::BeforeStart`], and a range starting at or beyond the table's end fails with
    /// [`Error::BeyondEnd`].
    pub fn subset(&self, r: Range) -> Result<FrameTable> {
        if r.length == 0 {
            return Ok(FrameTable::with_start_at(self.compression, self.start_at));
        }
        if r.start < self.start_at.u {
            return Err(Error::BeforeStart);
        }
        if r.start >= self.start_at.u + self.total_u() {
            return Err(Error::BeyondEnd);
        }

        let end = r.end();
        let mut cursor = self.start_at;
        let mut subset_start = None;
        let mut frames = Vec::new();

        for &size in &self.frames {
            let next = cursor.add(size);
            let overlaps = cursor.u < end && r.start < next.u;
            if overlaps {
                if subset_start.is_none() {
                    subset_start = Some(cursor);
                }
                frames.push(size);
            } else if subset_start.is_some() {
                break;
            }
            cursor = next;
        }

        Ok(FrameTable {
            compression: self.compression,
            start_at: subset_start.unwrap_or(self.start_at),
            frames,
        })
    }

    /// Translates an uncompressed range into the compressed range of the single frame that
    /// contains it.
    ///
    /// For [`Compression::None`] this is the identity. Otherwise `r` must not cross a frame
    /// boundary, i.e. `r.start + r.length` must lie within the frame containing `r.start`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::CrossesFrame`] if the range spans more than one frame.
    pub fn fetch_range(&self, r: Range) -> Result<Range> {
        if self.compression == Compression::None {
            return Ok(r);
        }

        let (start, size) = self.frame_for(r.start)?;
        if r.end() > start.u + i64::from(size.u) {
            return Err(Error::CrossesFrame);
        }

        Ok(Range::new(start.c, size.c as usize))
    }

    /// Calls `f(offset, frame)` for every frame overlapping `[start, start + length)`.
    pub fn for_each_overlapping(
        &self,
        start: i64,
        length: usize,
        mut f: impl FnMut(FrameOffset, FrameSize),
    ) {
        let end = start + length as i64;
        let mut cursor = self.start_at;
        for &size in &self.frames {
            let next = cursor.add(size);
            if cursor.u < end && start < next.u {
                f(cursor, size);
            }
            cursor = next;
        }
    }
}
