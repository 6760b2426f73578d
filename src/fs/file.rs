//! File content model: an ordered list of segments covering the byte
//! range `[0, size)`. Remote block slices and in-memory write buffers
//! interleave freely; a file is dirty exactly when it holds at least
//! one buffer segment.

use crate::manifest::{BlockLocator, StreamSegment};

/// One piece of a file's content.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// A slice of a remote block.
    Block {
        locator: BlockLocator,
        offset: u64,
        len: u64,
    },
    /// Locally written bytes not yet flushed.
    Buffer { data: Vec<u8> },
}

impl Segment {
    pub fn len(&self) -> u64 {
        match self {
            Segment::Block { len, .. } => *len,
            Segment::Buffer { data } => data.len() as u64,
        }
    }
}

/// A chunk of a planned read, resolved under the lock. `Local` chunks
/// carry their bytes; `Remote` chunks are fetched afterwards with the
/// lock released.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedChunk {
    Local(Vec<u8>),
    Remote {
        locator: BlockLocator,
        offset: u64,
        len: u64,
    },
}

#[derive(Debug, Clone)]
pub struct FileNode {
    segments: Vec<Segment>,
    size: u64,
    /// Bumped on every mutation; flush uses it to detect writes that
    /// landed while blocks were uploading with the lock released.
    pub write_generation: u64,
}

impl FileNode {
    /// Empty zero-length file.
    pub fn new() -> Self {
        Self {
            segments: Vec::new(),
            size: 0,
            write_generation: 0,
        }
    }

    /// Build from decoded manifest segments.
    pub fn from_stream_segments(segments: Vec<StreamSegment>) -> Self {
        let mut size = 0;
        let segments = segments
            .into_iter()
            .map(|s| {
                size += s.len;
                Segment::Block {
                    locator: s.locator,
                    offset: s.offset,
                    len: s.len,
                }
            })
            .collect();
        Self {
            segments,
            size,
            write_generation: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn dirty(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Buffer { .. }))
    }

    /// Segments covering `[start, end)`, sliced at the boundaries.
    fn slice(&self, start: u64, end: u64) -> Vec<Segment> {
        let mut out = Vec::new();
        let mut pos = 0u64;
        for seg in &self.segments {
            let seg_len = seg.len();
            let seg_end = pos + seg_len;
            let ov_start = start.max(pos);
            let ov_end = end.min(seg_end);
            if ov_start < ov_end {
                let skip = ov_start - pos;
                let take = ov_end - ov_start;
                match seg {
                    Segment::Block {
                        locator, offset, ..
                    } => out.push(Segment::Block {
                        locator: locator.clone(),
                        offset: offset + skip,
                        len: take,
                    }),
                    Segment::Buffer { data } => out.push(Segment::Buffer {
                        data: data[skip as usize..(skip + take) as usize].to_vec(),
                    }),
                }
            }
            pos = seg_end;
            if pos >= end {
                break;
            }
        }
        out
    }

    /// Merge adjacent buffers and contiguous slices of the same block,
    /// dropping empty segments.
    fn coalesce(segments: Vec<Segment>) -> Vec<Segment> {
        let mut out: Vec<Segment> = Vec::new();
        for seg in segments {
            if seg.len() == 0 {
                continue;
            }
            match (out.last_mut(), seg) {
                (Some(Segment::Buffer { data }), Segment::Buffer { data: next }) => {
                    data.extend_from_slice(&next);
                }
                (
                    Some(Segment::Block {
                        locator, offset, len,
                    }),
                    Segment::Block {
                        locator: next_loc,
                        offset: next_off,
                        len: next_len,
                    },
                ) if *locator == next_loc && *offset + *len == next_off => {
                    *len += next_len;
                }
                (_, seg) => out.push(seg),
            }
        }
        out
    }

    /// Buffer `data` at `offset`, zero-filling any gap past the current
    /// end of file.
    pub fn write(&mut self, offset: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let end = offset + data.len() as u64;
        let mut segments = self.slice(0, offset.min(self.size));
        if offset > self.size {
            segments.push(Segment::Buffer {
                data: vec![0u8; (offset - self.size) as usize],
            });
        }
        segments.push(Segment::Buffer {
            data: data.to_vec(),
        });
        if end < self.size {
            segments.extend(self.slice(end, self.size));
        }
        self.segments = Self::coalesce(segments);
        self.size = self.size.max(end);
        self.write_generation += 1;
    }

    /// Set the file length, discarding tail content or zero-extending.
    pub fn truncate(&mut self, new_size: u64) {
        if new_size == self.size {
            return;
        }
        if new_size < self.size {
            self.segments = Self::coalesce(self.slice(0, new_size));
        } else {
            let mut segments = std::mem::take(&mut self.segments);
            segments.push(Segment::Buffer {
                data: vec![0u8; (new_size - self.size) as usize],
            });
            self.segments = Self::coalesce(segments);
        }
        self.size = new_size;
        self.write_generation += 1;
    }

    /// Resolve a read of `[offset, offset+len)` into chunks, clamped to
    /// the file size. Reads entirely past the end yield an empty plan.
    pub fn read_plan(&self, offset: u64, len: u64) -> Vec<PlannedChunk> {
        let end = (offset + len).min(self.size);
        if offset >= end {
            return Vec::new();
        }
        self.slice(offset, end)
            .into_iter()
            .map(|seg| match seg {
                Segment::Buffer { data } => PlannedChunk::Local(data),
                Segment::Block {
                    locator, offset, len,
                } => PlannedChunk::Remote {
                    locator,
                    offset,
                    len,
                },
            })
            .collect()
    }

    /// All buffered bytes in file order, concatenated. Flush uploads
    /// these as one block.
    pub fn collect_buffers(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for seg in &self.segments {
            if let Segment::Buffer { data } = seg {
                out.extend_from_slice(data);
            }
        }
        out
    }

    /// Replace every buffer segment with a slice of `locator`, which
    /// holds the buffers' bytes in file order. The file becomes clean.
    pub fn commit_buffers(&mut self, locator: &BlockLocator) {
        let mut cursor = 0u64;
        let segments = std::mem::take(&mut self.segments)
            .into_iter()
            .map(|seg| match seg {
                Segment::Buffer { data } => {
                    let len = data.len() as u64;
                    let offset = cursor;
                    cursor += len;
                    Segment::Block {
                        locator: locator.clone(),
                        offset,
                        len,
                    }
                }
                block => block,
            })
            .collect();
        self.segments = Self::coalesce(segments);
    }

    /// Manifest representation of a clean file. Callers must not invoke
    /// this while dirty; buffer segments cannot be serialized.
    pub fn stream_segments(&self) -> Vec<StreamSegment> {
        self.segments
            .iter()
            .map(|seg| match seg {
                Segment::Block {
                    locator, offset, len,
                } => StreamSegment {
                    locator: locator.clone(),
                    offset: *offset,
                    len: *len,
                },
                Segment::Buffer { .. } => unreachable!("dirty file serialized"),
            })
            .collect()
    }
}
