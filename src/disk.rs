use crate::error::{CardError, Result};
use crate::types::{Offset, Size, BLOCK_SIZE};
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

/// Fully buffered, read-only card image with shared ownership
#[derive(Clone)]
pub struct RawImage {
    data: Arc<[u8]>,
    size: Size,
}

impl std::fmt::Debug for RawImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawImage").field("size", &self.size).finish()
    }
}

impl RawImage {
    /// Take ownership of an in-memory capture
    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>) -> Self {
        let data: Arc<[u8]> = bytes.into();
        let size = Size::new(data.len() as u64);
        Self { data, size }
    }

    /// Read a card image file.
    ///
    /// The file is memory mapped only long enough to copy it; every later
    /// operation works on the in-memory buffer.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy().to_string();

        let file = File::open(path_ref).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CardError::FileNotFound(path_str.clone())
            } else {
                CardError::Io(e)
            }
        })?;

        if file.metadata()?.len() == 0 {
            return Ok(Self::from_bytes(Vec::new()));
        }

        // Safety: the mapping is read once into an owned buffer and dropped.
        let mmap = unsafe {
            Mmap::map(&file).map_err(|e| CardError::Mmap(format!("Failed to mmap file: {}", e)))?
        };

        Ok(Self::from_bytes(mmap.to_vec()))
    }

    pub fn size(&self) -> Size {
        self.size
    }

    /// Get a slice of the image with bounds checking
    pub fn get_slice(&self, offset: Offset, len: usize) -> Result<&[u8]> {
        let offset_u64 = offset.as_u64();
        let size_u64 = self.size.as_u64();

        if offset_u64 >= size_u64 {
            return Err(CardError::InvalidOffset {
                offset: offset_u64,
                image_size: size_u64,
            });
        }

        let end_offset = offset_u64
            .checked_add(len as u64)
            .ok_or(CardError::InvalidSize {
                offset: offset_u64,
                size: len as u64,
                image_size: size_u64,
            })?;

        if end_offset > size_u64 {
            return Err(CardError::InvalidSize {
                offset: offset_u64,
                size: len as u64,
                image_size: size_u64,
            });
        }

        let start = offset_u64 as usize;
        let end = end_offset as usize;
        Ok(&self.data[start..end])
    }

    /// Bytes of one block
    pub fn block(&self, block: u16) -> Result<&[u8]> {
        let offset = Offset::new(block as u64 * BLOCK_SIZE as u64);
        self.get_slice(offset, BLOCK_SIZE)
    }

    /// Bytes from the start of `block` spanning up to `count` blocks, clipped to the image end
    pub fn blocks_from(&self, block: u16, count: usize) -> Result<&[u8]> {
        let start = block as u64 * BLOCK_SIZE as u64;
        let available = self.size.as_u64().saturating_sub(start);
        let len = (count as u64 * BLOCK_SIZE as u64).min(available);
        self.get_slice(Offset::new(start), len as usize)
    }
}
