//! Reading fixed-size slices of a local file into part buffers

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};

/// Minimum size of every part but the last, imposed by the multipart protocol.
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Reads up to `size` bytes, stopping early only at end of stream.
pub async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R, size: usize) -> std::io::Result<Bytes> {
    let mut buffer = BytesMut::with_capacity(size);
    while buffer.len() < size {
        let mut limited = (&mut *reader).take((size - buffer.len()) as u64);
        let read = limited.read_buf(&mut buffer).await?;
        if read == 0 {
            break;
        }
    }
    Ok(buffer.freeze())
}

/// Reads exactly `size` bytes starting at `offset`, failing on a short read.
pub async fn read_exact_at(
    file: &mut tokio::fs::File,
    offset: u64,
    size: usize,
) -> std::io::Result<Bytes> {
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let data = read_chunk(file, size).await?;
    if data.len() != size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!(
                "expected {} bytes at offset {}, found only {}",
                size,
                offset,
                data.len()
            ),
        ));
    }
    Ok(data)
}

/// Byte offset of a full-size part.
pub fn part_offset(part_number: u32) -> u64 {
    u64::from(part_number.saturating_sub(1)) * MIN_PART_SIZE
}
