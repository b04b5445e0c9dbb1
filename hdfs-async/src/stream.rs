//! Sequential helpers over file handles.

use bytes::Bytes;
use futures::Stream;
use futures::stream;
use log::warn;

use crate::driver::Driver;
use crate::error::{Error, ErrorOutcome, Result};
use crate::file::{FileReader, FileWriter, HandleState};

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Chunks of the file behind `reader`, one read in flight at a time.
///
/// The reader is opened if it has not been yet, and closed at end of file
/// or after the first error, which ends the stream.
pub fn read_stream<D: Driver>(
    reader: FileReader<D>,
    chunk_size: usize,
) -> impl Stream<Item = Result<Bytes>> {
    let chunk_size = chunk_size.max(1);
    stream::unfold(Some(reader), move |reader| async move {
        let Some(reader) = reader else {
            return None;
        };
        match next_chunk(&reader, chunk_size).await {
            Ok(Some(chunk)) => Some((Ok(chunk), Some(reader))),
            Ok(None) => match reader.close().await {
                Ok(()) => None,
                Err(e) => Some((Err(e.into()), None)),
            },
            Err(e) => {
                if let Err(close_err) = reader.close().await {
                    warn!("closing {} after a failed read: {close_err}", reader.path());
                }
                Some((Err(e), None))
            }
        }
    })
}

async fn next_chunk<D: Driver>(
    reader: &FileReader<D>,
    chunk_size: usize,
) -> Result<Option<Bytes>> {
    if reader.state() == HandleState::Created {
        reader.open()?.await?;
    }
    let chunk = reader.read(chunk_size)?.await?;
    Ok((!chunk.is_empty()).then_some(chunk))
}

/// Write all of `data` through an open `writer`, `chunk_size` bytes per
/// call. Returns the number of bytes written.
pub async fn write_all<D: Driver>(
    writer: &FileWriter<D>,
    data: Bytes,
    chunk_size: usize,
) -> Result<usize> {
    let chunk_size = chunk_size.max(1);
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + chunk_size).min(data.len());
        let n = writer.write(data.slice(offset..end))?.await?;
        if n == 0 {
            return Err(Error::Native(ErrorOutcome::new(
                libc::EIO,
                format!("write to {} made no progress", writer.path()),
            )));
        }
        offset += n;
    }
    Ok(offset)
}
