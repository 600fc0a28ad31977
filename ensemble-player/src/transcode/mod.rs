//! Transcoding seam between the media library and the audio pump
//!
//! The pump consumes 16-bit little-endian signed stereo PCM at 44.1 kHz,
//! regardless of the source codec. [`Transcode`] is the per-item streaming
//! contract; [`TranscodeFactory`] opens items so the engine can be driven
//! by the symphonia-backed decoder in production and by synthetic sources
//! in tests.

mod decoder;
mod resample;

pub use decoder::SymphoniaTranscoder;

use crate::db::media::MediaFile;
use crate::error::Result;

/// A single open transcoding context.
///
/// One context exists per open queue item and is dropped when the item is
/// stopped, advanced past, or cleared.
pub trait Transcode {
    /// Append up to `max_bytes` of PCM to `out`.
    ///
    /// Returns the number of bytes appended; `Ok(0)` means end of stream.
    /// Output format is fixed: 16-bit LE signed stereo at 44.1 kHz.
    fn fill(&mut self, out: &mut Vec<u8>, max_bytes: usize) -> Result<usize>;

    /// Seek to `ms` milliseconds from the start.
    ///
    /// Returns the position actually reached (codecs seek to frame
    /// boundaries, so this may differ from the request).
    fn seek(&mut self, ms: u32) -> Result<u32>;
}

/// Opens transcoding contexts for media files.
pub trait TranscodeFactory: Send + Sync {
    fn open(&self, mfi: &MediaFile) -> Result<Box<dyn Transcode>>;
}

/// Production factory backed by symphonia.
pub struct MediaTranscodeFactory;

impl TranscodeFactory for MediaTranscodeFactory {
    fn open(&self, mfi: &MediaFile) -> Result<Box<dyn Transcode>> {
        Ok(Box::new(SymphoniaTranscoder::open(&mfi.path)?))
    }
}
