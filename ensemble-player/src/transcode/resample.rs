//! Sample-rate conversion to the 44.1 kHz stream rate using rubato

use crate::error::{Error, Result};
use ensemble_common::timing::SAMPLE_RATE;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

/// Resample interleaved stereo f32 audio to 44.1 kHz.
///
/// Returns the input untouched when it is already at the stream rate.
pub fn resample_to_stream_rate(input: Vec<f32>, input_rate: u32) -> Result<Vec<f32>> {
    if input_rate == SAMPLE_RATE || input.is_empty() {
        return Ok(input);
    }

    let planar = deinterleave(&input);
    let frames = planar[0].len();

    let mut resampler = FastFixedIn::<f32>::new(
        SAMPLE_RATE as f64 / input_rate as f64,
        1.0,
        PolynomialDegree::Septic,
        frames,
        2,
    )
    .map_err(|e| Error::Transcode(format!("failed to create resampler: {}", e)))?;

    let output = resampler
        .process(&planar, None)
        .map_err(|e| Error::Transcode(format!("resampling failed: {}", e)))?;

    Ok(interleave(output))
}

/// [L, R, L, R, ...] -> [[L, L, ...], [R, R, ...]]
fn deinterleave(samples: &[f32]) -> Vec<Vec<f32>> {
    let frames = samples.len() / 2;
    let mut planar = vec![Vec::with_capacity(frames), Vec::with_capacity(frames)];

    for frame in samples.chunks_exact(2) {
        planar[0].push(frame[0]);
        planar[1].push(frame[1]);
    }

    planar
}

/// [[L, L, ...], [R, R, ...]] -> [L, R, L, R, ...]
fn interleave(planar: Vec<Vec<f32>>) -> Vec<f32> {
    let frames = planar[0].len();
    let mut interleaved = Vec::with_capacity(frames * 2);

    for i in 0..frames {
        interleaved.push(planar[0][i]);
        interleaved.push(planar[1][i]);
    }

    interleaved
}
