//! SPU output sample buffer.
//!
//! The mixer appends finished stereo pairs here and the audio frontend
//! drains them, usually from its own callback thread, so the storage sits
//! behind a mutex. Sample values and the overflow policy are exactly those
//! of the unguarded hardware path: when the consumer is too slow the extra
//! samples are dropped, never replayed.

use std::cmp::min;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

/// Capacity of the output buffer in interleaved samples (left/right pairs,
/// so half as many stereo samples). At 32.768kHz this is a bit over 31ms of
/// audio, enough to cover one video frame worth of output.
pub const SAMPLE_BUFFER_LEN: usize = 2048;

#[derive(serde::Serialize, serde::Deserialize, Clone)]
pub struct SampleBuffer {
    #[serde(with = "serde_big_array::BigArray")]
    buffer: [i16; SAMPLE_BUFFER_LEN],
    /// Number of valid samples in `buffer`
    len: usize,
}

impl SampleBuffer {
    fn new() -> SampleBuffer {
        SampleBuffer {
            buffer: [0; SAMPLE_BUFFER_LEN],
            len: 0,
        }
    }

    /// Append one stereo pair. If the buffer is full the pair is silently
    /// dropped: the hardware skips the samples a slow consumer couldn't
    /// pick up, it doesn't queue them.
    pub fn push(&mut self, left: i16, right: i16) {
        if self.len + 2 > SAMPLE_BUFFER_LEN {
            return;
        }

        self.buffer[self.len] = left;
        self.buffer[self.len + 1] = right;
        self.len += 2;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Copy out at most `out.len()` buffered samples, returning how many
    /// were written. The internal count always resets to zero: anything the
    /// caller's buffer couldn't hold is discarded, there's no ring to keep
    /// it in.
    pub fn drain(&mut self, out: &mut [i16]) -> usize {
        let n = min(self.len, out.len());

        out[..n].copy_from_slice(&self.buffer[..n]);
        self.len = 0;

        n
    }
}

/// Cloneable handle to the SPU output buffer, shared between the emulation
/// thread (producer) and the audio sink (consumer).
#[derive(Clone)]
pub struct AudioBuffer(Arc<Mutex<SampleBuffer>>);

impl AudioBuffer {
    pub fn new() -> AudioBuffer {
        AudioBuffer(Arc::new(Mutex::new(SampleBuffer::new())))
    }

    /// Number of samples ready to be drained
    pub fn available_samples(&self) -> usize {
        self.lock().len()
    }

    /// Pull-side of the output contract, see [`SampleBuffer::drain`]
    pub fn drain(&self, out: &mut [i16]) -> usize {
        self.lock().drain(out)
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, SampleBuffer> {
        // A poisoned lock means the other side panicked mid-access. The
        // contents are still plain sample data so we keep going.
        match self.0.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        }
    }
}

impl Default for AudioBuffer {
    fn default() -> AudioBuffer {
        AudioBuffer::new()
    }
}

impl Serialize for AudioBuffer {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.lock().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AudioBuffer {
    fn deserialize<D>(deserializer: D) -> Result<AudioBuffer, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let samples = SampleBuffer::deserialize(deserializer)?;

        Ok(AudioBuffer(Arc::new(Mutex::new(samples))))
    }
}
