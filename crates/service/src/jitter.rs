//! Inbound audio jitter buffer.
//!
//! A handful of decoded frames are held back and released in timestamp
//! order, trading roughly 100 ms of added latency for tolerance to minor
//! packet reordering and burstiness. There is no retransmission and no loss
//! concealment; on overflow the oldest frame is dropped silently.

use codec::rtp::FRAME_SAMPLES;

/// Frames held before the first one is released to the sink.
pub const VOIP_BUFFER_LEN: usize = 5;

/// One decoded 20 ms frame keyed by its RTP timestamp.
#[derive(Clone)]
pub struct Frame {
    pub timestamp: u32,
    pub samples: [i16; FRAME_SAMPLES],
}

/// Single-producer, single-consumer reorder buffer. The network receive
/// path pushes, the speaker pacing pops; both run on the audio pump task.
#[derive(Default)]
pub struct JitterBuffer {
    frames: Vec<Frame>,
}

impl JitterBuffer {
    pub fn new() -> Self {
        Self {
            frames: Vec::with_capacity(VOIP_BUFFER_LEN),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.frames.len() >= VOIP_BUFFER_LEN
    }

    /// Insert a frame, evicting the oldest one when the buffer is already
    /// full.
    pub fn push(&mut self, frame: Frame) {
        if self.is_full() {
            if let Some(oldest) = self.position_of_min() {
                self.frames.swap_remove(oldest);
            }
        }

        self.frames.push(frame);
    }

    /// Remove and return the frame with the lowest timestamp.
    pub fn pop_min(&mut self) -> Option<Frame> {
        let position = self.position_of_min()?;
        Some(self.frames.swap_remove(position))
    }

    fn position_of_min(&self) -> Option<usize> {
        self.frames
            .iter()
            .enumerate()
            .min_by_key(|(_, frame)| frame.timestamp)
            .map(|(position, _)| position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(timestamp: u32) -> Frame {
        Frame {
            timestamp,
            samples: [0; FRAME_SAMPLES],
        }
    }

    #[test]
    fn reordered_frames_come_out_in_timestamp_order() {
        let mut buffer = JitterBuffer::new();

        for timestamp in [160, 480, 320, 640, 800] {
            buffer.push(frame(timestamp));
        }
        assert!(buffer.is_full());

        let mut delivered = Vec::new();
        while let Some(frame) = buffer.pop_min() {
            delivered.push(frame.timestamp);
        }

        assert_eq!(delivered, [160, 320, 480, 640, 800]);
    }

    #[test]
    fn overflow_drops_the_oldest_frame() {
        let mut buffer = JitterBuffer::new();

        for timestamp in [160, 320, 480, 640, 800, 960] {
            buffer.push(frame(timestamp));
        }

        assert_eq!(buffer.len(), VOIP_BUFFER_LEN);
        assert_eq!(buffer.pop_min().map(|frame| frame.timestamp), Some(320));
    }
}
