//! Audio hardware seams.
//!
//! The core never touches I²S; it exchanges 20 ms frames of 8 kHz 16-bit
//! PCM with whatever implements these traits. The built-in implementations
//! keep the agent functional without hardware: the microphone is silent and
//! the speaker discards.

use codec::rtp::FRAME_SAMPLES;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

/// Produces one microphone frame per 20 ms tick.
pub trait FrameSource: Send + 'static {
    fn next_frame(&mut self, frame: &mut [i16; FRAME_SAMPLES]);
}

/// Consumes decoded speaker frames. Samples arrive as 32-bit words with the
/// 16-bit sample duplicated into both stereo halves.
pub trait FrameSink: Send + 'static {
    fn play(&mut self, frame: &[u32; FRAME_SAMPLES]);
}

/// Duplicate a mono sample into both halves of a stereo word.
pub fn widen(sample: i16) -> u32 {
    let half = u32::from(sample as u16);
    (half << 16) | half
}

/// A silent microphone.
pub struct Silence;

impl FrameSource for Silence {
    fn next_frame(&mut self, frame: &mut [i16; FRAME_SAMPLES]) {
        frame.fill(0);
    }
}

/// A speaker that swallows everything.
pub struct Discard;

impl FrameSink for Discard {
    fn play(&mut self, _frame: &[u32; FRAME_SAMPLES]) {}
}

/// Microphone fed from a channel, e.g. by an I²S capture task. Underruns
/// play silence rather than stalling the 20 ms cadence.
pub struct ChannelSource {
    frames: UnboundedReceiver<[i16; FRAME_SAMPLES]>,
}

impl ChannelSource {
    pub fn new() -> (UnboundedSender<[i16; FRAME_SAMPLES]>, Self) {
        let (sender, frames) = unbounded_channel();
        (sender, Self { frames })
    }
}

impl FrameSource for ChannelSource {
    fn next_frame(&mut self, frame: &mut [i16; FRAME_SAMPLES]) {
        match self.frames.try_recv() {
            Ok(next) => *frame = next,
            Err(_) => frame.fill(0),
        }
    }
}

/// Speaker handing frames to a channel. A vanished consumer mutes the call
/// instead of failing it.
pub struct ChannelSink {
    frames: UnboundedSender<[u32; FRAME_SAMPLES]>,
}

impl ChannelSink {
    pub fn new() -> (Self, UnboundedReceiver<[u32; FRAME_SAMPLES]>) {
        let (frames, receiver) = unbounded_channel();
        (Self { frames }, receiver)
    }
}

impl FrameSink for ChannelSink {
    fn play(&mut self, frame: &[u32; FRAME_SAMPLES]) {
        let _ = self.frames.send(*frame);
    }
}
