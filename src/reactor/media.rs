//! The audio pump: two 20 ms cadences over one RTP socket.
//!
//! TX reads a microphone frame on every tick, compands it with the
//! negotiated law and sends it as one RTP packet. RX decodes every inbound
//! datagram into the jitter buffer and, once the buffer holds its five
//! frames, releases the lowest-timestamped one to the speaker.
//!
//! The companding law is latched once per call: from the SDP of the dialog
//! when it named one, otherwise from the first inbound packet. Later
//! changes are ignored until the next call.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::{BufMut, BytesMut};
use codec::{
    g711,
    rtp::{self, FRAME_SAMPLES, HEADER_LEN, Header, Session},
};
use service::jitter::{Frame, JitterBuffer};
use tokio::{
    net::UdpSocket,
    time::{MissedTickBehavior, interval},
};

use crate::audio::{FrameSink, FrameSource, widen};

const FRAME_INTERVAL: Duration = Duration::from_millis(20);

pub(crate) struct MediaOptions {
    pub socket: Arc<UdpSocket>,
    pub peer: SocketAddr,
    pub ssrc: u32,
    /// Companding law from the dialog's SDP, when it carried one.
    pub payload_type: Option<u8>,
}

pub(crate) async fn run<S, D>(options: MediaOptions, mut source: S, mut sink: D)
where
    S: FrameSource,
    D: FrameSink,
{
    let mut session = options
        .payload_type
        .map(|payload_type| Session::new(payload_type, options.ssrc));

    let mut jitter = JitterBuffer::new();

    let mut ticker = interval(FRAME_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut pcm = [0i16; FRAME_SAMPLES];
    let mut datagram = BytesMut::with_capacity(HEADER_LEN + FRAME_SAMPLES);
    let mut receive_buffer = vec![0u8; 2048];

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // Nothing goes out until a companding law is known.
                let Some(session) = session.as_mut() else {
                    continue;
                };

                source.next_frame(&mut pcm);

                let encode: fn(i16) -> u8 = match session.payload_type() {
                    rtp::PT_PCMA => g711::linear_to_alaw,
                    _ => g711::linear_to_ulaw,
                };

                datagram.clear();
                session.next_header().encode(&mut datagram);
                for &sample in pcm.iter() {
                    datagram.put_u8(encode(sample));
                }

                if let Err(error) = options.socket.try_send_to(&datagram, options.peer) {
                    log::debug!("rtp socket send error: {error}");
                }
            }
            received = options.socket.recv_from(&mut receive_buffer) => {
                let (size, _) = match received {
                    Ok(received) => received,
                    Err(error) => {
                        log::debug!("rtp socket receive error: {error}");
                        continue;
                    }
                };

                let Ok((header, payload)) = Header::decode(&receive_buffer[..size]) else {
                    continue;
                };

                if !rtp::is_audio(header.payload_type) {
                    continue;
                }

                let session = session
                    .get_or_insert_with(|| Session::new(header.payload_type, options.ssrc));

                let decode: fn(u8) -> i16 = match session.payload_type() {
                    rtp::PT_PCMA => g711::alaw_to_linear,
                    _ => g711::ulaw_to_linear,
                };

                let mut frame = Frame {
                    timestamp: header.timestamp,
                    samples: [0; FRAME_SAMPLES],
                };
                for (slot, &byte) in frame.samples.iter_mut().zip(payload.iter()) {
                    *slot = decode(byte);
                }

                jitter.push(frame);

                if jitter.is_full() {
                    if let Some(frame) = jitter.pop_min() {
                        let mut stereo = [0u32; FRAME_SAMPLES];
                        for (word, &sample) in stereo.iter_mut().zip(frame.samples.iter()) {
                            *word = widen(sample);
                        }
                        sink.play(&stereo);
                    }
                }
            }
        }
    }
}
