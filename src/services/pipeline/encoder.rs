use audiopus::coder::Encoder as OpusEncoder;
use audiopus::{Application, Bitrate, Channels, SampleRate};
use log::debug;

use crate::config::{MAX_OPUS_PACKET, OPUS_BITRATE};
use crate::error::Result;

/// Turns one PCM chunk into one encoded frame.
pub trait FrameEncoder {
    /// An empty result means there is nothing to send for this tick.
    fn encode(&mut self, pcm: &[u8]) -> Vec<u8>;
}

pub struct OpusFrameEncoder {
    encoder: OpusEncoder,
    samples: Vec<i16>,
    packet: Vec<u8>,
}

impl OpusFrameEncoder {
    pub fn new() -> Result<Self> {
        let mut encoder =
            OpusEncoder::new(SampleRate::Hz48000, Channels::Stereo, Application::Audio)?;
        encoder.set_bitrate(Bitrate::BitsPerSecond(OPUS_BITRATE))?;

        Ok(Self {
            encoder,
            samples: Vec::new(),
            packet: vec![0; MAX_OPUS_PACKET],
        })
    }
}

impl FrameEncoder for OpusFrameEncoder {
    fn encode(&mut self, pcm: &[u8]) -> Vec<u8> {
        pcm_to_samples(pcm, &mut self.samples);
        match self.encoder.encode(&self.samples, &mut self.packet) {
            Ok(len) => self.packet[..len].to_vec(),
            Err(e) => {
                debug!("Opus encode failed: {:?}", e);
                Vec::new()
            }
        }
    }
}

// Little-endian byte pairs to interleaved samples
pub fn pcm_to_samples(pcm: &[u8], out: &mut Vec<i16>) {
    out.clear();
    out.extend(pcm.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]])));
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::FRAME_BYTES;

    #[test]
    fn bytes_become_le_samples() {
        let mut out = Vec::new();
        pcm_to_samples(&[0x01, 0x00, 0xff, 0xff, 0x00, 0x80], &mut out);
        assert_eq!(out, vec![1, -1, i16::MIN]);
    }

    #[test]
    fn silence_encodes_to_a_packet() {
        let mut encoder = OpusFrameEncoder::new().unwrap();
        let frame = encoder.encode(&vec![0u8; FRAME_BYTES]);
        assert!(!frame.is_empty());
        assert!(frame.len() <= MAX_OPUS_PACKET);
    }

    #[test]
    fn wrong_sized_chunk_yields_empty_frame() {
        let mut encoder = OpusFrameEncoder::new().unwrap();
        assert!(encoder.encode(&[0u8; 100]).is_empty());
    }
}
