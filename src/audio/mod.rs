//! # Audio Module
//!
//! Both directions of the audio pipeline carried inside the bot protocol:
//!
//! - **buffer**: inbound `userStream.chunk` accumulation
//! - **stream**: outbound `playStream.start/chunk/stop` emission
//!
//! ## Media Formats:
//! Audio is opaque bytes to the protocol. The format label (for example `raw/lpcm16`,
//! 16kHz 16-bit little-endian mono) is only needed to size silence and report durations.

pub mod buffer;
pub mod stream;

use bytes::Bytes;
use std::time::Duration;

/// Bytes per second of audio for the raw formats the platform negotiates.
pub fn bytes_per_second(media_format: &str) -> Option<u32> {
    match media_format {
        "raw/lpcm16" => Some(16_000 * 2),
        "raw/lpcm16_8" | "raw/lpcm16_8k" => Some(8_000 * 2),
        "raw/lpcm16_24" | "raw/lpcm16_24k" => Some(24_000 * 2),
        "raw/mulaw" | "raw/alaw" => Some(8_000),
        _ => None,
    }
}

/// Silent audio of the given length. Unknown formats fall back to 16-bit PCM silence.
pub fn silence(media_format: &str, duration: Duration) -> Bytes {
    let rate = bytes_per_second(media_format).unwrap_or(32_000);
    let mut len = (rate as f64 * duration.as_secs_f64()) as usize;
    // G.711 silence is not zero
    let fill = match media_format {
        "raw/mulaw" => 0xFF,
        "raw/alaw" => 0xD5,
        _ => {
            len -= len % 2;
            0x00
        }
    };
    Bytes::from(vec![fill; len])
}
