//! # Outbound Audio Streams
//!
//! Turns a byte source into one `playStream.start`, a run of `playStream.chunk`
//! messages and one `playStream.stop`.
//!
//! ## One stream at a time
//! Every conversation owns a [`PlaybackControl`]. Starting a stream cancels the one in
//! progress and then waits for its turn, so chunks of two streams never interleave on
//! the wire. The superseded stream still sends its `playStream.stop` before it yields.
//!
//! ## Cancellation
//! The loop checks whether the conversation ended before every chunk. An ended
//! conversation stops the stream on the spot without a `playStream.stop`.
//!
//! ## Flow control
//! Chunks are not paced against the peer or against real time. Each chunk send waits
//! only until the transport accepted the frame, so a long prompt is queued on the
//! socket as fast as it can be read.

use crate::conversation::Conversation;
use crate::error::{PlaybackError, SendError};
use crate::protocol::OutboundMessage;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// How a call to [`play_stream`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// Every chunk and the stop message went out
    Completed,
    /// The conversation ended mid-stream; no stop message was sent
    Cancelled,
    /// A newer stream took over; the stop message was sent
    Superseded,
}

#[derive(Debug)]
struct ActiveStream {
    generation: u64,
    token: CancellationToken,
}

/// Per-conversation coordinator of outbound streams.
#[derive(Debug, Default)]
pub struct PlaybackControl {
    next_stream: AtomicU64,
    generation: AtomicU64,
    active: Mutex<Option<ActiveStream>>,
    turn: tokio::sync::Mutex<()>,
}

/// Exclusive right to emit one stream. Released on drop.
pub struct PlaybackTurn<'a> {
    control: &'a PlaybackControl,
    generation: u64,
    token: CancellationToken,
    _turn: tokio::sync::MutexGuard<'a, ()>,
}

impl PlaybackTurn<'_> {
    fn superseded(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for PlaybackTurn<'_> {
    fn drop(&mut self) {
        let mut active = self.control.active.lock();
        if active.as_ref().map(|a| a.generation) == Some(self.generation) {
            *active = None;
        }
    }
}

impl PlaybackControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the stream in progress and wait until it has finished.
    pub async fn begin(&self) -> PlaybackTurn<'_> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        {
            let mut active = self.active.lock();
            let previous = active.replace(ActiveStream {
                generation,
                token: token.clone(),
            });
            if let Some(previous) = previous {
                previous.token.cancel();
            }
        }

        let turn = self.turn.lock().await;
        PlaybackTurn {
            control: self,
            generation,
            token,
            _turn: turn,
        }
    }

    /// Allocate the next stream id.
    pub fn next_stream_id(&self) -> String {
        format!("stream-{}", self.next_stream.fetch_add(1, Ordering::SeqCst) + 1)
    }

    #[cfg(test)]
    pub fn is_streaming(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Cancel whatever stream is in progress.
    pub fn abort(&self) {
        if let Some(active) = self.active.lock().as_ref() {
            active.token.cancel();
        }
    }
}

/// Fill `buf` from `source`, short only at end of input.
async fn read_chunk<R>(source: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let read = source.read(&mut buf[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

/// A send that failed because the conversation ended counts as cancellation.
fn closed(result: Result<(), SendError>) -> Result<bool, PlaybackError> {
    match result {
        Ok(()) => Ok(false),
        Err(SendError::ConnectionClosed) => Ok(true),
        Err(err) => Err(err.into()),
    }
}

/// Stream `source` to the platform in chunks of `chunk_size` bytes.
///
/// ## Returns:
/// - **Completed** after exactly `ceil(N / chunk_size)` chunks and one stop
/// - **Cancelled** when the conversation ended before the stream finished
/// - **Superseded** when a newer stream started; everything up to that point was
///   sent, followed by a stop
///
/// Errors are transport failures other than "connection closed" and source read
/// failures. The stream is abandoned without a stop in both cases.
pub async fn play_stream<R>(
    conversation: &Conversation,
    mut source: R,
    media_format: &str,
    chunk_size: usize,
) -> Result<PlaybackOutcome, PlaybackError>
where
    R: AsyncRead + Unpin + Send,
{
    let playback = conversation.playback();
    let turn = playback.begin().await;
    if conversation.is_ended() {
        return Ok(PlaybackOutcome::Cancelled);
    }
    if turn.superseded() {
        return Ok(PlaybackOutcome::Superseded);
    }

    let stream_id = playback.next_stream_id();
    let conversation_id = conversation.id().unwrap_or_default().to_string();
    info!(conversation_id = %conversation_id, stream_id = %stream_id, media_format, "Starting play stream");

    let start = OutboundMessage::PlayStreamStart {
        stream_id: stream_id.clone(),
        media_format: media_format.to_string(),
    };
    if closed(conversation.send(start).await)? {
        return Ok(PlaybackOutcome::Cancelled);
    }

    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut chunks = 0usize;
    let mut outcome = PlaybackOutcome::Completed;
    loop {
        if conversation.is_ended() {
            debug!(conversation_id = %conversation_id, stream_id = %stream_id, chunks, "Play stream cancelled");
            return Ok(PlaybackOutcome::Cancelled);
        }
        if turn.superseded() {
            outcome = PlaybackOutcome::Superseded;
            break;
        }

        let read = read_chunk(&mut source, &mut buf).await?;
        if read == 0 {
            break;
        }

        let chunk = OutboundMessage::PlayStreamChunk {
            stream_id: stream_id.clone(),
            audio_chunk: STANDARD.encode(&buf[..read]),
        };
        if closed(conversation.send(chunk).await)? {
            return Ok(PlaybackOutcome::Cancelled);
        }
        chunks += 1;
    }

    let stop = OutboundMessage::PlayStreamStop {
        stream_id: stream_id.clone(),
    };
    if closed(conversation.send(stop).await)? {
        return Ok(PlaybackOutcome::Cancelled);
    }

    info!(conversation_id = %conversation_id, stream_id = %stream_id, chunks, ?outcome, "Play stream finished");
    Ok(outcome)
}
