//! Source streams: lazy, fixed-step PCM frame sequences over a playlist.
//!
//! Decoding to PCM happens outside this crate; the [`Source`] trait is the
//! boundary. A [`SourceStream`] walks an ordered playlist of sources and
//! hands the scheduler uniform frames, supports returning unplayed frames
//! for seamless resume, and absorbs read errors as silence.

use std::collections::VecDeque;
use std::io;

use bytes::Bytes;

use crate::error::{CoreError, CoreResult};

/// Opaque source identifier (track id in the external library).
pub type SourceId = String;

/// One fixed-size chunk of PCM drawn from a source.
///
/// Packet numbers are assigned later by the broadcaster; the stream only
/// knows which source a chunk belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The source this frame was read from.
    pub source_id: SourceId,
    /// Exactly one step of PCM.
    pub bytes: Bytes,
}

/// Result of pulling the next frame from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// A frame is available.
    Frame(Frame),
    /// The playlist is exhausted.
    End,
}

/// Decode boundary: something that yields PCM bytes on demand.
pub trait Source: Send {
    /// Source identity, stable for the source's lifetime.
    fn id(&self) -> &str;

    /// Total PCM length when known (used for duration/progress reporting).
    fn len_bytes(&self) -> Option<u64>;

    /// Reads up to `step` bytes of PCM. `Ok(None)` means exhausted; short
    /// reads are zero-padded by the stream.
    fn read_step(&mut self, step: usize) -> io::Result<Option<Bytes>>;

    /// Rewinds to the beginning of the source.
    fn rewind(&mut self);
}

/// In-memory source over pre-decoded PCM. The basic implementation, and
/// the one tests use.
pub struct MemorySource {
    id: SourceId,
    data: Bytes,
    pos: usize,
}

impl MemorySource {
    /// Wraps a PCM buffer as a source.
    #[must_use]
    pub fn new(id: impl Into<SourceId>, data: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            data: data.into(),
            pos: 0,
        }
    }
}

impl Source for MemorySource {
    fn id(&self) -> &str {
        &self.id
    }

    fn len_bytes(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn read_step(&mut self, step: usize) -> io::Result<Option<Bytes>> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }
        let end = (self.pos + step).min(self.data.len());
        let chunk = self.data.slice(self.pos..end);
        self.pos = end;
        Ok(Some(chunk))
    }

    fn rewind(&mut self) {
        self.pos = 0;
    }
}

/// A lazy sequence of fixed-size PCM frames over an ordered playlist.
///
/// Consecutive `next_frame` calls yield frames whose `source_id` is equal
/// or strictly advances in playlist order, then `End`. Source transitions
/// are the signal downstream uses to announce "track changed".
pub struct SourceStream {
    playlist: Vec<Box<dyn Source>>,
    cursor: usize,
    /// Unplayed frames pushed back for resumption; served before the
    /// playlist.
    rebuffered: VecDeque<Frame>,
    step: usize,
    byte_rate: u64,
    error_limit: u32,
    consecutive_errors: u32,
}

impl SourceStream {
    /// Builds a stream over `playlist` producing `step`-byte frames.
    ///
    /// `byte_rate` (PCM bytes per second) converts byte counts to
    /// durations for progress reporting.
    #[must_use]
    pub fn new(playlist: Vec<Box<dyn Source>>, step: usize, byte_rate: u64, error_limit: u32) -> Self {
        Self {
            playlist,
            cursor: 0,
            rebuffered: VecDeque::new(),
            step,
            byte_rate,
            error_limit,
            consecutive_errors: 0,
        }
    }

    /// Yields the next fixed-size frame, or `End` when the playlist is
    /// exhausted.
    ///
    /// Read errors produce a silent frame of equal size; after
    /// `error_limit` consecutive failures the stream advances to the next
    /// source.
    pub fn next_frame(&mut self) -> StreamFrame {
        if let Some(frame) = self.rebuffered.pop_front() {
            return StreamFrame::Frame(frame);
        }

        while self.cursor < self.playlist.len() {
            let source = &mut self.playlist[self.cursor];
            match source.read_step(self.step) {
                Ok(Some(chunk)) => {
                    self.consecutive_errors = 0;
                    return StreamFrame::Frame(Frame {
                        source_id: source.id().to_string(),
                        bytes: pad_to_step(chunk, self.step),
                    });
                }
                Ok(None) => {
                    self.cursor += 1;
                    self.consecutive_errors = 0;
                }
                Err(e) => {
                    self.consecutive_errors += 1;
                    log::warn!(
                        "[SourceStream] Read error on {} ({}/{}): {}",
                        source.id(),
                        self.consecutive_errors,
                        self.error_limit,
                        e
                    );
                    if self.consecutive_errors >= self.error_limit {
                        log::warn!(
                            "[SourceStream] Giving up on {} after {} consecutive errors",
                            source.id(),
                            self.consecutive_errors
                        );
                        self.cursor += 1;
                        self.consecutive_errors = 0;
                        continue;
                    }
                    // Substitute silence so playback timing is undisturbed
                    return StreamFrame::Frame(Frame {
                        source_id: source.id().to_string(),
                        bytes: Bytes::from(vec![0u8; self.step]),
                    });
                }
            }
        }
        StreamFrame::End
    }

    /// Prepends unplayed frames so the next `next_frame` returns
    /// `frames[0]`. Relative order is preserved.
    pub fn rebuffer(&mut self, frames: Vec<Frame>) {
        for frame in frames.into_iter().rev() {
            self.rebuffered.push_front(frame);
        }
    }

    /// Discards all buffered output without moving the playlist cursor.
    pub fn flush(&mut self) {
        self.rebuffered.clear();
    }

    /// Rewinds to the start of the current playlist position.
    pub fn reset(&mut self) {
        self.rebuffered.clear();
        if let Some(source) = self.playlist.get_mut(self.cursor) {
            source.rewind();
        }
    }

    /// Moves the cursor to the named source and rewinds it.
    ///
    /// # Errors
    ///
    /// `CoreError::UnknownSource` when the id is not in the playlist; the
    /// stream is unchanged.
    pub fn skip_to(&mut self, source_id: &str) -> CoreResult<()> {
        let index = self
            .playlist
            .iter()
            .position(|s| s.id() == source_id)
            .ok_or_else(|| CoreError::UnknownSource(source_id.to_string()))?;
        self.cursor = index;
        self.playlist[index].rewind();
        self.consecutive_errors = 0;
        Ok(())
    }

    /// Whether the playlist contains the named source.
    #[must_use]
    pub fn contains(&self, source_id: &str) -> bool {
        self.playlist.iter().any(|s| s.id() == source_id)
    }

    /// Id of the source the next pull will read from, if any.
    #[must_use]
    pub fn current_source_id(&self) -> Option<&str> {
        if let Some(frame) = self.rebuffered.front() {
            return Some(&frame.source_id);
        }
        self.playlist.get(self.cursor).map(|s| s.id())
    }

    /// Duration of the named source in milliseconds, 0 when unknown.
    #[must_use]
    pub fn source_duration_ms(&self, source_id: &str) -> u64 {
        self.playlist
            .iter()
            .find(|s| s.id() == source_id)
            .and_then(|s| s.len_bytes())
            .map(|len| len * 1_000 / self.byte_rate.max(1))
            .unwrap_or(0)
    }
}

fn pad_to_step(chunk: Bytes, step: usize) -> Bytes {
    if chunk.len() == step {
        chunk
    } else {
        let mut padded = vec![0u8; step];
        padded[..chunk.len()].copy_from_slice(&chunk);
        Bytes::from(padded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEP: usize = 8;

    fn stream_of(sources: Vec<(&str, Vec<u8>)>) -> SourceStream {
        let playlist: Vec<Box<dyn Source>> = sources
            .into_iter()
            .map(|(id, data)| Box::new(MemorySource::new(id, data)) as Box<dyn Source>)
            .collect();
        SourceStream::new(playlist, STEP, 1_000, 4)
    }

    fn pull(stream: &mut SourceStream) -> Frame {
        match stream.next_frame() {
            StreamFrame::Frame(f) => f,
            StreamFrame::End => panic!("unexpected end of stream"),
        }
    }

    #[test]
    fn yields_fixed_size_frames_in_playlist_order() {
        let mut stream = stream_of(vec![("a", vec![1u8; 12]), ("b", vec![2u8; 8])]);

        let first = pull(&mut stream);
        assert_eq!(first.source_id, "a");
        assert_eq!(first.bytes.len(), STEP);

        // Short tail of "a" is zero-padded to the step size
        let second = pull(&mut stream);
        assert_eq!(second.source_id, "a");
        assert_eq!(&second.bytes[..4], &[1, 1, 1, 1]);
        assert_eq!(&second.bytes[4..], &[0, 0, 0, 0]);

        let third = pull(&mut stream);
        assert_eq!(third.source_id, "b");

        assert_eq!(stream.next_frame(), StreamFrame::End);
    }

    #[test]
    fn rebuffer_restores_frames_in_order() {
        let mut stream = stream_of(vec![("a", vec![9u8; 24])]);

        let first = pull(&mut stream);
        let second = pull(&mut stream);

        stream.rebuffer(vec![first.clone(), second.clone()]);

        assert_eq!(pull(&mut stream), first);
        assert_eq!(pull(&mut stream), second);
    }

    #[test]
    fn flush_drops_rebuffered_output_only() {
        let mut stream = stream_of(vec![("a", vec![7u8; 16])]);

        let first = pull(&mut stream);
        stream.rebuffer(vec![first]);
        stream.flush();

        // Continues from the cursor, not from the flushed frame
        let next = pull(&mut stream);
        assert_eq!(next.source_id, "a");
        assert_eq!(stream.next_frame(), StreamFrame::End);
    }

    #[test]
    fn skip_to_unknown_source_is_a_typed_failure() {
        let mut stream = stream_of(vec![("a", vec![0u8; 8])]);

        let err = stream.skip_to("nope").unwrap_err();
        assert_eq!(err.code(), "unknown_source");
        assert_eq!(stream.current_source_id(), Some("a"));
    }

    #[test]
    fn skip_to_rewinds_the_target() {
        let mut stream = stream_of(vec![("a", vec![1u8; 8]), ("b", vec![2u8; 16])]);

        // Drain into "b"
        pull(&mut stream);
        pull(&mut stream);

        stream.skip_to("b").unwrap();
        let frame = pull(&mut stream);
        assert_eq!(frame.source_id, "b");

        // Full source again: two frames before End
        pull(&mut stream);
        assert_eq!(stream.next_frame(), StreamFrame::End);
    }

    #[test]
    fn reset_rewinds_current_source() {
        let mut stream = stream_of(vec![("a", vec![3u8; 16])]);

        pull(&mut stream);
        stream.reset();

        pull(&mut stream);
        pull(&mut stream);
        assert_eq!(stream.next_frame(), StreamFrame::End);
    }

    struct FailingSource {
        id: SourceId,
        failures: u32,
        reads: u32,
    }

    impl Source for FailingSource {
        fn id(&self) -> &str {
            &self.id
        }

        fn len_bytes(&self) -> Option<u64> {
            None
        }

        fn read_step(&mut self, _step: usize) -> io::Result<Option<Bytes>> {
            self.reads += 1;
            if self.reads <= self.failures {
                Err(io::Error::new(io::ErrorKind::InvalidData, "decode failed"))
            } else {
                Ok(Some(Bytes::from_static(&[5u8; STEP])))
            }
        }

        fn rewind(&mut self) {
            self.reads = 0;
        }
    }

    #[test]
    fn read_errors_become_silent_frames() {
        let playlist: Vec<Box<dyn Source>> = vec![Box::new(FailingSource {
            id: "flaky".into(),
            failures: 2,
            reads: 0,
        })];
        let mut stream = SourceStream::new(playlist, STEP, 1_000, 4);

        let silent = pull(&mut stream);
        assert!(silent.bytes.iter().all(|&b| b == 0));
        let silent = pull(&mut stream);
        assert!(silent.bytes.iter().all(|&b| b == 0));

        // Third read succeeds
        let real = pull(&mut stream);
        assert_eq!(real.bytes.as_ref(), &[5u8; STEP]);
    }

    #[test]
    fn persistent_errors_advance_to_next_source() {
        let playlist: Vec<Box<dyn Source>> = vec![
            Box::new(FailingSource {
                id: "broken".into(),
                failures: u32::MAX,
                reads: 0,
            }),
            Box::new(MemorySource::new("good", vec![6u8; STEP])),
        ];
        let mut stream = SourceStream::new(playlist, STEP, 1_000, 4);

        // Three silent frames, then the limit (4) trips and we advance
        for _ in 0..3 {
            let frame = pull(&mut stream);
            assert_eq!(frame.source_id, "broken");
            assert!(frame.bytes.iter().all(|&b| b == 0));
        }
        let frame = pull(&mut stream);
        assert_eq!(frame.source_id, "good");
    }

    #[test]
    fn duration_uses_the_byte_rate() {
        let stream = stream_of(vec![("a", vec![0u8; 2_000])]);
        // 2000 bytes at 1000 B/s = 2000ms
        assert_eq!(stream.source_duration_ms("a"), 2_000);
        assert_eq!(stream.source_duration_ms("missing"), 0);
    }
}
