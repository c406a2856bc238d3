// ABOUTME: Line reassembly for interleaved per-session output chunks.
// ABOUTME: Buffers partial lines per session and tags complete lines with the host.

use crate::types::SessionId;

/// Which remote stream a piece of output arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputChannel {
    Stdout,
    Stderr,
}

/// Unit of streamed data from one session.
///
/// Ordering across sessions is arrival order only; ordering within one
/// session and channel follows the underlying protocol's delivery order.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputFrame {
    pub session_id: SessionId,
    pub channel: OutputChannel,
    pub bytes: Vec<u8>,
}

/// One complete line of output, tagged with its originating host.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedLine {
    pub host: String,
    pub channel: OutputChannel,
    pub line: String,
}

/// Reassembles arbitrarily-chunked bytes into complete lines.
///
/// Nothing is emitted for a line until its terminating newline arrives;
/// `flush` hands back the final partial line when the stream ends.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line completed by it.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(newline) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Emit the pending partial line, if any. Called when the session closes.
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Per-session output streamer owned by that session's task.
///
/// Keeps one buffer per channel so stdout and stderr chunks cannot corrupt
/// each other's partial lines.
#[derive(Debug)]
pub struct OutputStreamer {
    host: String,
    stdout: LineBuffer,
    stderr: LineBuffer,
}

impl OutputStreamer {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            stdout: LineBuffer::new(),
            stderr: LineBuffer::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Feed one frame from this streamer's session.
    pub fn feed_frame(&mut self, frame: &OutputFrame) -> Vec<TaggedLine> {
        self.feed(frame.channel, &frame.bytes)
    }

    /// Feed one chunk, yielding the lines it completed in order.
    pub fn feed(&mut self, channel: OutputChannel, bytes: &[u8]) -> Vec<TaggedLine> {
        let buffer = match channel {
            OutputChannel::Stdout => &mut self.stdout,
            OutputChannel::Stderr => &mut self.stderr,
        };
        buffer
            .feed(bytes)
            .into_iter()
            .map(|line| TaggedLine {
                host: self.host.clone(),
                channel,
                line,
            })
            .collect()
    }

    /// Flush both channels' partial lines when the session closes.
    pub fn flush(&mut self) -> Vec<TaggedLine> {
        let mut lines = Vec::new();
        if let Some(line) = self.stdout.flush() {
            lines.push(TaggedLine {
                host: self.host.clone(),
                channel: OutputChannel::Stdout,
                line,
            });
        }
        if let Some(line) = self.stderr.flush() {
            lines.push(TaggedLine {
                host: self.host.clone(),
                channel: OutputChannel::Stderr,
                line,
            });
        }
        lines
    }
}
