//! Append-only recording file writer (C2).
//!
//! One JSON header line followed by one JSON event line per output/input/
//! resize, and a final exit-marker line — an asciicast-like shape, flushed
//! after every line so a concurrent reader (the replay side of `/stream`)
//! never observes a torn write.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::Instant;

use crate::error::Result;
use crate::protocol::{recording_event_line, recording_exit_line, RecordingEventKind, RecordingHeader};

pub struct RecordingWriter {
    file: File,
    start: Instant,
    session_id: String,
    /// A trailing, not-yet-complete UTF-8 sequence carried over from the
    /// previous `write_output` call. PTY reads land on 4096-byte boundaries
    /// with no regard for character boundaries, so a multi-byte character
    /// can straddle two reads; buffering the dangling tail here (instead of
    /// lossy-converting each chunk independently) keeps the persisted
    /// recording byte-identical to what `TerminalModel` renders from the
    /// same raw stream.
    pending_output_tail: Vec<u8>,
}

impl RecordingWriter {
    pub fn create(
        path: &Path,
        session_id: &str,
        width: u16,
        height: u16,
        command: &[String],
        title: Option<String>,
        env: HashMap<String, String>,
    ) -> Result<Self> {
        let mut file = File::options()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)?;

        let header = RecordingHeader {
            kind: "header".to_string(),
            version: 2,
            width,
            height,
            timestamp: jiff::Timestamp::now().as_second(),
            command: command.join(" "),
            title,
            env,
        };
        writeln!(file, "{}", serde_json::to_string(&header)?)?;
        file.flush()?;

        Ok(Self {
            file,
            start: Instant::now(),
            session_id: session_id.to_string(),
            pending_output_tail: Vec::new(),
        })
    }

    pub fn elapsed(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Appends one event line and returns it, so the caller can forward the
    /// exact bytes just persisted to live subscribers without re-deriving
    /// them (and risking the file and the fan-out disagreeing).
    fn write_event(&mut self, kind: RecordingEventKind, data: &str) -> Result<String> {
        let line = recording_event_line(self.elapsed(), kind, data);
        writeln!(self.file, "{line}")?;
        self.file.flush()?;
        Ok(line)
    }

    /// Persists one chunk of raw PTY output. A trailing incomplete UTF-8
    /// sequence is buffered rather than replaced with `U+FFFD`, so it can be
    /// completed by the next chunk instead of corrupting the recording at
    /// read-boundary splits (see the `pending_output_tail` doc comment).
    /// Returns `Ok(None)` when the whole chunk was buffered and nothing was
    /// written yet.
    pub fn write_output(&mut self, data: &[u8]) -> Result<Option<String>> {
        let mut combined = std::mem::take(&mut self.pending_output_tail);
        combined.extend_from_slice(data);

        match std::str::from_utf8(&combined) {
            Ok(text) => self.write_event(RecordingEventKind::Output, text).map(Some),
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                let tail_len = combined.len() - valid_up_to;
                // `error_len() == None` means the bytes after `valid_up_to`
                // are a truncated-but-plausible sequence start (at most 3
                // bytes wide); buffer them for the next call. Anything else
                // is genuinely malformed and would never resolve by
                // buffering, so fall back to a lossy conversion rather than
                // stalling the recording on it forever.
                if err.error_len().is_none() && tail_len <= 3 {
                    self.pending_output_tail = combined[valid_up_to..].to_vec();
                    if valid_up_to == 0 {
                        return Ok(None);
                    }
                    let text = std::str::from_utf8(&combined[..valid_up_to])
                        .expect("validated by valid_up_to");
                    self.write_event(RecordingEventKind::Output, text).map(Some)
                } else {
                    let text = String::from_utf8_lossy(&combined).into_owned();
                    self.write_event(RecordingEventKind::Output, &text).map(Some)
                }
            }
        }
    }

    /// Flushes a buffered incomplete trailing sequence (lossily) so a child
    /// that exits mid-multibyte-character doesn't silently lose its last
    /// bytes. Called once, right before the exit marker.
    pub fn flush_pending_output(&mut self) -> Result<Option<String>> {
        if self.pending_output_tail.is_empty() {
            return Ok(None);
        }
        let tail = std::mem::take(&mut self.pending_output_tail);
        let text = String::from_utf8_lossy(&tail).into_owned();
        self.write_event(RecordingEventKind::Output, &text).map(Some)
    }

    pub fn write_input(&mut self, data: &[u8]) -> Result<String> {
        self.write_event(RecordingEventKind::Input, &String::from_utf8_lossy(data))
    }

    pub fn write_resize(&mut self, cols: u16, rows: u16) -> Result<String> {
        self.write_event(RecordingEventKind::Resize, &format!("{cols}x{rows}"))
    }

    pub fn write_exit(&mut self, exit_code: i32) -> Result<String> {
        let line = recording_exit_line(exit_code, &self.session_id);
        writeln!(self.file, "{line}")?;
        self.file.flush()?;
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn writes_header_then_events_then_exit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stream.out");
        let mut writer = RecordingWriter::create(
            &path,
            "sess-1",
            80,
            24,
            &["bash".to_string()],
            None,
            HashMap::new(),
        )
        .unwrap();

        let output_line = writer.write_output(b"hello\r\n").unwrap().unwrap();
        writer.write_input(b"x").unwrap();
        writer.write_resize(100, 40).unwrap();
        let exit_line = writer.write_exit(0).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[1], output_line);
        assert_eq!(lines[4], exit_line);

        let header: RecordingHeader = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(header.width, 80);
        assert_eq!(header.height, 24);

        let output_event: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(output_event[1], "o");
        assert_eq!(output_event[2], "hello\r\n");

        let exit_event: serde_json::Value = serde_json::from_str(lines[4]).unwrap();
        assert_eq!(exit_event[0], "exit");
        assert_eq!(exit_event[1], 0);
        assert_eq!(exit_event[2], "sess-1");
    }

    #[test]
    fn reassembles_utf8_character_split_across_two_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stream.out");
        let mut writer =
            RecordingWriter::create(&path, "sess-2", 80, 24, &["bash".to_string()], None, HashMap::new())
                .unwrap();

        // "\u{4F60}" ("you") is E4 BD A0 in UTF-8; split after the first byte.
        let full = "\u{4F60}".as_bytes().to_vec();
        let (first, second) = full.split_at(1);

        let first_result = writer.write_output(first).unwrap();
        assert!(first_result.is_none(), "a lone leading byte must be buffered, not emitted lossily");

        let second_result = writer.write_output(second).unwrap().unwrap();
        let event: serde_json::Value = serde_json::from_str(&second_result).unwrap();
        assert_eq!(event[2], "\u{4F60}");
    }

    #[test]
    fn flush_pending_output_emits_buffered_tail_lossily() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stream.out");
        let mut writer =
            RecordingWriter::create(&path, "sess-3", 80, 24, &["bash".to_string()], None, HashMap::new())
                .unwrap();

        let full = "\u{4F60}".as_bytes().to_vec();
        writer.write_output(&full[..1]).unwrap();
        assert!(writer.pending_output_tail.len() == 1);

        let flushed = writer.flush_pending_output().unwrap().unwrap();
        let event: serde_json::Value = serde_json::from_str(&flushed).unwrap();
        assert_eq!(event[1], "o");
        assert!(writer.flush_pending_output().unwrap().is_none());
    }
}
