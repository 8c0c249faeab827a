//! Line splitting for byte streams read in arbitrary pieces.
//!
//! Subprocess output arrives in reads that do not respect line boundaries, and
//! ffmpeg terminates its status lines with `\r`. [`LineBuffer`] keeps the
//! incomplete tail of one read and joins it with the next.

/// Accumulates bytes and yields complete lines.
///
/// Both `\n` and `\r` end a line; empty lines (such as the gap in `\r\n`)
/// are dropped.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every line completed by it.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in data {
            if byte == b'\n' || byte == b'\r' {
                if !self.pending.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                    self.pending.clear();
                }
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    /// Flush the unterminated tail, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_complete_lines() {
        let mut buf = LineBuffer::new();
        assert_eq!(
            buf.push(b"fps=12.5\nout_time=00:00:01\n"),
            vec!["fps=12.5", "out_time=00:00:01"]
        );
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn test_partial_line_across_reads() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"fps=1").is_empty());
        assert_eq!(buf.push(b"2.5\nout_"), vec!["fps=12.5"]);
        assert_eq!(buf.push(b"time=00:01:00\n"), vec!["out_time=00:01:00"]);
    }

    #[test]
    fn test_carriage_returns_split_lines() {
        let mut buf = LineBuffer::new();
        let lines = buf.push(b"frame=  10 fps=2.0\rframe=  20 fps=2.1\r\nDone\r\n");
        assert_eq!(lines, vec!["frame=  10 fps=2.0", "frame=  20 fps=2.1", "Done"]);
    }

    #[test]
    fn test_finish_flushes_tail() {
        let mut buf = LineBuffer::new();
        buf.push(b"first\nsecond");
        assert_eq!(buf.finish(), Some("second".to_string()));
        assert_eq!(buf.finish(), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // However the stream is cut, the same lines come out.
        #[test]
        fn prop_split_points_do_not_matter(
            lines in proptest::collection::vec("[a-z_]{1,10}=[0-9.:]{1,10}", 1..20),
            cut in 1usize..16,
        ) {
            let stream = lines.join("\n") + "\n";
            let mut buf = LineBuffer::new();
            let mut seen = Vec::new();
            for piece in stream.as_bytes().chunks(cut) {
                seen.extend(buf.push(piece));
            }
            prop_assert_eq!(seen, lines);
            prop_assert!(buf.finish().is_none());
        }
    }
}
