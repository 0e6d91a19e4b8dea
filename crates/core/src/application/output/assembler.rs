use std::borrow::Cow;

/// Reassembles lines from arbitrarily split output chunks.
///
/// Both `\n` and `\r` end a line, so carriage-return progress redraws
/// become separate lines. Bytes are decoded lossily per line, which keeps
/// multi-byte characters intact across chunk boundaries.
#[derive(Debug, Default)]
pub struct LineAssembler {
    partial: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                if !self.partial.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.partial).into_owned());
                    self.partial.clear();
                }
            } else {
                self.partial.push(byte);
            }
        }
        lines
    }

    /// Text received after the last line terminator
    pub fn partial(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.partial)
    }

    pub fn has_partial(&self) -> bool {
        !self.partial.is_empty()
    }

    pub fn take_partial(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.partial).into_owned();
        self.partial.clear();
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_across_chunks() {
        let mut asm = LineAssembler::new();
        assert!(asm.push(b"hel").is_empty());
        assert_eq!(asm.push(b"lo\nwor"), vec!["hello".to_string()]);
        assert_eq!(asm.partial(), "wor");
        assert_eq!(asm.push(b"ld\r\n"), vec!["world".to_string()]);
        assert!(!asm.has_partial());
    }

    #[test]
    fn test_carriage_return_redraws_split() {
        let mut asm = LineAssembler::new();
        let lines = asm.push(b"Vid 10.0%\rVid 20.0%\rVid 30.0%\n");
        assert_eq!(lines, vec!["Vid 10.0%", "Vid 20.0%", "Vid 30.0%"]);
    }

    #[test]
    fn test_multibyte_split_between_chunks() {
        let mut asm = LineAssembler::new();
        let bar = "\u{2501}\u{2501}".as_bytes();
        asm.push(&bar[..2]);
        let lines = asm.push(&[&bar[2..], &b"\n"[..]].concat());
        assert_eq!(lines, vec!["\u{2501}\u{2501}".to_string()]);
    }

    #[test]
    fn test_take_partial() {
        let mut asm = LineAssembler::new();
        asm.push(b"Press Enter to run");
        assert_eq!(asm.take_partial().as_deref(), Some("Press Enter to run"));
        assert_eq!(asm.take_partial(), None);
    }
}
