//! XTC file reader.
//!
//! Reads datagrams back to back from one or more files: the fixed header
//! first, then the payload sized by the root node.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;

use log::info;

use crate::xtc::{RawXtcHeader, DATAGRAM_HEADER_SIZE, XTC_HEADER_SIZE};

use super::{InputError, InputSource, InputState};

/// Sequential reader over a list of XTC files.
pub struct XtcFileInput {
    files: Vec<PathBuf>,
    current: usize,
    reader: Option<BufReader<File>>,
    current_name: Option<String>,
}

impl XtcFileInput {
    /// Creates the reader over `files`, visited in order.
    #[must_use]
    pub fn new(files: Vec<PathBuf>) -> XtcFileInput {
        XtcFileInput {
            files,
            current: 0,
            reader: None,
            current_name: None,
        }
    }

    fn advance(&mut self) -> Result<bool, InputError> {
        while self.current < self.files.len() {
            let path = &self.files[self.current];
            self.current += 1;
            let file = File::open(path)?;
            info!("reading datagrams from '{}'", path.display());
            self.current_name = Some(path.display().to_string());
            self.reader = Some(BufReader::new(file));
            return Ok(true);
        }
        self.reader = None;
        Ok(false)
    }
}

impl InputSource for XtcFileInput {
    fn next(&mut self, buffer: &mut [u8]) -> Result<InputState, InputError> {
        loop {
            let reader = match &mut self.reader {
                Some(reader) => reader,
                None => {
                    if self.advance()? {
                        continue;
                    }
                    return Ok(InputState::EndOfStream);
                }
            };

            let header_size = DATAGRAM_HEADER_SIZE + XTC_HEADER_SIZE;
            match read_exact_or_eof(reader, &mut buffer[..header_size])? {
                false => {
                    // file exhausted, move to the next one
                    self.reader = None;
                    continue;
                }
                true => {}
            }

            let root = RawXtcHeader::parse(&buffer[DATAGRAM_HEADER_SIZE..]);
            let payload_size = root.payload_size as usize;
            let total = header_size + payload_size;
            if total > buffer.len() {
                return Err(InputError::DatagramTooLarge {
                    size: total,
                    capacity: buffer.len(),
                });
            }
            reader.read_exact(&mut buffer[header_size..total])?;
            return Ok(InputState::Datagram(total));
        }
    }

    fn filename(&self) -> Option<&str> {
        self.current_name.as_deref()
    }
}

/// Reads the full buffer, or reports a clean end-of-file at a datagram
/// boundary as `false`.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool, InputError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(InputError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "file ends inside a datagram header",
            )));
        }
        filled += n;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::generator::build_datagram;
    use crate::xtc::{Datagram, TransitionId};
    use std::io::Write;

    #[test]
    fn reads_datagrams_across_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for (i, seconds) in [(0u32, 100u32), (1, 200)] {
            let path = dir.path().join(format!("chunk{i}.xtc"));
            let mut file = File::create(&path).unwrap();
            let dgram = build_datagram(TransitionId::L1Accept, seconds, 1, &[]);
            file.write_all(&dgram).unwrap();
            paths.push(path);
        }

        let mut input = XtcFileInput::new(paths);
        let mut buffer = vec![0u8; 4096];

        let mut seen = Vec::new();
        while let InputState::Datagram(len) = input.next(&mut buffer).unwrap() {
            let datagram = Datagram::parse(&buffer[..len]).unwrap();
            seen.push(datagram.seconds);
        }
        assert_eq!(seen, vec![100, 200]);
    }

    #[test]
    fn truncated_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.xtc");
        std::fs::write(&path, [0u8; 10]).unwrap();

        let mut input = XtcFileInput::new(vec![path]);
        let mut buffer = vec![0u8; 4096];
        assert!(input.next(&mut buffer).is_err());
    }
}
