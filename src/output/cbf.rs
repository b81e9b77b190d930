//! CBF image files with byte-offset compression.
//!
//! The header declares a signed 32 bit little-endian element type; the data
//! section encodes pixel-to-pixel differences in one, three or seven bytes
//! depending on their magnitude.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Marker separating the text header from the binary section.
const MARK_BYTE: [u8; 4] = [0x0c, 0x1a, 0x04, 0xd5];

/// Zero padding appended after the trailer.
const PAD_SIZE: usize = 4096;

fn encoded_size(data: &[f64]) -> usize {
    let mut nbytes = 0;
    let mut pixvalue = 0i64;
    for &value in data {
        let diff = value as i64 - pixvalue;
        pixvalue = value as i64;
        let absdiff = diff.abs();
        nbytes += 1;
        if absdiff < 128 {
            continue;
        }
        nbytes += 2;
        if absdiff < 32768 {
            continue;
        }
        nbytes += 4;
    }
    nbytes
}

/// Writes `data` (`nx` columns by `ny` rows) as a byte-offset compressed
/// CBF file.
pub fn write<P: AsRef<Path>>(
    filename: P,
    data: &[f64],
    nx: usize,
    ny: usize,
) -> std::io::Result<()> {
    debug_assert_eq!(data.len(), nx * ny);
    let mut file = BufWriter::new(File::create(filename.as_ref())?);
    let nbytes = encoded_size(data);

    let name = filename.as_ref().display();
    write!(file, "###CBF: Version July 2012\r\n")?;
    write!(file, "\r\n")?;
    write!(file, "data_{name}\r\n")?;
    write!(file, "\r\n")?;
    write!(file, "_array_data.header_convention \"XDS special\"\r\n")?;
    write!(file, "_array_data.header_contents\r\n")?;
    write!(file, ";\r\n")?;
    write!(file, ";\r\n")?;
    write!(file, "\r\n")?;
    write!(file, "_array_data.data\r\n")?;
    write!(file, ";\r\n")?;
    write!(file, "--CIF-BINARY-FORMAT-SECTION--\r\n")?;
    write!(file, "Content-Type: application/octet-stream;\r\n")?;
    write!(file, "     conversions=\"x-CBF_BYTE_OFFSET\"\r\n")?;
    write!(file, "Content-Transfer-Encoding: BINARY\r\n")?;
    write!(file, "X-Binary-Size:{nbytes}\r\n")?;
    write!(file, "X-Binary-ID: 1\r\n")?;
    write!(file, "X-Binary-Element-Type: \"signed 32-bit integer\"\r\n")?;
    write!(file, "X-Binary-Element-Byte-Order: LITTLE_ENDIAN\r\n")?;
    write!(file, "X-Binary-Number-of-Elements:{}\r\n", nx * ny)?;
    write!(file, "X-Binary-Size-Fastest-Dimension:{nx}\r\n")?;
    write!(file, "X-Binary-Size-Second-Dimension:{ny}\r\n")?;
    write!(file, "\r\n")?;
    file.write_all(&MARK_BYTE)?;

    let mut pixvalue = 0i64;
    for &value in data {
        let diff = value as i64 - pixvalue;
        pixvalue = value as i64;
        let absdiff = diff.abs();

        if absdiff < 128 {
            file.write_all(&[(diff as i8) as u8])?;
            continue;
        }
        file.write_all(&[0x80])?;
        if absdiff < 32768 {
            file.write_all(&(diff as i16).to_le_bytes())?;
            continue;
        }
        file.write_all(&i16::MIN.to_le_bytes())?;
        file.write_all(&(diff as i32).to_le_bytes())?;
    }

    write!(file, "--CIF-BINARY-FORMAT-SECTION----")?;
    write!(file, ";")?;
    file.write_all(&[0u8; PAD_SIZE])?;
    file.flush()
}

/// Decodes the binary section of a byte-offset stream (used in tests).
#[must_use]
pub fn decode_byte_offsets(bytes: &[u8], count: usize) -> Vec<i64> {
    let mut values = Vec::with_capacity(count);
    let mut pixvalue = 0i64;
    let mut pos = 0;
    while values.len() < count && pos < bytes.len() {
        let first = bytes[pos] as i8;
        pos += 1;
        let diff = if first != i8::MIN {
            i64::from(first)
        } else {
            let second = i16::from_le_bytes([bytes[pos], bytes[pos + 1]]);
            pos += 2;
            if second != i16::MIN {
                i64::from(second)
            } else {
                let third =
                    i32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]]);
                pos += 4;
                i64::from(third)
            }
        };
        pixvalue += diff;
        values.push(pixvalue);
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_through_the_byte_offsets() {
        let data = [0.0, 5.0, -120.0, 4000.0, 4000.0, -70000.0, 3.0];
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.cbf");
        write(&path, &data, data.len(), 1).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("X-Binary-Element-Type: \"signed 32-bit integer\""));
        assert!(text.contains("x-CBF_BYTE_OFFSET"));

        let start = bytes
            .windows(MARK_BYTE.len())
            .position(|w| w == MARK_BYTE)
            .unwrap()
            + MARK_BYTE.len();
        let decoded = decode_byte_offsets(&bytes[start..], data.len());
        let expected: Vec<i64> = data.iter().map(|&v| v as i64).collect();
        assert_eq!(decoded, expected);
    }
}
