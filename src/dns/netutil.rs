//! Internal network utilities

use std::io::{Read, Result, Write};

/// Read the 2-byte big-endian length prefix that frames DNS messages on
/// TCP (RFC 1035 4.2.2).
pub fn read_packet_length<R: Read>(stream: &mut R) -> Result<u16> {
    let mut len_buffer = [0; 2];
    stream.read_exact(&mut len_buffer)?;
    Ok(u16::from_be_bytes(len_buffer))
}

/// Write the 2-byte length prefix before a TCP DNS message.
pub fn write_packet_length<W: Write>(stream: &mut W, len: usize) -> Result<()> {
    stream.write_all(&(len as u16).to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_length_roundtrip() {
        let mut out = Vec::new();
        write_packet_length(&mut out, 0x1234).unwrap();
        assert_eq!(out, vec![0x12, 0x34]);

        let mut cursor = Cursor::new(out);
        assert_eq!(read_packet_length(&mut cursor).unwrap(), 0x1234);
    }
}
