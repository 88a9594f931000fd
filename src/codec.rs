//! Low level reading and writing of milter packets.

use std::io::{BufRead, Read, Result, Write};

/// 65535 byte body chunks plus room for the command and some slack,
/// cf. postfix milter8.c MILTER_CHUNK_SIZE.
pub const MAX_PACKET_LEN: u32 = 65536 + 4096;

/// Largest body chunk sent in one SMFIR_REPLBODY packet.
pub const MAX_BODY_CHUNK: usize = 65535;

pub trait ReadExt {
    fn read_u8(&mut self) -> Result<u8>;
    fn read_u16_be(&mut self) -> Result<u16>;
    fn read_u32_be(&mut self) -> Result<u32>;
    fn read_bytes(&mut self, len: usize, data: &mut Vec<u8>) -> Result<()>;
}

impl<T: Read> ReadExt for T {
    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u16_be(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    fn read_u32_be(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_bytes(&mut self, len: usize, data: &mut Vec<u8>) -> Result<()> {
        data.resize(len, 0u8);
        self.read_exact(data)?;
        Ok(())
    }
}

pub trait BufReadExt {
    fn read_zbytes<'a>(&mut self, buffer: &'a mut Vec<u8>) -> Result<&'a [u8]>;
    fn read_zstring(&mut self, buffer: &mut Vec<u8>) -> Result<String>;
    fn read_zstring_anglestripped(&mut self, buffer: &mut Vec<u8>) -> Result<String>;
    /// Reads NUL terminated strings until the input is exhausted.
    fn read_zstrings(&mut self, buffer: &mut Vec<u8>) -> Result<Vec<String>>;
}

impl<T: BufRead> BufReadExt for T {
    fn read_zbytes<'a>(&mut self, buffer: &'a mut Vec<u8>) -> Result<&'a [u8]> {
        buffer.clear();
        self.read_until(b'\0', buffer)?;
        if buffer.last() == Some(&0) {
            buffer.pop();
        }
        Ok(&buffer[..])
    }
    fn read_zstring(&mut self, buffer: &mut Vec<u8>) -> Result<String> {
        Ok(String::from_utf8_lossy(self.read_zbytes(buffer)?).to_string())
    }
    fn read_zstring_anglestripped(&mut self, buffer: &mut Vec<u8>) -> Result<String> {
        let s = anglestrip(self.read_zbytes(buffer)?);
        Ok(String::from_utf8_lossy(s).to_string())
    }
    fn read_zstrings(&mut self, buffer: &mut Vec<u8>) -> Result<Vec<String>> {
        let mut strings = Vec::new();
        while !self.fill_buf()?.is_empty() {
            strings.push(self.read_zstring(buffer)?);
        }
        Ok(strings)
    }
}

fn anglestrip(s: &[u8]) -> &[u8] {
    if s.len() > 1 && s[0] == b'<' && s[s.len() - 1] == b'>' {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

/// Builds one packet: command byte plus payload, framed with its length.
#[derive(Debug, Default)]
pub struct Packet {
    data: Vec<u8>,
}

impl Packet {
    pub fn new(command: u8) -> Self {
        let mut data = Vec::with_capacity(64);
        data.push(command);
        Packet { data }
    }

    pub fn u32(mut self, value: u32) -> Self {
        self.data.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn zstring(mut self, value: &str) -> Self {
        self.data.extend_from_slice(value.as_bytes());
        self.data.push(0);
        self
    }

    pub fn bytes(mut self, value: &[u8]) -> Self {
        self.data.extend_from_slice(value);
        self
    }

    pub fn write_to(&self, writer: &mut impl Write) -> Result<()> {
        writer.write_all(&(self.data.len() as u32).to_be_bytes())?;
        writer.write_all(&self.data)
    }
}

#[test]
fn test_read_u8() {
    let input = [b'a', b'b'];
    let mut reader = &input[..];
    assert_eq!(reader.read_u8().unwrap(), b'a');
    assert_eq!(reader.read_u8().unwrap(), b'b');
    reader.read_u8().unwrap_err();
}

#[test]
fn test_read_u16_u32() {
    let input = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77];
    let mut reader = &input[..];
    assert_eq!(reader.read_u16_be().unwrap(), 0x1122);
    assert_eq!(reader.read_u32_be().unwrap(), 0x33445566);
    reader.read_u32_be().unwrap_err();
}

#[test]
fn test_read_bytes() {
    let input = [0x11, 0x22, 0x33, 0x44];
    let mut reader = &input[..];
    let mut out: Vec<u8> = Vec::new();
    reader.read_bytes(3, &mut out).unwrap();
    assert_eq!(out, [0x11, 0x22, 0x33]);
    reader.read_bytes(2, &mut out).unwrap_err();
}

#[test]
fn test_read_zbytes_keeps_inner_content() {
    use std::io::Cursor;
    let input = b"Test1\0\0Test3";
    let mut reader = Cursor::new(&input);
    let mut buffer: Vec<u8> = Vec::new();
    assert_eq!(reader.read_zbytes(&mut buffer).unwrap(), b"Test1");
    assert_eq!(reader.read_zbytes(&mut buffer).unwrap(), b"");
    assert_eq!(reader.read_zbytes(&mut buffer).unwrap(), b"Test3");
    assert_eq!(reader.read_zbytes(&mut buffer).unwrap(), b"");
}

#[test]
fn test_read_zstrings() {
    use std::io::Cursor;
    let mut reader = Cursor::new(b"<a@x>\0SIZE=100\0BODY=8BITMIME\0");
    let mut buffer: Vec<u8> = Vec::new();
    assert_eq!(
        reader.read_zstring_anglestripped(&mut buffer).unwrap(),
        "a@x"
    );
    assert_eq!(
        reader.read_zstrings(&mut buffer).unwrap(),
        ["SIZE=100", "BODY=8BITMIME"]
    );
}

#[test]
fn test_packet_framing() {
    let mut out = Vec::new();
    Packet::new(b'h')
        .zstring("X-Test")
        .zstring("1")
        .write_to(&mut out)
        .unwrap();
    assert_eq!(out, b"\0\0\0\x0ahX-Test\x001\0");
    out.clear();
    Packet::new(b'm').u32(2).zstring("Subject").zstring("").write_to(&mut out).unwrap();
    assert_eq!(out, b"\0\0\0\x0em\0\0\0\x02Subject\0\0");
}
