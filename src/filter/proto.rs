// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Length-tagged framing spoken with filter child processes.
//!
//! Each record is
//!
//! ```text
//! <tag>\n
//! <length, ASCII decimal>\n
//! <exactly `length` bytes>\n
//! ```
//!
//! with `tag` one of `int`, `str`, `str-array`, `blob` or `end`. A `str`
//! body includes its NUL terminator in the length; a `str-array` body is a
//! sequence of NUL-separated strings terminated by a trailing empty string.
//!
//! The same framing doubles as the control-record format of the storage-stub
//! transport.

use crate::{Error, Result};
use std::io::{BufRead, Read, Write};

/// Upper bound on a single record body; anything larger is a framing
/// violation rather than an allocation request.
const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

/// Record tag.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Tag {
    /// ASCII decimal integer body
    Int,

    /// NUL-terminated string body
    Str,

    /// NUL-separated string list body
    StrArray,

    /// Opaque byte body
    Blob,

    /// End of conversation; body is empty
    End,
}

impl Tag {
    /// Wire name of the tag.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Str => "str",
            Self::StrArray => "str-array",
            Self::Blob => "blob",
            Self::End => "end",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "int" => Ok(Self::Int),
            "str" => Ok(Self::Str),
            "str-array" => Ok(Self::StrArray),
            "blob" => Ok(Self::Blob),
            "end" => Ok(Self::End),
            _ => Err(Error::FilterProtocol("unknown record tag")),
        }
    }
}

/// Writes one record.
///
/// # Errors
///
/// Returns an I/O error if the writer fails.
pub fn write_record<W: Write>(writer: &mut W, tag: Tag, body: &[u8]) -> Result<()> {
    writer.write_all(tag.as_str().as_bytes())?;
    writer.write_all(b"\n")?;
    writer.write_all(body.len().to_string().as_bytes())?;
    writer.write_all(b"\n")?;
    writer.write_all(body)?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// Sends an integer record.
///
/// # Errors
///
/// Returns an I/O error if the writer fails.
pub fn send_int<W: Write>(writer: &mut W, value: i64) -> Result<()> {
    write_record(writer, Tag::Int, value.to_string().as_bytes())
}

/// Sends a string record (NUL terminator included in the length).
///
/// # Errors
///
/// Returns an I/O error if the writer fails.
pub fn send_string<W: Write>(writer: &mut W, s: &str) -> Result<()> {
    let mut body = Vec::with_capacity(s.len() + 1);
    body.extend_from_slice(s.as_bytes());
    body.push(0);
    write_record(writer, Tag::Str, &body)
}

/// Sends a string-array record.
///
/// # Errors
///
/// Returns an I/O error if the writer fails.
pub fn send_string_array<W: Write, S: AsRef<str>>(writer: &mut W, strings: &[S]) -> Result<()> {
    let mut body = vec![];
    for s in strings {
        body.extend_from_slice(s.as_ref().as_bytes());
        body.push(0);
    }
    body.push(0); // trailing empty string
    write_record(writer, Tag::StrArray, &body)
}

/// Sends a blob record.
///
/// # Errors
///
/// Returns an I/O error if the writer fails.
pub fn send_blob<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    write_record(writer, Tag::Blob, bytes)
}

/// Sends the end-of-conversation record.
///
/// # Errors
///
/// Returns an I/O error if the writer fails.
pub fn send_end<W: Write>(writer: &mut W) -> Result<()> {
    write_record(writer, Tag::End, b"")
}

fn read_line<R: BufRead>(reader: &mut R) -> Result<String> {
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .map_err(|_| Error::FilterProtocol("unreadable record line"))?;

    if n == 0 {
        return Err(Error::TransportClosed);
    }
    if !line.ends_with('\n') {
        return Err(Error::FilterProtocol("record line not newline-terminated"));
    }

    line.pop();
    Ok(line)
}

/// Reads one record.
///
/// # Errors
///
/// - [`Error::TransportClosed`] on a clean EOF before the tag line
/// - [`Error::FilterProtocol`] on any framing violation
pub fn read_record<R: BufRead>(reader: &mut R) -> Result<(Tag, Vec<u8>)> {
    let tag = Tag::parse(&read_line(reader)?)?;

    let len = read_line(reader)?
        .parse::<usize>()
        .map_err(|_| Error::FilterProtocol("bad record length"))?;

    if len > MAX_RECORD_LEN {
        return Err(Error::FilterProtocol("record too large"));
    }

    let mut body = vec![0; len];
    reader
        .read_exact(&mut body)
        .map_err(|_| Error::FilterProtocol("truncated record body"))?;

    let mut newline = [0u8; 1];
    reader
        .read_exact(&mut newline)
        .map_err(|_| Error::FilterProtocol("missing record terminator"))?;

    if newline != *b"\n" {
        return Err(Error::FilterProtocol("missing record terminator"));
    }

    Ok((tag, body))
}

/// Reads a record that must be an integer.
///
/// # Errors
///
/// Returns [`Error::FilterProtocol`] on a tag mismatch or unparsable body.
pub fn get_int<R: BufRead>(reader: &mut R) -> Result<i64> {
    let (tag, body) = read_record(reader)?;

    if tag != Tag::Int {
        return Err(Error::FilterProtocol("expected int record"));
    }

    std::str::from_utf8(&body)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or(Error::FilterProtocol("bad int body"))
}

/// Parses a `str` body (strips the NUL terminator).
///
/// # Errors
///
/// Returns [`Error::FilterProtocol`] if the terminator is missing or the
/// bytes are not UTF-8.
pub fn parse_string(body: &[u8]) -> Result<String> {
    let Some((&0, init)) = body.split_last() else {
        return Err(Error::FilterProtocol("string not NUL-terminated"));
    };

    String::from_utf8(init.to_vec()).map_err(|_| Error::FilterProtocol("string not utf-8"))
}

/// Reads a record that must be a string.
///
/// # Errors
///
/// Returns [`Error::FilterProtocol`] on a tag mismatch or malformed body.
pub fn get_string<R: BufRead>(reader: &mut R) -> Result<String> {
    let (tag, body) = read_record(reader)?;

    if tag != Tag::Str {
        return Err(Error::FilterProtocol("expected str record"));
    }

    parse_string(&body)
}

/// Parses a `str-array` body.
///
/// # Errors
///
/// Returns [`Error::FilterProtocol`] on a malformed body.
pub fn parse_string_array(body: &[u8]) -> Result<Vec<String>> {
    let Some((&0, init)) = body.split_last() else {
        return Err(Error::FilterProtocol("string array not terminated"));
    };

    if init.is_empty() {
        return Ok(vec![]);
    }

    let Some((&0, init)) = init.split_last() else {
        return Err(Error::FilterProtocol("string array not terminated"));
    };

    init.split(|&b| b == 0)
        .map(|part| {
            String::from_utf8(part.to_vec()).map_err(|_| Error::FilterProtocol("string not utf-8"))
        })
        .collect()
}

/// Reads a record that must be a string array.
///
/// # Errors
///
/// Returns [`Error::FilterProtocol`] on a tag mismatch or malformed body.
pub fn get_strings<R: BufRead>(reader: &mut R) -> Result<Vec<String>> {
    let (tag, body) = read_record(reader)?;

    if tag != Tag::StrArray {
        return Err(Error::FilterProtocol("expected str-array record"));
    }

    parse_string_array(&body)
}

/// Reads a record that must be a blob.
///
/// # Errors
///
/// Returns [`Error::FilterProtocol`] on a tag mismatch.
pub fn get_blob<R: BufRead>(reader: &mut R) -> Result<Vec<u8>> {
    let (tag, body) = read_record(reader)?;

    if tag != Tag::Blob {
        return Err(Error::FilterProtocol("expected blob record"));
    }

    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::{
        get_blob, get_int, get_string, get_strings, read_record, send_blob, send_end, send_int,
        send_string, send_string_array, Tag,
    };
    use std::io::Cursor;
    use test_log::test;

    #[test]
    fn proto_int_roundtrip() {
        let mut buf = vec![];
        send_int(&mut buf, -42).expect("should send");

        assert_eq!(b"int\n3\n-42\n".as_slice(), buf.as_slice());
        assert_eq!(-42, get_int(&mut Cursor::new(buf)).expect("should read"));
    }

    #[test]
    fn proto_string_roundtrip() {
        let mut buf = vec![];
        send_string(&mut buf, "hello").expect("should send");

        // NUL counts towards the length
        assert_eq!(b"str\n6\nhello\x00\n".as_slice(), buf.as_slice());
        assert_eq!(
            "hello",
            get_string(&mut Cursor::new(buf)).expect("should read")
        );
    }

    #[test]
    fn proto_string_array_roundtrip() {
        let mut buf = vec![];
        send_string_array(&mut buf, &["a", "bc"]).expect("should send");

        assert_eq!(
            vec!["a".to_owned(), "bc".to_owned()],
            get_strings(&mut Cursor::new(buf)).expect("should read")
        );

        let mut buf = vec![];
        send_string_array::<_, &str>(&mut buf, &[]).expect("should send");
        assert!(get_strings(&mut Cursor::new(buf))
            .expect("should read")
            .is_empty());
    }

    #[test]
    fn proto_blob_and_end() {
        let mut buf = vec![];
        send_blob(&mut buf, b"\x00\x01\x02").expect("should send");
        send_end(&mut buf).expect("should send");

        let mut cursor = Cursor::new(buf);
        assert_eq!(
            b"\x00\x01\x02".to_vec(),
            get_blob(&mut cursor).expect("should read")
        );

        let (tag, body) = read_record(&mut cursor).expect("should read");
        assert_eq!(Tag::End, tag);
        assert!(body.is_empty());
    }

    #[test]
    fn proto_rejects_unknown_tag() {
        let mut cursor = Cursor::new(b"nope\n0\n\n".to_vec());
        assert!(read_record(&mut cursor).is_err());
    }

    #[test]
    fn proto_rejects_bad_length() {
        let mut cursor = Cursor::new(b"blob\nxyz\n\n".to_vec());
        assert!(read_record(&mut cursor).is_err());

        let mut cursor = Cursor::new(b"blob\n10\nshort\n".to_vec());
        assert!(read_record(&mut cursor).is_err());
    }

    #[test]
    fn proto_eof_is_transport_closed() {
        let mut cursor = Cursor::new(vec![]);
        assert!(matches!(
            read_record(&mut cursor),
            Err(crate::Error::TransportClosed)
        ));
    }
}
