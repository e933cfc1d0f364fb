// ABOUTME: Frame codec - reads/writes one protocol frame in either the text or binary wire variant
// ABOUTME: the two directions of a connection run independent framing modes

use crate::error::RpcError;
use crate::escape::{escape, unescape};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::{self, BufRead, Read, Write};

/// Threshold above which the outbound param buffer is flushed mid-frame.
/// Pure throughput tuning; has no effect on the bytes produced on the wire.
const FLUSH_THRESHOLD: usize = 10 * 1024;

/// Which of the two independent wire framings is in effect for one
/// direction of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingMode {
    Text,
    Binary,
}

/// One parsed unit of the wire protocol. A full call or return is usually
/// preceded by zero or more `Param` events belonging to the same frame
/// group; the dispatcher accumulates those into a `Params` bag.
///
/// `id == 0` is the wire sentinel for "no id" (an anonymous call or the
/// anonymous/bare-LF return); real calls never allocate id 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    Param { key: Bytes, value: Bytes },
    Call { func: Bytes, id: u32, recv_id: Option<u32> },
    Return { id: u32 },
}

pub fn some_id(id: u32) -> Option<u32> {
    (id != 0).then_some(id)
}

pub fn id_or_sentinel(id: Option<u32>) -> u32 {
    id.unwrap_or(0)
}

const BINARY_TYPE_PARAM: u8 = 1;
const BINARY_TYPE_CALL: u8 = 2;
const BINARY_TYPE_CALLBACK: u8 = 3;
const BINARY_TYPE_RETURN: u8 = 4;

/// Reads one [`WireEvent`] at a time from a blocking, line- or
/// byte-oriented transport, in the framing mode currently selected.
pub struct FrameReader<R> {
    reader: R,
    mode: FramingMode,
    line_buf: Vec<u8>,
    /// The ack-body literal can surface two events (a param, then a return)
    /// while the binary reader is mid type-tag dispatch; the second is
    /// stashed here until the next `read_event` call.
    pending: Option<WireEvent>,
}

impl<R: BufRead> FrameReader<R> {
    pub fn new(reader: R, mode: FramingMode) -> Self {
        FrameReader {
            reader,
            mode,
            line_buf: Vec::new(),
            pending: None,
        }
    }

    pub fn mode(&self) -> FramingMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: FramingMode) {
        self.mode = mode;
    }

    /// Reads and parses exactly one logical frame. Returns `Ok(None)` on a
    /// clean EOF (no bytes read, nothing buffered); an EOF in the middle of
    /// a frame is an error.
    #[tracing::instrument(skip(self), fields(mode = ?self.mode))]
    pub fn read_event(&mut self) -> Result<Option<WireEvent>, RpcError> {
        if let Some(ev) = self.pending.take() {
            return Ok(Some(ev));
        }
        match self.mode {
            FramingMode::Text => self.read_text_event(),
            FramingMode::Binary => self.read_binary_event(),
        }
    }

    fn read_text_event(&mut self) -> Result<Option<WireEvent>, RpcError> {
        self.line_buf.clear();
        let n = self.reader.read_until(b'\n', &mut self.line_buf)?;
        if n == 0 {
            return Ok(None);
        }
        let mut line: &[u8] = &self.line_buf;
        if line.last() == Some(&b'\n') {
            line = &line[..line.len() - 1];
        }
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        parse_text_line(line).map(Some)
    }

    fn read_binary_event(&mut self) -> Result<Option<WireEvent>, RpcError> {
        let mut tag = [0u8; 1];
        if !read_full_or_eof(&mut self.reader, &mut tag)? {
            return Ok(None);
        }
        match tag[0] {
            BINARY_TYPE_PARAM => {
                let keysize = self.read_u32()?;
                let valsize = self.read_u32()?;
                let key = self.read_n(keysize as usize)?;
                let value = self.read_n(valsize as usize)?;
                Ok(Some(WireEvent::Param { key, value }))
            }
            BINARY_TYPE_CALL => {
                let id = self.read_u32()?;
                let funcsize = self.read_u32()?;
                let func = self.read_n(funcsize as usize)?;
                Ok(Some(WireEvent::Call { func, id, recv_id: None }))
            }
            BINARY_TYPE_CALLBACK => {
                let id = self.read_u32()?;
                let recv_id = self.read_u32()?;
                let funcsize = self.read_u32()?;
                let func = self.read_n(funcsize as usize)?;
                Ok(Some(WireEvent::Call { func, id, recv_id: Some(recv_id) }))
            }
            BINARY_TYPE_RETURN => {
                let id = self.read_u32()?;
                Ok(Some(WireEvent::Return { id }))
            }
            b'O' => self.read_ack_body_on_binary_path(),
            other => Err(RpcError::InvalidResponse(format!(
                "unrecognized binary frame tag {other:#x}"
            ))),
        }
    }

    /// The `prefer_binary` ack body is always written as the literal text
    /// bytes `O\tK\n\a1\n`, even when the side producing it has itself
    /// already turned its own read direction to binary. We've already
    /// consumed the leading `O`; parse the rest of the fixed literal by hand
    /// and stash the second event.
    fn read_ack_body_on_binary_path(&mut self) -> Result<Option<WireEvent>, RpcError> {
        let mut rest = [0u8; 6]; // "\tK\n\x071\n"
        self.reader.read_exact(&mut rest)?;
        if &rest != b"\tK\n\x071\n" {
            return Err(RpcError::InvalidResponse(
                "malformed handshake ack literal on binary path".into(),
            ));
        }
        self.pending = Some(WireEvent::Return { id: 1 });
        Ok(Some(WireEvent::Param {
            key: Bytes::from_static(b"O"),
            value: Bytes::from_static(b"K"),
        }))
    }

    fn read_u32(&mut self) -> io::Result<u32> {
        let mut buf = [0u8; 4];
        self.reader.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_n(&mut self, n: usize) -> io::Result<Bytes> {
        let mut buf = vec![0u8; n];
        self.reader.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }
}

/// Like `read_exact`, but treats a zero-byte read before any data arrives as
/// a clean EOF (`Ok(false)`) rather than an error.
fn read_full_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return if filled == 0 {
                    Ok(false)
                } else {
                    Err(io::Error::new(io::ErrorKind::UnexpectedEof, "eof mid frame"))
                };
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

fn parse_text_line(line: &[u8]) -> Result<WireEvent, RpcError> {
    if line.is_empty() {
        return Ok(WireEvent::Return { id: 0 });
    }
    if let Some(bell_pos) = line.iter().position(|&b| b == 0x07) {
        let rest = &line[bell_pos + 1..];
        if let Some(second_bell) = rest.iter().position(|&b| b == 0x07) {
            // func \a id \a recv_id
            let func = unescape(&line[..bell_pos]);
            let id_field = &rest[..second_bell];
            let recv_field = &rest[second_bell + 1..];
            let id = parse_decimal_id(id_field)?;
            let recv_id = parse_decimal_id(recv_field)?;
            return Ok(WireEvent::Call { func: Bytes::from(func), id, recv_id: Some(recv_id) });
        }
        if bell_pos == 0 {
            // bare \a id -> return frame
            let id = parse_decimal_id(rest)?;
            return Ok(WireEvent::Return { id });
        }
        let func = unescape(&line[..bell_pos]);
        let id = parse_decimal_id(rest)?;
        return Ok(WireEvent::Call { func: Bytes::from(func), id, recv_id: None });
    }
    if let Some(tab_pos) = line.iter().position(|&b| b == b'\t') {
        let key = unescape(&line[..tab_pos]);
        let value = unescape(&line[tab_pos + 1..]);
        return Ok(WireEvent::Param { key: Bytes::from(key), value: Bytes::from(value) });
    }
    Err(RpcError::InvalidResponse(format!(
        "line matches no frame shape: {:?}",
        String::from_utf8_lossy(line)
    )))
}

fn parse_decimal_id(field: &[u8]) -> Result<u32, RpcError> {
    std::str::from_utf8(field)
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(|| RpcError::InvalidResponse(format!("bad decimal id: {:?}", String::from_utf8_lossy(field))))
}

/// Writes [`WireEvent`]s to a blocking transport in the framing mode
/// currently selected, batching param bytes into an internal buffer that is
/// flushed either when it grows past [`FLUSH_THRESHOLD`] or when the
/// closing call/return frame of a group is written.
pub struct FrameWriter<W> {
    writer: W,
    mode: FramingMode,
    outbuf: BytesMut,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W, mode: FramingMode) -> Self {
        FrameWriter { writer, mode, outbuf: BytesMut::new() }
    }

    pub fn mode(&self) -> FramingMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: FramingMode) {
        self.mode = mode;
    }

    pub fn write_param(&mut self, key: &[u8], value: &[u8]) -> io::Result<()> {
        match self.mode {
            FramingMode::Text => {
                self.outbuf.extend_from_slice(&escape(key));
                self.outbuf.put_u8(b'\t');
                self.outbuf.extend_from_slice(&escape(value));
                self.outbuf.put_u8(b'\n');
            }
            FramingMode::Binary => {
                self.outbuf.put_u8(BINARY_TYPE_PARAM);
                self.outbuf.put_u32(key.len() as u32);
                self.outbuf.put_u32(value.len() as u32);
                self.outbuf.extend_from_slice(key);
                self.outbuf.extend_from_slice(value);
            }
        }
        if self.outbuf.len() > FLUSH_THRESHOLD {
            self.flush_buffer()?;
        }
        Ok(())
    }

    pub fn write_call(&mut self, func: &[u8], id: u32, recv_id: Option<u32>) -> io::Result<()> {
        match self.mode {
            FramingMode::Text => {
                self.outbuf.extend_from_slice(&escape(func));
                self.outbuf.put_u8(0x07);
                self.outbuf.extend_from_slice(id.to_string().as_bytes());
                if let Some(recv_id) = recv_id {
                    self.outbuf.put_u8(0x07);
                    self.outbuf.extend_from_slice(recv_id.to_string().as_bytes());
                }
                self.outbuf.put_u8(b'\n');
            }
            FramingMode::Binary => {
                self.outbuf.put_u8(if recv_id.is_some() { BINARY_TYPE_CALLBACK } else { BINARY_TYPE_CALL });
                self.outbuf.put_u32(id);
                if let Some(recv_id) = recv_id {
                    self.outbuf.put_u32(recv_id);
                }
                self.outbuf.put_u32(func.len() as u32);
                self.outbuf.extend_from_slice(func);
            }
        }
        self.flush_buffer()
    }

    pub fn write_return(&mut self, id: u32) -> io::Result<()> {
        match self.mode {
            FramingMode::Text => {
                if id == 0 {
                    self.outbuf.put_u8(b'\n');
                } else {
                    self.outbuf.put_u8(0x07);
                    self.outbuf.extend_from_slice(id.to_string().as_bytes());
                    self.outbuf.put_u8(b'\n');
                }
            }
            FramingMode::Binary => {
                self.outbuf.put_u8(BINARY_TYPE_RETURN);
                self.outbuf.put_u32(id);
            }
        }
        self.flush_buffer()
    }

    /// Writes raw bytes bypassing the normal encoder. Used only for the
    /// fixed handshake literals, which are always exactly those bytes
    /// regardless of the nominal framing mode (see `negotiate.rs`).
    pub fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.outbuf.extend_from_slice(bytes);
        self.flush_buffer()
    }

    fn flush_buffer(&mut self) -> io::Result<()> {
        if !self.outbuf.is_empty() {
            self.writer.write_all(&self.outbuf)?;
            self.outbuf.clear();
        }
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(mode: FramingMode, events: &[WireEvent]) -> Vec<WireEvent> {
        let mut buf = Vec::new();
        {
            let mut w = FrameWriter::new(&mut buf, mode);
            for ev in events {
                match ev {
                    WireEvent::Param { key, value } => w.write_param(key, value).unwrap(),
                    WireEvent::Call { func, id, recv_id } => w.write_call(func, *id, *recv_id).unwrap(),
                    WireEvent::Return { id } => w.write_return(*id).unwrap(),
                }
            }
        }
        let mut r = FrameReader::new(Cursor::new(buf), mode);
        let mut out = Vec::new();
        while let Some(ev) = r.read_event().unwrap() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn text_round_trip() {
        let events = vec![
            WireEvent::Param { key: Bytes::from_static(b"k"), value: Bytes::from_static(b"v\n\t") },
            WireEvent::Call { func: Bytes::from_static(b"echo"), id: 42, recv_id: None },
            WireEvent::Return { id: 42 },
            WireEvent::Return { id: 0 },
        ];
        assert_eq!(roundtrip(FramingMode::Text, &events), events);
    }

    #[test]
    fn binary_round_trip() {
        let events = vec![
            WireEvent::Param { key: Bytes::from_static(b"bindata"), value: Bytes::from(vec![0u8, 1, 255, 254]) },
            WireEvent::Call { func: Bytes::from_static(b"callback"), id: 7, recv_id: Some(3) },
            WireEvent::Return { id: 0 },
        ];
        assert_eq!(roundtrip(FramingMode::Binary, &events), events);
    }

    #[test]
    fn text_callback_frame_has_two_bells() {
        let mut buf = Vec::new();
        FrameWriter::new(&mut buf, FramingMode::Text)
            .write_call(b"foo", 5, Some(9))
            .unwrap();
        assert_eq!(buf, b"foo\x075\x079\n");
    }

    #[test]
    fn empty_line_is_anonymous_return() {
        let mut r = FrameReader::new(Cursor::new(b"\n".to_vec()), FramingMode::Text);
        assert_eq!(r.read_event().unwrap(), Some(WireEvent::Return { id: 0 }));
    }

    #[test]
    fn crlf_is_tolerated_on_read() {
        let mut r = FrameReader::new(Cursor::new(b"\x071\r\n".to_vec()), FramingMode::Text);
        assert_eq!(r.read_event().unwrap(), Some(WireEvent::Return { id: 1 }));
    }

    #[test]
    fn clean_eof_yields_none() {
        let mut r = FrameReader::new(Cursor::new(Vec::<u8>::new()), FramingMode::Text);
        assert_eq!(r.read_event().unwrap(), None);
    }

    #[test]
    fn ack_body_recognized_on_binary_path() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"O\tK\n\x071\n");
        let mut r = FrameReader::new(Cursor::new(bytes), FramingMode::Binary);
        assert_eq!(
            r.read_event().unwrap(),
            Some(WireEvent::Param { key: Bytes::from_static(b"O"), value: Bytes::from_static(b"K") })
        );
        assert_eq!(r.read_event().unwrap(), Some(WireEvent::Return { id: 1 }));
    }

    #[test]
    fn garbage_line_is_invalid_response() {
        let mut r = FrameReader::new(Cursor::new(b"no delimiters here\n".to_vec()), FramingMode::Text);
        assert!(matches!(r.read_event(), Err(RpcError::InvalidResponse(_))));
    }
}
