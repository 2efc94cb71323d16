//! Byte-oriented read/write queue with framed-message extraction (§4.1).

use std::collections::VecDeque;

use crate::cell::{self, VarCell};
use crate::error::FetchError;
use crate::socks::{self, ProxyState, SocksReplyOutcome};

/// A growable byte queue. `Connection::inbuf`/`outbuf` are both backed by
/// one of these.
#[derive(Debug, Default)]
pub struct Buffer {
    data: VecDeque<u8>,
}

impl Buffer {
    pub fn new() -> Self {
        Self {
            data: VecDeque::new(),
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend(bytes.iter().copied());
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copy out the first `n` bytes without consuming them. Panics if `n >
    /// len()` — callers must check `len()` first, same contract as the
    /// `fetch_*` methods' internal use.
    pub fn peek(&self, n: usize) -> Vec<u8> {
        self.data.iter().take(n).copied().collect()
    }

    /// Remove and return the first `n` bytes.
    pub fn drain(&mut self, n: usize) -> Vec<u8> {
        self.data.drain(..n).collect()
    }

    /// Contiguous slice of everything currently buffered, for a socket
    /// write. Rearranges the internal ring so the whole buffer is
    /// contiguous; cheap when already contiguous (the common case after a
    /// single `append`).
    pub fn as_contiguous(&mut self) -> &[u8] {
        self.data.make_contiguous()
    }

    /// Return a completed `\n`-terminated line (without the terminator),
    /// or `Incomplete`, or `TooLong` if more than `max` bytes have been
    /// buffered with no newline yet.
    pub fn fetch_line(&mut self, max: usize) -> Result<Vec<u8>, FetchError> {
        let newline_pos = self.data.iter().position(|&b| b == b'\n');
        match newline_pos {
            Some(pos) => {
                let mut line: Vec<u8> = self.data.drain(..=pos).collect();
                line.pop(); // drop '\n'
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                Ok(line)
            }
            None => {
                if self.data.len() > max {
                    Err(FetchError::TooLong)
                } else {
                    Err(FetchError::Incomplete)
                }
            }
        }
    }

    /// Return `(headers, body)` once a complete HTTP response is buffered:
    /// a status line, headers up to the blank-line terminator (capped at
    /// `max_header` bytes), and — if `Content-Length` was present — that
    /// many body bytes (capped at `max_body`). Without `Content-Length`
    /// the body is empty (the proxy-CONNECT response this is used for
    /// never has one).
    pub fn fetch_http(
        &mut self,
        max_header: usize,
        max_body: usize,
    ) -> Result<(Vec<String>, Vec<u8>), FetchError> {
        let bytes: Vec<u8> = self.data.iter().copied().collect();
        let header_end = find_subslice(&bytes, b"\r\n\r\n");
        let Some(header_end) = header_end else {
            if bytes.len() > max_header {
                return Err(FetchError::TooLong);
            }
            return Err(FetchError::Incomplete);
        };
        if header_end > max_header {
            return Err(FetchError::TooLong);
        }
        let header_block = String::from_utf8_lossy(&bytes[..header_end]).into_owned();
        let lines: Vec<String> = header_block.split("\r\n").map(|s| s.to_string()).collect();

        let content_length = lines
            .iter()
            .skip(1)
            .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_string()))
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);

        if content_length > max_body {
            return Err(FetchError::TooLong);
        }

        let body_start = header_end + 4;
        let total = body_start + content_length;
        if bytes.len() < total {
            return Err(FetchError::Incomplete);
        }

        let body = bytes[body_start..total].to_vec();
        self.data.drain(..total);
        Ok((lines, body))
    }

    /// Dequeue the next complete variable cell, or `Incomplete`/`TooLong`.
    /// `link_proto` selects the circ-id width (§4.1/§6); `0` means
    /// "not yet negotiated" (2-byte circ-id, the only width `VERSIONS` is
    /// ever framed with).
    pub fn fetch_var_cell(&mut self, link_proto: u16) -> Result<VarCell, FetchError> {
        let id_len = if link_proto >= 4 { 4 } else { 2 };
        let header_len = id_len + 3;
        if self.data.len() < header_len {
            return Err(FetchError::Incomplete);
        }
        let header = self.peek(header_len);
        let command = header[id_len];
        if !cell::is_variable_length(command) {
            return Err(FetchError::Protocol(format!(
                "command {command} is not a variable-length command"
            )));
        }
        let payload_len =
            u16::from_be_bytes([header[id_len + 1], header[id_len + 2]]) as usize;
        let total = header_len + payload_len;
        if self.data.len() < total {
            return Err(FetchError::Incomplete);
        }
        let whole = self.drain(total);
        VarCell::unpack(&whole, link_proto).map_err(|e| FetchError::Protocol(e.to_string()))
    }

    /// Dequeue the next complete fixed cell at `link_proto`, or
    /// `Incomplete`.
    pub fn fetch_fixed_cell(&mut self, link_proto: u16) -> Result<cell::Cell, FetchError> {
        let total = cell::fixed_cell_len(link_proto);
        if self.data.len() < total {
            return Err(FetchError::Incomplete);
        }
        let whole = self.drain(total);
        cell::Cell::unpack(&whole, link_proto).map_err(|e| FetchError::Protocol(e.to_string()))
    }

    /// Parse the next chunk of a SOCKS4/SOCKS5 server reply appropriate to
    /// `state`. Consumes exactly the bytes belonging to that reply on
    /// success; consumes nothing on `Incomplete`.
    pub fn fetch_socks_client_reply(
        &mut self,
        state: ProxyState,
    ) -> Result<SocksReplyOutcome, FetchError> {
        match state {
            ProxyState::Socks4WantConnectOk => {
                if self.data.len() < 8 {
                    return Err(FetchError::Incomplete);
                }
                let bytes = self.drain(8);
                Ok(socks::parse_socks4_reply(&bytes).expect("length checked above"))
            }
            ProxyState::Socks5WantAuthMethodNone | ProxyState::Socks5WantAuthMethodUserPass => {
                if self.data.len() < 2 {
                    return Err(FetchError::Incomplete);
                }
                let bytes = self.drain(2);
                let offered_userpass = state == ProxyState::Socks5WantAuthMethodUserPass;
                Ok(socks::parse_socks5_method_reply(&bytes, offered_userpass)
                    .expect("length checked above"))
            }
            ProxyState::Socks5WantAuthUserPassOk => {
                if self.data.len() < 2 {
                    return Err(FetchError::Incomplete);
                }
                let bytes = self.drain(2);
                Ok(socks::parse_socks5_userpass_reply(&bytes).expect("length checked above"))
            }
            ProxyState::Socks5WantConnectOk => {
                let peeked = self.peek(self.data.len().min(256));
                match socks::parse_socks5_connect_reply(&peeked) {
                    Some((outcome, consumed)) => {
                        self.drain(consumed);
                        Ok(outcome)
                    }
                    None => Err(FetchError::Incomplete),
                }
            }
            other => Err(FetchError::Protocol(format!(
                "fetch_socks_client_reply called in state {other:?}"
            ))),
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CMD_CERTS;

    #[test]
    fn fetch_line_incomplete_without_newline() {
        let mut buf = Buffer::new();
        buf.append(b"partial");
        assert_eq!(buf.fetch_line(100), Err(FetchError::Incomplete));
        assert_eq!(buf.len(), 7); // nothing consumed
    }

    #[test]
    fn fetch_line_strips_crlf() {
        let mut buf = Buffer::new();
        buf.append(b"hello\r\nworld");
        let line = buf.fetch_line(100).unwrap();
        assert_eq!(line, b"hello");
        assert_eq!(buf.len(), 5); // "world" remains
    }

    #[test]
    fn fetch_line_too_long() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'a'; 50]);
        assert_eq!(buf.fetch_line(10), Err(FetchError::TooLong));
    }

    #[test]
    fn fetch_http_without_content_length_has_empty_body() {
        let mut buf = Buffer::new();
        buf.append(b"HTTP/1.1 200 Connection Established\r\nVia: 1.1 proxy\r\n\r\n");
        let (headers, body) = buf.fetch_http(4096, 4096).unwrap();
        assert_eq!(headers[0], "HTTP/1.1 200 Connection Established");
        assert!(body.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn fetch_http_incomplete_before_terminator() {
        let mut buf = Buffer::new();
        buf.append(b"HTTP/1.1 200 OK\r\n");
        assert_eq!(buf.fetch_http(4096, 4096), Err(FetchError::Incomplete));
    }

    #[test]
    fn fetch_http_waits_for_body_per_content_length() {
        let mut buf = Buffer::new();
        buf.append(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhel");
        assert_eq!(buf.fetch_http(4096, 4096), Err(FetchError::Incomplete));
        buf.append(b"lo");
        let (_, body) = buf.fetch_http(4096, 4096).unwrap();
        assert_eq!(body, b"hello");
    }

    #[test]
    fn fetch_var_cell_waits_for_full_payload() {
        let mut buf = Buffer::new();
        let cell = VarCell::new(1, CMD_CERTS, vec![1, 2, 3, 4]);
        let mut packed = cell.pack(3).unwrap();
        let tail = packed.split_off(packed.len() - 1);
        buf.append(&packed);
        assert_eq!(buf.fetch_var_cell(3), Err(FetchError::Incomplete));
        buf.append(&tail);
        let decoded = buf.fetch_var_cell(3).unwrap();
        assert_eq!(decoded, cell);
    }

    #[test]
    fn fetch_var_cell_rejects_non_variable_command() {
        let mut buf = Buffer::new();
        buf.append(&[0, 1, cell::CMD_DESTROY, 0, 0]);
        assert!(matches!(
            buf.fetch_var_cell(3),
            Err(FetchError::Protocol(_))
        ));
    }

    #[test]
    fn fetch_socks_client_reply_dispatches_by_state() {
        let mut buf = Buffer::new();
        buf.append(&[0x00, 0x5A, 0, 0, 0, 0, 0, 0]);
        let outcome = buf
            .fetch_socks_client_reply(ProxyState::Socks4WantConnectOk)
            .unwrap();
        assert_eq!(outcome, SocksReplyOutcome::Connected);
    }
}
