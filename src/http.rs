//! Hand-rolled blocking HTTP/1.1 surface (part of C10, spec §6/§10.5).
//!
//! Grounded directly on the donor's `http_server.rs`: a raw `TcpListener`,
//! one thread per accepted connection, and parsing against the `http` crate's
//! `Request`/`Response` types rather than pulling in a framework. The only
//! addition over the donor is a cheap peek of the first bytes of each
//! connection so a `GET /buffers` WebSocket upgrade can be routed to
//! `tungstenite::accept_hdr` before the donor-style parser ever touches the
//! stream (the donor's own parser has no notion of upgrades).

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

use bytes::BytesMut;
pub use http::{Method, Request, Response, StatusCode};

pub struct HttpServer {
    listener: TcpListener,
    request_size_limit: Option<usize>,
}

impl HttpServer {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self {
            listener,
            request_size_limit: Some(1 << 20),
        })
    }

    #[must_use]
    pub fn incoming(&self) -> Incoming<'_> {
        Incoming {
            listener: &self.listener,
        }
    }

    #[must_use]
    pub const fn request_size_limit(&self) -> Option<usize> {
        self.request_size_limit
    }
}

pub struct Incoming<'a> {
    listener: &'a TcpListener,
}

impl Iterator for Incoming<'_> {
    type Item = io::Result<(TcpStream, SocketAddr)>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.listener.accept())
    }
}

/// `true` if the connection's first bytes look like a WebSocket upgrade
/// request to `path`. Peeking leaves the stream's read position untouched,
/// so on a `false` result the caller can still hand the stream to
/// `HttpRequest::from_stream` without having lost any bytes.
#[must_use]
pub fn peek_is_upgrade_to(stream: &TcpStream, path: &str) -> bool {
    let mut buf = [0u8; 256];
    let Ok(n) = stream.peek(&mut buf) else {
        return false;
    };
    let head = String::from_utf8_lossy(&buf[..n]);
    let Some(request_line) = head.lines().next() else {
        return false;
    };
    let mut parts = request_line.split_whitespace();
    parts.next() == Some("GET") && parts.next() == Some(path)
}

pub struct HttpRequest {
    stream: TcpStream,
    remote_addr: SocketAddr,
    request: Request<Vec<u8>>,
}

impl HttpRequest {
    pub fn from_stream(
        mut stream: TcpStream,
        remote_addr: SocketAddr,
        request_size_limit: Option<usize>,
    ) -> io::Result<Self> {
        stream.set_read_timeout(Some(Duration::from_secs(30)))?;
        let mut buffer = BytesMut::new();
        let mut tmp = [0; 4096];

        loop {
            let n = stream.read(&mut tmp)?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed"));
            }
            buffer.extend_from_slice(&tmp[..n]);

            if let Some(limit) = request_size_limit {
                if buffer.len() > limit {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "request too large"));
                }
            }

            let Some(header_end) = find_header_end(&buffer) else {
                continue;
            };
            let header_bytes = buffer[..header_end].to_vec();
            let body_start = header_end + 4;

            let request = parse_headers(&header_bytes)?;
            let content_length = request
                .headers()
                .get("content-length")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<usize>().ok())
                .unwrap_or(0);

            let mut body = Vec::with_capacity(content_length);
            if body_start < buffer.len() {
                let available = content_length.min(buffer.len() - body_start);
                body.extend_from_slice(&buffer[body_start..body_start + available]);
            }
            while body.len() < content_length {
                let remaining = content_length - body.len();
                let to_read = remaining.min(tmp.len());
                let n = stream.read(&mut tmp[..to_read])?;
                if n == 0 {
                    break;
                }
                body.extend_from_slice(&tmp[..n]);
            }

            let (parts, _) = request.into_parts();
            return Ok(Self {
                stream,
                remote_addr,
                request: Request::from_parts(parts, body),
            });
        }
    }

    #[must_use]
    pub const fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        self.request.method()
    }

    #[must_use]
    pub fn path(&self) -> String {
        self.request.uri().path().to_string()
    }

    #[must_use]
    pub fn query(&self) -> Option<&str> {
        self.request.uri().query()
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.request.headers().get(name).and_then(|v| v.to_str().ok())
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        self.request.body()
    }

    pub fn respond<T: AsRef<[u8]>>(&mut self, response: Response<T>) -> io::Result<()> {
        write_response_head(&mut self.stream, &response)?;
        self.stream.write_all(response.body().as_ref())?;
        self.stream.flush()
    }

    /// Starts a server-sent-events response: writes headers, then hands back
    /// the raw stream so the caller can push `data:`/`:heartbeat` frames as
    /// they become available (spec §4.5).
    pub fn start_sse(&mut self) -> io::Result<()> {
        self.stream.write_all(
            b"HTTP/1.1 200 OK\r\n\
              Content-Type: text/event-stream\r\n\
              Cache-Control: no-cache\r\n\
              Connection: keep-alive\r\n\
              Access-Control-Allow-Origin: *\r\n\r\n",
        )?;
        self.stream.flush()
    }

    pub fn write_sse_data(&mut self, data: &str) -> io::Result<()> {
        for line in data.split('\n') {
            write!(self.stream, "data: {line}\n")?;
        }
        self.stream.write_all(b"\n")?;
        self.stream.flush()
    }

    pub fn write_sse_comment(&mut self, comment: &str) -> io::Result<()> {
        writeln!(self.stream, ": {comment}\n")?;
        self.stream.flush()
    }

    /// Reclaims the underlying stream, e.g. to hand off to `tungstenite`.
    #[must_use]
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

fn write_response_head<T>(stream: &mut TcpStream, response: &Response<T>) -> io::Result<()> {
    write!(
        stream,
        "HTTP/1.1 {} {}\r\n",
        response.status().as_u16(),
        response.status().canonical_reason().unwrap_or("")
    )?;
    for (name, value) in response.headers() {
        write!(stream, "{name}: ")?;
        stream.write_all(value.as_bytes())?;
        stream.write_all(b"\r\n")?;
    }
    stream.write_all(b"\r\n")
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_headers(header_bytes: &[u8]) -> io::Result<Request<()>> {
    let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_string());

    let request_line_end = header_bytes
        .windows(2)
        .position(|w| w == b"\r\n")
        .ok_or_else(|| invalid("missing request line"))?;
    let request_line = std::str::from_utf8(&header_bytes[..request_line_end])
        .map_err(|_| invalid("non-utf8 request line"))?;
    let mut parts = request_line.split_whitespace();
    let method: Method = parts
        .next()
        .ok_or_else(|| invalid("missing method"))?
        .parse()
        .map_err(|_| invalid("bad method"))?;
    let uri: http::Uri = parts
        .next()
        .ok_or_else(|| invalid("missing uri"))?
        .parse()
        .map_err(|_| invalid("bad uri"))?;

    let mut builder = Request::builder().method(method).uri(uri);
    let headers_start = request_line_end + 2;
    for line in header_bytes[headers_start..].split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        if let Some(colon) = line.iter().position(|&b| b == b':') {
            let name = std::str::from_utf8(&line[..colon]).unwrap_or_default().trim();
            let value = std::str::from_utf8(&line[colon + 1..]).unwrap_or_default().trim();
            builder = builder.header(name, value);
        }
    }
    builder.body(()).map_err(|e| invalid(&e.to_string()))
}

/// Builds a JSON response, matching the donor's `json_response` helper
/// (`Content-Type: application/json`, CORS wide open since the core has no
/// notion of same-origin policy — that's a browser-UI concern).
#[must_use]
pub fn json_response<T: serde::Serialize>(status: StatusCode, body: &T) -> Response<Vec<u8>> {
    let json = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(json)
        .unwrap()
}

#[must_use]
pub fn empty_response(status: StatusCode) -> Response<Vec<u8>> {
    Response::builder()
        .status(status)
        .header("Access-Control-Allow-Origin", "*")
        .body(Vec::new())
        .unwrap()
}

#[must_use]
pub fn binary_response(status: StatusCode, body: Vec<u8>) -> Response<Vec<u8>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/octet-stream")
        .header("Access-Control-Allow-Origin", "*")
        .body(body)
        .unwrap()
}

#[must_use]
pub fn text_response(status: StatusCode, body: String) -> Response<Vec<u8>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .header("Access-Control-Allow-Origin", "*")
        .body(body.into_bytes())
        .unwrap()
}
