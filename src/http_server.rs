use std::ops::Deref;
use std::ops::DerefMut;

use bytes::BytesMut;
pub use http::*;
use io::Read;
use io::Write;
use std::io;
use std::net::SocketAddr;
use std::net::TcpListener;
use std::net::TcpStream;
use std::net::ToSocketAddrs;

#[derive(Debug)]
pub struct HttpServer {
    listener: TcpListener,
    request_size_limit: Option<usize>,
}

impl HttpServer {
    pub fn bind<A: ToSocketAddrs>(
        addr: A,
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self {
            listener,
            request_size_limit: Some(4096),
        })
    }

    pub fn set_request_size_limit(&mut self, limit: Option<usize>) {
        self.request_size_limit = limit;
    }

    pub fn incoming(&self) -> Incoming {
        Incoming {
            listener: &self.listener,
            request_size_limit: self.request_size_limit,
        }
    }
}

#[derive(Debug)]
pub struct Incoming<'a> {
    listener: &'a TcpListener,
    request_size_limit: Option<usize>,
}

impl<'a> Iterator for Incoming<'a> {
    type Item = std::result::Result<HttpRequest, Box<dyn std::error::Error + Send + Sync>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.listener.accept() {
            Ok((stream, remote_addr)) => Some(HttpRequest::from_stream(
                stream,
                remote_addr,
                self.request_size_limit,
            )),
            Err(e) => Some(Err(Box::new(e))),
        }
    }
}

#[derive(Debug)]
pub struct HttpRequest {
    stream: TcpStream,
    remote_addr: SocketAddr,
    request: Request<Vec<u8>>,
}

impl HttpRequest {
    fn from_stream(
        mut stream: TcpStream,
        remote_addr: SocketAddr,
        request_size_limit: Option<usize>,
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let mut buffer = BytesMut::new();
        let mut tmp = [0; 1024];

        loop {
            match stream.read(&mut tmp) {
                Ok(0) => {
                    return Err("Connection closed by client".into());
                }
                Ok(n) => {
                    buffer.extend_from_slice(&tmp[..n]);

                    if let Some(limit) = request_size_limit {
                        if buffer.len() > limit {
                            return Err("Request too large".into());
                        }
                    }

                    if let Some(header_end) = find_header_end(&buffer) {
                        let header_bytes = &buffer[..header_end];
                        let body_start = header_end + 4; // Skip \r\n\r\n

                        let request_line_end = header_bytes
                            .windows(2)
                            .position(|w| w == b"\r\n")
                            .ok_or("Invalid request line")?;

                        let request_line = std::str::from_utf8(&header_bytes[..request_line_end])?;
                        let mut parts = request_line.split_whitespace();
                        let method = parts.next().ok_or("Missing method")?;
                        let uri = parts.next().ok_or("Missing URI")?;
                        let version = parts.next().unwrap_or("HTTP/1.1");

                        let method = method.parse::<Method>()?;
                        let uri = uri.parse::<Uri>()?;
                        let version = match version {
                            "HTTP/1.0" => Version::HTTP_10,
                            "HTTP/1.1" => Version::HTTP_11,
                            _ => return Err("Unsupported HTTP version".into()),
                        };

                        let mut request_builder =
                            Request::builder().method(method).uri(uri).version(version);

                        let headers_start = request_line_end + 2;
                        let headers_bytes = &header_bytes[headers_start..];

                        for header_line in headers_bytes.split(|&b| b == b'\n') {
                            if header_line.is_empty() || header_line == b"\r" {
                                continue;
                            }

                            let header_line = if header_line.ends_with(b"\r") {
                                &header_line[..header_line.len() - 1]
                            } else {
                                header_line
                            };

                            if let Some(colon_pos) = header_line.iter().position(|&b| b == b':') {
                                let name = std::str::from_utf8(&header_line[..colon_pos])?.trim();
                                let value =
                                    std::str::from_utf8(&header_line[colon_pos + 1..])?.trim();
                                request_builder = request_builder.header(name, value);
                            }
                        }

                        let content_length = request_builder
                            .headers_ref()
                            .and_then(|h| h.get("content-length"))
                            .and_then(|v| v.to_str().ok())
                            .and_then(|s| s.parse::<usize>().ok());

                        let mut body = Vec::new();
                        if let Some(content_length) = content_length {
                            if let Some(limit) = request_size_limit {
                                if content_length > limit {
                                    return Err("Request too large".into());
                                }
                            }

                            if content_length > 0 {
                                let mut bytes_read = 0;
                                if body_start < buffer.len() {
                                    let available =
                                        std::cmp::min(content_length, buffer.len() - body_start);
                                    body.extend_from_slice(
                                        &buffer[body_start..body_start + available],
                                    );
                                    bytes_read = available;
                                }

                                while bytes_read < content_length {
                                    let remaining = content_length - bytes_read;
                                    let to_read = std::cmp::min(remaining, tmp.len());
                                    match stream.read(&mut tmp[..to_read]) {
                                        Ok(0) => break,
                                        Ok(n) => {
                                            body.extend_from_slice(&tmp[..n]);
                                            bytes_read += n;
                                        }
                                        Err(e) => return Err(Box::new(e)),
                                    }
                                }
                            }
                        }

                        let request = request_builder.body(body)?;

                        return Ok(HttpRequest {
                            stream,
                            remote_addr,
                            request,
                        });
                    }
                }
                Err(e) => return Err(Box::new(e)),
            }
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn respond<T: AsRef<[u8]>>(
        &mut self,
        response: T,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.stream.write_all(response.as_ref())?;
        self.stream.flush()?;
        Ok(())
    }
}

impl Deref for HttpRequest {
    type Target = Request<Vec<u8>>;

    fn deref(&self) -> &Self::Target {
        &self.request
    }
}

impl DerefMut for HttpRequest {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.request
    }
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Serializes a complete `http::Response` to raw HTTP/1.1 bytes, framed with
/// `Content-Length`. Used by ordinary (non-streaming) handlers; streaming
/// endpoints (`/stream`, long-lived SSE) instead write their own status
/// line via [`status_line`] and push body frames as they become available,
/// since their body length isn't known up front.
pub fn encode_response<B: AsRef<[u8]>>(response: &Response<B>) -> Vec<u8> {
    let body = response.body().as_ref();
    let mut out = status_line(response.status());
    for (name, value) in response.headers() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(body);
    out
}

/// `HTTP/1.1 <code> <reason>\r\n` for a given status, the first line any
/// response (framed or streamed) needs.
pub fn status_line(status: StatusCode) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_line_includes_code_and_reason() {
        let line = status_line(StatusCode::NOT_FOUND);
        assert_eq!(line, b"HTTP/1.1 404 Not Found\r\n");
    }

    #[test]
    fn encode_response_frames_body_with_content_length() {
        let response = Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body(b"{}".to_vec())
            .unwrap();
        let bytes = encode_response(&response);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-type: application/json\r\n"));
        assert!(text.contains("Content-Length: 2\r\n\r\n{}"));
    }

    #[test]
    fn find_header_end_locates_blank_line() {
        let buf = b"GET / HTTP/1.1\r\nHost: x\r\n\r\nbody";
        let end = find_header_end(buf).unwrap();
        assert_eq!(&buf[..end], &b"GET / HTTP/1.1\r\nHost: x"[..]);
    }

    #[test]
    fn from_stream_rejects_content_length_over_limit() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream
                .write_all(b"POST /api/sessions HTTP/1.1\r\nContent-Length: 1000000\r\n\r\n")
                .unwrap();
            // Never actually sends 1,000,000 bytes; a server that reads the
            // declared length without bounding it would hang here forever.
            stream
        });

        let (stream, remote_addr) = listener.accept().unwrap();
        let result = HttpRequest::from_stream(stream, remote_addr, Some(4096));
        assert!(result.is_err());

        client.join().unwrap();
    }
}

impl HttpRequest {
    /// Writes a fully-framed response in one call.
    pub fn respond_json<B: AsRef<[u8]>>(
        &mut self,
        response: Response<B>,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.respond(encode_response(&response))
    }
}
