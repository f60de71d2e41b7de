//! Loopback HTTP/1.1 endpoint and log capture for WS-Management tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{io, sync::Arc};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

/// One request received by the loopback endpoint.
#[derive(Debug, Clone)]
pub(crate) struct LoopbackRequest {
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl LoopbackRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(key, _)| key.eq_ignore_ascii_case(name)).map(|(_, value)| value.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Response written back for a request.
#[derive(Debug, Clone)]
pub(crate) struct LoopbackResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl LoopbackResponse {
    pub fn soap(status: u16, body: &str) -> Self {
        Self { status, headers: Vec::new(), body: body.as_bytes().to_vec() }
            .with_header("Content-Type", "application/soap+xml;charset=UTF-8")
    }

    pub fn empty(status: u16) -> Self {
        Self { status, headers: Vec::new(), body: Vec::new() }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_owned(), value.into()));
        self
    }
}

type Handler = Box<dyn FnMut(&LoopbackRequest) -> LoopbackResponse + Send>;

/// Serves every connection on `127.0.0.1` with one shared handler.
pub(crate) struct LoopbackServer {
    pub port: u16,
    requests: Arc<Mutex<Vec<LoopbackRequest>>>,
}

impl LoopbackServer {
    pub async fn start(handler: impl FnMut(&LoopbackRequest) -> LoopbackResponse + Send + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
        let port = listener.local_addr().expect("local addr").port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Mutex<Handler>> = Arc::new(Mutex::new(Box::new(handler)));

        let seen = Arc::clone(&requests);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let seen = Arc::clone(&seen);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let _ = serve(stream, seen, handler).await;
                });
            }
        });

        Self { port, requests }
    }

    /// Shorthand for a handler replaying `responses` in order.
    pub async fn replay(responses: Vec<LoopbackResponse>) -> Self {
        let mut responses = responses.into_iter();
        Self::start(move |_| responses.next().unwrap_or_else(|| LoopbackResponse::empty(500))).await
    }

    pub fn requests(&self) -> Vec<LoopbackRequest> {
        self.requests.lock().clone()
    }
}

async fn serve(
    mut stream: TcpStream,
    seen: Arc<Mutex<Vec<LoopbackRequest>>>,
    handler: Arc<Mutex<Handler>>,
) -> io::Result<()> {
    let mut buffer = Vec::new();
    loop {
        let head_end = loop {
            if let Some(at) = buffer.windows(4).position(|window| window == b"\r\n\r\n") {
                break at + 4;
            }
            if !read_more(&mut stream, &mut buffer).await? {
                return Ok(());
            }
        };

        let head = String::from_utf8_lossy(&buffer[..head_end]).into_owned();
        let headers: Vec<(String, String)> = head
            .lines()
            .skip(1)
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_owned(), value.trim().to_owned()))
            .collect();
        let length = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.parse::<usize>().ok())
            .unwrap_or(0);
        while buffer.len() < head_end + length {
            if !read_more(&mut stream, &mut buffer).await? {
                return Ok(());
            }
        }

        let request = LoopbackRequest { headers, body: buffer[head_end..head_end + length].to_vec() };
        buffer.drain(..head_end + length);

        let response = {
            let mut handler = handler.lock();
            (*handler)(&request)
        };
        seen.lock().push(request);

        let mut out = format!("HTTP/1.1 {} Loopback\r\nContent-Length: {}\r\n", response.status, response.body.len());
        for (name, value) in &response.headers {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        out.push_str("\r\n");
        let mut out = out.into_bytes();
        out.extend_from_slice(&response.body);
        stream.write_all(&out).await?;
    }
}

async fn read_more(stream: &mut TcpStream, buffer: &mut Vec<u8>) -> io::Result<bool> {
    let mut chunk = [0u8; 8192];
    let read = stream.read(&mut chunk).await?;
    buffer.extend_from_slice(&chunk[..read]);
    Ok(read > 0)
}

/// Formatted log output captured while the returned guard is alive.
pub(crate) struct CapturedLogs {
    lines: Arc<Mutex<Vec<u8>>>,
    _guard: tracing::subscriber::DefaultGuard,
}

impl CapturedLogs {
    pub fn start() -> Self {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || LogSink(Arc::clone(&sink)))
            .finish();
        Self { lines, _guard: tracing::subscriber::set_default(subscriber) }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.lines.lock()).into_owned()
    }
}

struct LogSink(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
