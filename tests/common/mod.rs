#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use pipex::{
    Context, Error, PipexResult, Request, Response, ResponseBody, Transport, TransportErrorKind,
};

pub fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Clone, Debug)]
pub enum ScriptedOutcome {
    Response {
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    },
    TransportError(TransportErrorKind),
}

impl ScriptedOutcome {
    pub fn response(status: u16) -> Self {
        Self::Response {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        if let Self::Response { headers, .. } = &mut self {
            headers.push((name.into(), value.into()));
        }
        self
    }

    pub fn body(mut self, new_body: impl Into<Vec<u8>>) -> Self {
        if let Self::Response { body, .. } = &mut self {
            *body = new_body.into();
        }
        self
    }

    pub fn transport_error() -> Self {
        Self::TransportError(TransportErrorKind::Connect)
    }
}

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    pub url: String,
    pub headers: HeaderMap,
    pub sent_at: tokio::time::Instant,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(ToOwned::to_owned)
    }
}

/// In-process transport replaying a scripted response sequence. Records
/// every request it sees and attaches a release probe to each response so
/// tests can observe the release-exactly-once invariant.
#[derive(Debug, Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<ScriptedOutcome>>,
    requests: Mutex<Vec<RecordedRequest>>,
    releases: Arc<AtomicUsize>,
}

impl MockTransport {
    pub fn script(outcomes: impl IntoIterator<Item = ScriptedOutcome>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(outcomes.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            releases: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn sends(&self) -> usize {
        lock_unpoisoned(&self.requests).len()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock_unpoisoned(&self.requests).clone()
    }

    /// Number of scripted responses whose transport resource was released.
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

struct ReleaseProbe(Arc<AtomicUsize>);

impl Drop for ReleaseProbe {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, _context: &Context, request: &mut Request) -> PipexResult<Response> {
        lock_unpoisoned(&self.requests).push(RecordedRequest {
            method: request.method().to_string(),
            url: request.url().to_owned(),
            headers: request.headers().clone(),
            sent_at: tokio::time::Instant::now(),
        });

        let outcome = lock_unpoisoned(&self.script).pop_front().unwrap_or_else(|| {
            panic!("mock transport script exhausted at request {}", self.sends())
        });
        match outcome {
            ScriptedOutcome::Response {
                status,
                headers,
                body,
            } => {
                let status = StatusCode::from_u16(status).expect("scripted status");
                let mut header_map = HeaderMap::new();
                for (name, value) in headers {
                    header_map.append(
                        http::header::HeaderName::from_bytes(name.as_bytes())
                            .expect("scripted header name"),
                        value.parse().expect("scripted header value"),
                    );
                }
                Ok(Response::new(
                    status,
                    header_map,
                    ResponseBody::Buffered(Bytes::from(body)),
                )
                .with_release_guard(Box::new(ReleaseProbe(Arc::clone(&self.releases)))))
            }
            ScriptedOutcome::TransportError(kind) => Err(Error::Transport {
                kind,
                method: request.method().clone(),
                uri: request.url().to_owned(),
                source: "scripted connection failure".into(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw-TCP scripted server for tests that exercise the real hyper transport.

#[derive(Clone)]
pub struct ResponseSpec {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ResponseSpec {
    pub fn new(
        status: u16,
        headers: Vec<(impl Into<String>, impl Into<String>)>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            status,
            headers: headers
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
            body: body.into(),
        }
    }
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|window| window == b"\r\n\r\n")
}

fn parse_content_length(raw_headers: &[u8]) -> usize {
    let text = String::from_utf8_lossy(raw_headers);
    for line in text.split("\r\n") {
        if let Some((name, value)) = line.split_once(':')
            && name.trim().eq_ignore_ascii_case("content-length")
            && let Ok(parsed) = value.trim().parse::<usize>()
        {
            return parsed;
        }
    }
    0
}

fn read_http_message(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;

    let mut raw = Vec::new();
    loop {
        let mut chunk = [0_u8; 1024];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..read]);

        if let Some(header_end) = find_header_end(&raw) {
            let content_length = parse_content_length(&raw[..header_end]);
            let expected_total = header_end + 4 + content_length;
            if raw.len() >= expected_total {
                break;
            }
        }
    }

    Ok(raw)
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        202 => "Accepted",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

fn write_http_response(stream: &mut TcpStream, response: &ResponseSpec) -> std::io::Result<()> {
    let mut raw = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status,
        status_text(response.status),
        response.body.len()
    )
    .into_bytes();

    for (name, value) in &response.headers {
        raw.extend_from_slice(name.as_bytes());
        raw.extend_from_slice(b": ");
        raw.extend_from_slice(value.as_bytes());
        raw.extend_from_slice(b"\r\n");
    }
    raw.extend_from_slice(b"\r\n");
    raw.extend_from_slice(&response.body);

    stream.write_all(&raw)?;
    stream.flush()
}

/// Serves the scripted responses in order on a loopback listener, one
/// connection per response, then exits.
pub fn spawn_scripted_server(responses: Vec<ResponseSpec>) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
    let address = listener.local_addr().expect("listener address");
    let handle = thread::spawn(move || {
        for response in responses {
            let Ok((mut stream, _peer)) = listener.accept() else {
                return;
            };
            if read_http_message(&mut stream).is_err() {
                return;
            }
            let _ = write_http_response(&mut stream, &response);
        }
    });
    (format!("http://{address}"), handle)
}
