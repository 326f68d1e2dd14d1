//! Scripted HTTP server for exercising the network paths in tests.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
pub(crate) struct Route {
    status: u16,
    body: Vec<u8>,
    send_length: bool,
    stall_after: Option<usize>,
}

impl Route {
    pub(crate) fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            send_length: true,
            stall_after: None,
        }
    }

    pub(crate) fn status(code: u16) -> Self {
        Self {
            status: code,
            body: format!("status {code}").into_bytes(),
            send_length: true,
            stall_after: None,
        }
    }

    /// Omit Content-Length and close the connection to end the body.
    pub(crate) fn without_length(mut self) -> Self {
        self.send_length = false;
        self
    }

    /// Send only the first `bytes` of the body, then hold the connection open.
    pub(crate) fn stall_after(mut self, bytes: usize) -> Self {
        self.stall_after = Some(bytes);
        self
    }
}

struct FixtureState {
    running: AtomicBool,
    routes: Mutex<HashMap<String, Route>>,
    hits: Mutex<Vec<String>>,
}

pub(crate) struct FixtureServer {
    base_url: String,
    state: Arc<FixtureState>,
}

impl FixtureServer {
    pub(crate) fn start() -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind fixture server");
        listener
            .set_nonblocking(true)
            .expect("nonblocking fixture listener");
        let port = listener.local_addr().expect("fixture addr").port();
        let state = Arc::new(FixtureState {
            running: AtomicBool::new(true),
            routes: Mutex::new(HashMap::new()),
            hits: Mutex::new(Vec::new()),
        });
        let loop_state = Arc::clone(&state);
        thread::spawn(move || serve_loop(listener, loop_state));
        Self {
            base_url: format!("http://127.0.0.1:{port}"),
            state,
        }
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub(crate) fn route(&self, path: &str, route: Route) {
        let key = format!("/{}", path.trim_start_matches('/'));
        self.state
            .routes
            .lock()
            .expect("fixture routes lock")
            .insert(key, route);
    }

    /// Request paths in the order they arrived.
    pub(crate) fn hits(&self) -> Vec<String> {
        self.state.hits.lock().expect("fixture hits lock").clone()
    }
}

impl Drop for FixtureServer {
    fn drop(&mut self) {
        self.state.running.store(false, Ordering::Relaxed);
    }
}

fn serve_loop(listener: TcpListener, state: Arc<FixtureState>) {
    while state.running.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _)) => {
                let state = Arc::clone(&state);
                thread::spawn(move || {
                    let _ = handle_connection(stream, &state);
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(5));
            }
            Err(_) => thread::sleep(Duration::from_millis(20)),
        }
    }
}

fn handle_connection(mut stream: TcpStream, state: &FixtureState) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(4)))?;
    stream.set_write_timeout(Some(Duration::from_secs(4)))?;

    let Some(request_line) = read_request_line(&stream)? else {
        return Ok(());
    };
    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .split('?')
        .next()
        .unwrap_or("/")
        .to_string();
    if let Ok(mut hits) = state.hits.lock() {
        hits.push(path.clone());
    }

    let route = state
        .routes
        .lock()
        .ok()
        .and_then(|routes| routes.get(&path).cloned())
        .unwrap_or_else(|| Route::status(404));

    let mut head = format!(
        "HTTP/1.1 {} Fixture\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n",
        route.status
    );
    if route.send_length {
        head.push_str(&format!("Content-Length: {}\r\n", route.body.len()));
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes())?;

    match route.stall_after {
        Some(limit) => {
            let limit = limit.min(route.body.len());
            stream.write_all(&route.body[..limit])?;
            stream.flush()?;
            let started = Instant::now();
            while state.running.load(Ordering::Relaxed) && started.elapsed() < Duration::from_secs(10) {
                thread::sleep(Duration::from_millis(20));
            }
        }
        None => {
            stream.write_all(&route.body)?;
            stream.flush()?;
        }
    }
    Ok(())
}

fn read_request_line(stream: &TcpStream) -> std::io::Result<Option<String>> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut first_line = String::new();
    if reader.read_line(&mut first_line)? == 0 {
        return Ok(None);
    }
    for _ in 0..64 {
        let mut line = String::new();
        let count = reader.read_line(&mut line)?;
        if count == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }
    Ok(Some(first_line))
}
