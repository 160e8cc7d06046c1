//! Minimal JSON status endpoint reporting the aggregate
//! [`MetricsSnapshot`] — there is no per-flow connection table here since
//! per-flow accounting is an explicit non-goal.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;

use tracing::{debug, error, info, warn};

use super::counters::METRICS;

/// Start the JSON status server on a background OS thread, kept off the
/// tokio runtime since it only ever serves a handful of bytes per request.
pub fn start_api_server(addr: SocketAddr) {
    thread::spawn(move || {
        if let Err(err) = run_api_server(addr) {
            error!(%err, "status API server error");
        }
    });
    info!(%addr, "status API server started");
}

fn run_api_server(addr: SocketAddr) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr)?;
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                thread::spawn(move || {
                    if let Err(err) = handle_request(stream) {
                        debug!(%err, "status API request error");
                    }
                });
            }
            Err(err) => warn!(%err, "failed to accept status API connection"),
        }
    }
    Ok(())
}

fn handle_request(mut stream: TcpStream) -> std::io::Result<()> {
    let mut buffer = [0u8; 1024];
    let n = stream.read(&mut buffer)?;
    if n == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buffer[..n]);
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    let (status, body) = match path {
        "/stats" => {
            let snapshot = METRICS.snapshot();
            ("200 OK", serde_json::to_string_pretty(&snapshot).unwrap_or_default())
        }
        "/" => (
            "200 OK",
            r#"{"endpoints":{"/stats":"Aggregate forwarder counters"}}"#.to_string(),
        ),
        _ => ("404 Not Found", r#"{"error":"not found"}"#.to_string()),
    };

    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes())?;
    stream.flush()
}
