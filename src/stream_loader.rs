// Streaming ingestion of splat sources.
//
// Each load runs on its own thread and forwards raw byte chunks over a
// channel; the main-thread driver appends them into the record store and
// notifies the sorting thread. HTTP errors surface once as a `Failed` event;
// bytes already delivered stay in the store (partial success, no rollback).

use anyhow::{bail, ensure, Context, Result};
use std::io::Read;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::thread::JoinHandle;
use tracing::{info, warn};

const CHUNK_SIZE: usize = 64 * 1024;

/// How the incoming bytes are interpreted by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Fixed 32-byte records, appended as they arrive.
    Splat,
    /// PLY with binary body; accumulated fully, converted on completion.
    Ply,
}

impl SourceKind {
    pub fn from_path(path: &str) -> Self {
        if path.rsplit('.').next().is_some_and(|ext| ext.eq_ignore_ascii_case("ply")) {
            Self::Ply
        } else {
            Self::Splat
        }
    }
}

pub enum LoadEvent {
    Chunk(Vec<u8>),
    Complete { total_bytes: usize },
    Failed(anyhow::Error),
}

/// One in-flight stream load feeding one region.
pub struct StreamLoad {
    pub region_id: u8,
    pub kind: SourceKind,
    // Mutex only to make the handle Sync; drained from one system.
    events: Mutex<Receiver<LoadEvent>>,
    thread: Option<JoinHandle<()>>,
}

impl StreamLoad {
    /// Starts fetching `source` on a background thread. `http(s)` URLs go
    /// through a streaming GET; anything else is read from the filesystem in
    /// the same chunked fashion.
    pub fn start(region_id: u8, source: &str) -> Self {
        let kind = SourceKind::from_path(source);
        let (tx, rx) = mpsc::channel();
        let source = source.to_string();
        info!(region_id, source, "starting splat stream");
        let thread = std::thread::Builder::new()
            .name(format!("splat-load-{region_id}"))
            .spawn(move || fetch_stream(&source, tx))
            .ok();
        if thread.is_none() {
            warn!(region_id, "failed to spawn stream loader thread");
        }
        Self {
            region_id,
            kind,
            events: Mutex::new(rx),
            thread,
        }
    }

    /// Non-blocking poll, drained by the per-frame driver.
    pub fn try_next(&self) -> Option<LoadEvent> {
        self.events.lock().ok()?.try_recv().ok()
    }
}

impl Drop for StreamLoad {
    fn drop(&mut self) {
        // Receiver drop aborts the producer on its next send.
        if let Some(thread) = self.thread.take() {
            if let Ok(events) = self.events.get_mut() {
                drop(std::mem::replace(events, mpsc::channel().1));
            }
            let _ = thread.join();
        }
    }
}

fn fetch_stream(source: &str, events: Sender<LoadEvent>) {
    let result = if source.starts_with("http://") || source.starts_with("https://") {
        fetch_http(source, &events)
    } else {
        fetch_file(source, &events)
    };
    match result {
        Ok(total_bytes) => {
            info!(source, total_bytes, "splat stream complete");
            let _ = events.send(LoadEvent::Complete { total_bytes });
        }
        Err(err) => {
            warn!(source, %err, "splat stream failed");
            let _ = events.send(LoadEvent::Failed(err));
        }
    }
}

fn fetch_http(url: &str, events: &Sender<LoadEvent>) -> Result<usize> {
    let response = reqwest::blocking::get(url)
        .with_context(|| format!("requesting splat source {url}"))?;
    ensure!(
        response.status().is_success(),
        "splat source {url} returned {}",
        response.status()
    );
    pump(response, events)
}

fn fetch_file(path: &str, events: &Sender<LoadEvent>) -> Result<usize> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("opening splat source {path}"))?;
    pump(file, events)
}

fn pump(mut reader: impl Read, events: &Sender<LoadEvent>) -> Result<usize> {
    let mut total = 0usize;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).context("reading splat stream")?;
        if n == 0 {
            return Ok(total);
        }
        total += n;
        if events.send(LoadEvent::Chunk(buf[..n].to_vec())).is_err() {
            bail!("stream consumer went away");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn drain(load: &StreamLoad) -> (Vec<u8>, Option<usize>, bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut bytes = Vec::new();
        let mut complete = None;
        let mut failed = false;
        while Instant::now() < deadline {
            match load.try_next() {
                Some(LoadEvent::Chunk(chunk)) => bytes.extend_from_slice(&chunk),
                Some(LoadEvent::Complete { total_bytes }) => {
                    complete = Some(total_bytes);
                    break;
                }
                Some(LoadEvent::Failed(_)) => {
                    failed = true;
                    break;
                }
                None => std::thread::sleep(Duration::from_millis(1)),
            }
        }
        (bytes, complete, failed)
    }

    #[test]
    fn file_source_streams_all_bytes() {
        let path = std::env::temp_dir().join(format!("splat_stream_{}.splat", std::process::id()));
        let payload: Vec<u8> = (0..200_000).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &payload).unwrap();
        let load = StreamLoad::start(1, path.to_str().unwrap());
        assert_eq!(load.kind, SourceKind::Splat);
        let (bytes, complete, failed) = drain(&load);
        assert!(!failed);
        assert_eq!(complete, Some(payload.len()));
        assert_eq!(bytes, payload);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_source_fails_once() {
        let load = StreamLoad::start(1, "/nonexistent/source.splat");
        let (bytes, complete, failed) = drain(&load);
        assert!(failed);
        assert!(complete.is_none());
        assert!(bytes.is_empty());
    }

    #[test]
    fn ply_extension_selects_ply_ingestion() {
        assert_eq!(SourceKind::from_path("scan.PLY"), SourceKind::Ply);
        assert_eq!(SourceKind::from_path("https://host/scene.splat"), SourceKind::Splat);
        assert_eq!(SourceKind::from_path("noext"), SourceKind::Splat);
    }
}
