//! Lifecycle of the writer thread owned by the cache daemon.
//!
//! Rebuild requests arrive over a bounded channel; the writer runs them one
//! at a time on a dedicated named thread. Readers are unaffected by the
//! daemon's lifecycle, they only see the protocol words in the index file.

use crate::coord::CompactLayout;
use crate::error::{Error, Result};
use crate::writer::CacheWriter;
use flume::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

const REQUEST_QUEUE_DEPTH: usize = 16;
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One rebuild order for the writer thread.
#[derive(Debug, Clone)]
pub struct RebuildRequest {
    pub version: u32,
    pub layout: CompactLayout,
}

pub struct CacheDaemon {
    tx: Sender<RebuildRequest>,
    handle: Mutex<Option<JoinHandle<()>>>,
    shutdown_flag: Arc<AtomicBool>,
}

impl CacheDaemon {
    /// Take ownership of the writer and start serving rebuild requests.
    pub fn start(mut writer: CacheWriter) -> CacheDaemon {
        let (tx, rx) = flume::bounded(REQUEST_QUEUE_DEPTH);
        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown_flag);
        let handle = spawn_named("PixelsCacheWriter", move || {
            Self::run(&mut writer, rx, &flag);
        });
        CacheDaemon {
            tx,
            handle: Mutex::new(Some(handle)),
            shutdown_flag,
        }
    }

    fn run(writer: &mut CacheWriter, rx: Receiver<RebuildRequest>, shutdown: &AtomicBool) {
        loop {
            if shutdown.load(Ordering::Acquire) {
                break;
            }
            match rx.recv_timeout(SHUTDOWN_POLL_INTERVAL) {
                Ok(request) => {
                    let status = writer.update_all(request.version, &request.layout);
                    debug!(
                        version = request.version,
                        code = status.as_code(),
                        "cache rebuild finished"
                    );
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /// Queue a rebuild. Fails once the daemon has been stopped.
    #[inline]
    pub fn submit(&self, request: RebuildRequest) -> Result<()> {
        self.tx.send(request).map_err(|_| Error::DaemonStopped)
    }

    /// Stop the writer thread and wait for it to finish the request it is
    /// working on. Idempotent.
    pub fn stop(&self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CacheDaemon {
    #[inline]
    fn drop(&mut self) {
        self.stop();
    }
}

#[inline]
pub fn spawn_named<S, F>(name: S, f: F) -> JoinHandle<()>
where
    String: From<S>,
    F: FnOnce() + Send + 'static,
{
    let thread_name = String::from(name);
    thread::Builder::new()
        .name(thread_name)
        .spawn(|| {
            let thd = thread::current();
            debug!(name = thd.name().unwrap_or("unknown"), "thread started");
            f();
            let thd = thread::current();
            debug!(name = thd.name().unwrap_or("unknown"), "thread finished");
        })
        .unwrap()
}
