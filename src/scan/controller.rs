use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::acquire::{acquire_from_file, Camera, ImageSource, StreamGuard};
use super::decode::BarcodeDecoder;
use super::session::{RunId, ScanEvent, ScanSession};
use crate::products::resolver::ProductResolver;

struct Inner {
    session: ScanSession,
    next_run: RunId,
    token: CancellationToken,
}

/// Drives acquire → decode → resolve for one user-facing scan session.
///
/// Only one run is live at a time. Starting a run, cancelling or resetting
/// bumps the run id and cancels the previous run's token, so whatever the old
/// run was awaiting is dropped and any event it still emits is discarded.
pub struct ScanController {
    decoder: BarcodeDecoder,
    resolver: ProductResolver,
    camera: Arc<dyn Camera>,
    camera_permit: Arc<Semaphore>,
    inner: Mutex<Inner>,
    updates: watch::Sender<ScanSession>,
}

impl ScanController {
    pub fn new(decoder: BarcodeDecoder, resolver: ProductResolver, camera: Arc<dyn Camera>) -> Self {
        let (updates, _) = watch::channel(ScanSession::default());
        Self {
            decoder,
            resolver,
            camera,
            camera_permit: Arc::new(Semaphore::new(1)),
            inner: Mutex::new(Inner {
                session: ScanSession::default(),
                next_run: 1,
                token: CancellationToken::new(),
            }),
            updates,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> ScanSession {
        self.lock().session.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ScanSession> {
        self.updates.subscribe()
    }

    /// Returns to Idle immediately; the in-flight run, if any, is abandoned.
    pub fn cancel(&self) -> ScanSession {
        let mut inner = self.lock();
        let was = inner.session.phase;
        inner.token.cancel();
        inner.token = CancellationToken::new();
        let run = inner.next_run;
        inner.next_run += 1;
        inner.session = ScanSession::cancelled(run);
        self.updates.send_replace(inner.session.clone());
        if was.is_running() {
            info!(run, from = ?was, "scan cancelled");
        }
        inner.session.clone()
    }

    pub fn reset(&self) -> ScanSession {
        self.cancel()
    }

    fn start(&self, source: ImageSource) -> (RunId, CancellationToken, ScanSession) {
        let mut inner = self.lock();
        inner.token.cancel();
        let token = CancellationToken::new();
        inner.token = token.clone();
        let run = inner.next_run;
        inner.next_run += 1;
        inner.session = ScanSession::begin(run, source);
        self.updates.send_replace(inner.session.clone());
        debug!(run, ?source, "scan run started");
        (run, token, inner.session.clone())
    }

    /// Applies `event` if it belongs to the live run. Publishing happens under
    /// the lock so observers see transitions in order.
    fn dispatch(&self, run: RunId, event: ScanEvent) -> bool {
        let mut inner = self.lock();
        match inner.session.apply(run, event) {
            Some(next) => {
                match &next.failure {
                    Some(f) if !f.is_expected() => {
                        warn!(run, failure = f.kind(), error = %f, "scan failed");
                    }
                    _ if next.phase.is_terminal() => {
                        info!(
                            run,
                            phase = ?next.phase,
                            code = next.code.as_ref().map(|c| c.value()),
                            failure = next.failure.as_ref().map(|f| f.kind()),
                            "scan finished"
                        );
                    }
                    _ => {}
                }
                inner.session = next;
                self.updates.send_replace(inner.session.clone());
                true
            }
            None => {
                debug!(run, current = inner.session.run_id, "discarding stale scan event");
                false
            }
        }
    }

    /// Runs the pipeline on uploaded file bytes and returns the session once
    /// the run ends. If a newer run took over meanwhile, that run's state is returned.
    pub async fn scan_upload(&self, bytes: Bytes) -> ScanSession {
        let (run, token, _) = self.start(ImageSource::Upload);
        self.run_upload(run, token, bytes).await
    }

    /// Starts an upload run in the background and returns the freshly started session.
    pub fn spawn_upload(self: &Arc<Self>, bytes: Bytes) -> ScanSession {
        let (run, token, started) = self.start(ImageSource::Upload);
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_upload(run, token, bytes).await });
        started
    }

    /// Opens the camera, captures one frame and runs the pipeline on it. The
    /// stream is released before decoding starts, and on every early exit.
    pub async fn scan_camera(&self) -> ScanSession {
        let (run, token, _) = self.start(ImageSource::Camera);
        self.run_camera(run, token).await
    }

    pub fn spawn_camera(self: &Arc<Self>) -> ScanSession {
        let (run, token, started) = self.start(ImageSource::Camera);
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_camera(run, token).await });
        started
    }

    async fn run_upload(&self, run: RunId, token: CancellationToken, bytes: Bytes) -> ScanSession {
        let acquire = async move {
            match tokio::task::spawn_blocking(move || acquire_from_file(&bytes)).await {
                Ok(Ok(img)) => ScanEvent::ImageReady(Arc::new(img)),
                Ok(Err(e)) => ScanEvent::AcquireFailed(e),
                Err(e) => ScanEvent::Crashed(e.to_string()),
            }
        };
        self.drive(run, token, acquire).await
    }

    async fn run_camera(&self, run: RunId, token: CancellationToken) -> ScanSession {
        let permits = self.camera_permit.clone();
        let camera = self.camera.clone();
        let acquire = async move {
            let permit = match permits.acquire_owned().await {
                Ok(p) => p,
                Err(e) => return ScanEvent::Crashed(e.to_string()),
            };
            let stream = match camera.open().await {
                Ok(s) => s,
                Err(e) => {
                    warn!(run, error = %e, "camera open failed");
                    return ScanEvent::AcquireFailed(e);
                }
            };
            let mut guard = StreamGuard::new(stream, permit);
            match guard.capture().await {
                Ok(img) => ScanEvent::ImageReady(Arc::new(img)),
                Err(e) => ScanEvent::AcquireFailed(e),
            }
        };
        self.drive(run, token, acquire).await
    }

    async fn drive<F>(&self, run: RunId, token: CancellationToken, acquire: F) -> ScanSession
    where
        F: Future<Output = ScanEvent>,
    {
        tokio::select! {
            biased;
            _ = token.cancelled() => debug!(run, "scan run abandoned"),
            _ = self.pipeline(run, acquire) => {}
        }
        self.snapshot()
    }

    async fn pipeline<F>(&self, run: RunId, acquire: F)
    where
        F: Future<Output = ScanEvent>,
    {
        let image = match acquire.await {
            ScanEvent::ImageReady(img) => img,
            other => {
                self.dispatch(run, other);
                return;
            }
        };
        debug!(
            run,
            source = ?image.source(),
            width = image.width(),
            height = image.height(),
            "image acquired"
        );
        if !self.dispatch(run, ScanEvent::ImageReady(image.clone())) {
            return;
        }

        let decoder = self.decoder;
        let decoded = tokio::task::spawn_blocking(move || {
            decoder.decode(image.pixels(), image.width() as usize, image.height() as usize)
        })
        .await;
        let code = match decoded {
            Ok(code) => code,
            Err(e) => {
                self.dispatch(run, ScanEvent::Crashed(e.to_string()));
                return;
            }
        };
        if !self.dispatch(run, ScanEvent::Decoded(code.clone())) {
            return;
        }
        let Some(code) = code else {
            return;
        };

        let resolved = self.resolver.resolve(&code).await;
        self.dispatch(run, ScanEvent::Resolved(resolved));
    }
}
