//! Scan session state and its transitions.
//!
//! A session value is never mutated in place: every transition returns the
//! next value, and every pipeline event carries the run id it belongs to.
//! Events from any other run are rejected, which is what keeps a late result
//! from an abandoned run out of a newer session.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use super::acquire::{AcquireError, CapturedImage, ImageSource};
use super::decode::DecodedCode;
use crate::products::model::ProductRecord;
use crate::products::resolver::ResolveError;

pub type RunId = u64;

pub const PROGRESS_ACQUIRING: u8 = 10;
pub const PROGRESS_DECODING: u8 = 40;
pub const PROGRESS_RESOLVING: u8 = 70;
pub const PROGRESS_DONE: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Idle,
    Acquiring,
    Decoding,
    Resolving,
    Found,
    NotFound,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Found | Self::NotFound | Self::Failed)
    }

    pub fn is_running(self) -> bool {
        matches!(self, Self::Acquiring | Self::Decoding | Self::Resolving)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScanFailure {
    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),

    #[error("image could not be read: {0}")]
    DecodeImage(String),

    #[error("no barcode detected")]
    NoCodeDetected,

    #[error("product source unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ScanFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CameraUnavailable(_) => "cameraUnavailable",
            Self::DecodeImage(_) => "decodeImageError",
            Self::NoCodeDetected => "noCodeDetected",
            Self::UpstreamUnavailable(_) => "upstreamUnavailable",
            Self::Internal(_) => "internal",
        }
    }

    /// Expected outcomes get specific guidance; the rest get a generic message.
    pub fn is_expected(&self) -> bool {
        !matches!(self, Self::UpstreamUnavailable(_) | Self::Internal(_))
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::CameraUnavailable(_) => {
                "Could not access your camera. Please check permissions or upload a photo instead."
            }
            Self::DecodeImage(_) => "That file is not an image we can read. Try a PNG or JPEG photo.",
            Self::NoCodeDetected => "No barcode found. Hold the package steady and try again.",
            Self::UpstreamUnavailable(_) | Self::Internal(_) => {
                "Something went wrong while scanning. Please try again later."
            }
        }
    }
}

impl From<AcquireError> for ScanFailure {
    fn from(e: AcquireError) -> Self {
        match e {
            AcquireError::CameraUnavailable(m) => Self::CameraUnavailable(m),
            AcquireError::DecodeImage(m) => Self::DecodeImage(m),
        }
    }
}

#[derive(Debug)]
pub enum ScanEvent {
    ImageReady(Arc<CapturedImage>),
    AcquireFailed(AcquireError),
    Decoded(Option<DecodedCode>),
    Resolved(Result<ProductRecord, ResolveError>),
    Crashed(String),
}

#[derive(Debug, Clone)]
pub struct ScanSession {
    pub run_id: RunId,
    pub phase: Phase,
    pub source: Option<ImageSource>,
    pub image: Option<Arc<CapturedImage>>,
    pub code: Option<DecodedCode>,
    pub product: Option<ProductRecord>,
    pub failure: Option<ScanFailure>,
    pub progress: u8,
    pub finished_at: Option<OffsetDateTime>,
}

impl Default for ScanSession {
    fn default() -> Self {
        Self::idle(0)
    }
}

impl ScanSession {
    pub fn idle(run_id: RunId) -> Self {
        Self {
            run_id,
            phase: Phase::Idle,
            source: None,
            image: None,
            code: None,
            product: None,
            failure: None,
            progress: 0,
            finished_at: None,
        }
    }

    /// Resets to Idle under `run_id` and moves straight on to Acquiring.
    pub fn begin(run_id: RunId, source: ImageSource) -> Self {
        Self {
            phase: Phase::Acquiring,
            source: Some(source),
            progress: PROGRESS_ACQUIRING,
            ..Self::idle(run_id)
        }
    }

    /// Cancel and reset both land here; `next_run` invalidates whatever was in flight.
    pub fn cancelled(next_run: RunId) -> Self {
        Self::idle(next_run)
    }

    /// Next state for `event`, or `None` when the event belongs to another
    /// run or does not apply to the current phase.
    pub fn apply(&self, run_id: RunId, event: ScanEvent) -> Option<Self> {
        if run_id != self.run_id {
            return None;
        }
        let next = match (self.phase, event) {
            (Phase::Acquiring, ScanEvent::ImageReady(image)) => Self {
                phase: Phase::Decoding,
                image: Some(image),
                ..self.clone()
            }
            .advanced(PROGRESS_DECODING),

            (Phase::Acquiring, ScanEvent::AcquireFailed(e)) => self.failed(e.into()),

            (Phase::Decoding, ScanEvent::Decoded(Some(code))) => Self {
                phase: Phase::Resolving,
                image: None,
                code: Some(code),
                ..self.clone()
            }
            .advanced(PROGRESS_RESOLVING),

            (Phase::Decoding, ScanEvent::Decoded(None)) => self.failed(ScanFailure::NoCodeDetected),

            (Phase::Resolving, ScanEvent::Resolved(Ok(product))) => Self {
                phase: Phase::Found,
                product: Some(product),
                ..self.clone()
            }
            .finished(),

            (Phase::Resolving, ScanEvent::Resolved(Err(ResolveError::NotFound(_)))) => Self {
                phase: Phase::NotFound,
                ..self.clone()
            }
            .finished(),

            (Phase::Resolving, ScanEvent::Resolved(Err(ResolveError::Upstream(m)))) => {
                self.failed(ScanFailure::UpstreamUnavailable(m))
            }

            (phase, ScanEvent::Crashed(m)) if phase.is_running() => self.failed(ScanFailure::Internal(m)),

            _ => return None,
        };
        Some(next)
    }

    fn failed(&self, failure: ScanFailure) -> Self {
        Self {
            phase: Phase::Failed,
            image: None,
            failure: Some(failure),
            ..self.clone()
        }
        .finished()
    }

    fn finished(self) -> Self {
        Self {
            image: None,
            finished_at: Some(OffsetDateTime::now_utc()),
            ..self.advanced(PROGRESS_DONE)
        }
    }

    fn advanced(mut self, progress: u8) -> Self {
        self.progress = self.progress.max(progress);
        self
    }
}

#[cfg(test)]
mod session_tests {
    use super::*;
    use crate::products::model::Nutrition;
    use crate::scan::acquire::acquire_from_file;
    use crate::scan::decode::{testing::barcode_png, Symbology};

    fn image() -> Arc<CapturedImage> {
        Arc::new(acquire_from_file(&barcode_png("5901234123457")).unwrap())
    }

    fn code() -> DecodedCode {
        DecodedCode::new("5901234123457", Symbology::Ean13).unwrap()
    }

    fn product() -> ProductRecord {
        ProductRecord {
            name: "Organic Granola".into(),
            brand: "Nature's Best".into(),
            nutrition: Nutrition { calories: 120.0, ..Nutrition::default() },
            ingredients: String::new(),
            allergens: Default::default(),
            health_score: Some(85),
        }
    }

    #[test]
    fn happy_path_progress_is_monotonic() {
        let s0 = ScanSession::begin(1, ImageSource::Upload);
        assert_eq!(s0.phase, Phase::Acquiring);
        assert_eq!(s0.progress, PROGRESS_ACQUIRING);

        let s1 = s0.apply(1, ScanEvent::ImageReady(image())).unwrap();
        assert_eq!(s1.phase, Phase::Decoding);
        assert!(s1.image.is_some());

        let s2 = s1.apply(1, ScanEvent::Decoded(Some(code()))).unwrap();
        assert_eq!(s2.phase, Phase::Resolving);
        assert!(s2.image.is_none(), "image is dropped after decoding");

        let s3 = s2.apply(1, ScanEvent::Resolved(Ok(product()))).unwrap();
        assert_eq!(s3.phase, Phase::Found);
        assert_eq!(s3.product.as_ref().unwrap().name, "Organic Granola");
        assert!(s3.finished_at.is_some());

        let progress: Vec<u8> = [&s0, &s1, &s2, &s3].iter().map(|s| s.progress).collect();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*progress.last().unwrap(), PROGRESS_DONE);
    }

    #[test]
    fn no_code_fails_with_no_code_detected() {
        let s = ScanSession::begin(3, ImageSource::Upload)
            .apply(3, ScanEvent::ImageReady(image()))
            .unwrap()
            .apply(3, ScanEvent::Decoded(None))
            .unwrap();
        assert_eq!(s.phase, Phase::Failed);
        assert_eq!(s.failure, Some(ScanFailure::NoCodeDetected));
        assert!(s.image.is_none());
        assert_eq!(s.progress, PROGRESS_DONE);
    }

    #[test]
    fn resolver_outcomes_map_to_phases() {
        let resolving = ScanSession {
            phase: Phase::Resolving,
            code: Some(code()),
            progress: PROGRESS_RESOLVING,
            ..ScanSession::idle(5)
        };

        let nf = resolving
            .apply(5, ScanEvent::Resolved(Err(ResolveError::NotFound("0".into()))))
            .unwrap();
        assert_eq!(nf.phase, Phase::NotFound);
        assert!(nf.failure.is_none());

        let up = resolving
            .apply(5, ScanEvent::Resolved(Err(ResolveError::Upstream("timeout".into()))))
            .unwrap();
        assert_eq!(up.phase, Phase::Failed);
        assert_eq!(up.failure, Some(ScanFailure::UpstreamUnavailable("timeout".into())));
        assert!(!up.failure.unwrap().is_expected());
    }

    #[test]
    fn acquisition_failure_keeps_acquirer_error() {
        let s = ScanSession::begin(2, ImageSource::Camera)
            .apply(2, ScanEvent::AcquireFailed(AcquireError::CameraUnavailable("denied".into())))
            .unwrap();
        assert_eq!(s.phase, Phase::Failed);
        assert_eq!(s.failure, Some(ScanFailure::CameraUnavailable("denied".into())));
        assert!(s.failure.unwrap().is_expected());
    }

    #[test]
    fn stale_and_out_of_phase_events_are_rejected() {
        let s = ScanSession::begin(7, ImageSource::Upload);
        assert!(s.apply(6, ScanEvent::ImageReady(image())).is_none());
        assert!(s.apply(7, ScanEvent::Decoded(Some(code()))).is_none());
        assert!(s.apply(7, ScanEvent::Resolved(Ok(product()))).is_none());

        let idle = ScanSession::cancelled(8);
        assert!(idle.apply(8, ScanEvent::Crashed("boom".into())).is_none());
        assert!(idle.apply(7, ScanEvent::Resolved(Ok(product()))).is_none());
    }

    #[test]
    fn crash_while_running_is_internal_failure() {
        let s = ScanSession::begin(1, ImageSource::Upload)
            .apply(1, ScanEvent::Crashed("decoder panicked".into()))
            .unwrap();
        assert_eq!(s.failure.as_ref().map(ScanFailure::kind), Some("internal"));
    }

    #[test]
    fn begin_resets_previous_results() {
        let done = ScanSession {
            phase: Phase::Found,
            product: Some(product()),
            code: Some(code()),
            progress: PROGRESS_DONE,
            ..ScanSession::idle(1)
        };
        let next = ScanSession::begin(done.run_id + 1, ImageSource::Upload);
        assert!(next.product.is_none() && next.code.is_none() && next.failure.is_none());
        assert_eq!(next.progress, PROGRESS_ACQUIRING);
    }
}
