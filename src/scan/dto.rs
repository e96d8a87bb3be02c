use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::acquire::ImageSource;
use super::decode::{DecodedCode, Symbology};
use super::session::{Phase, RunId, ScanSession};
use crate::products::model::ProductRecord;

#[derive(Debug, Deserialize)]
pub struct ScanBarcodeRequest {
    /// Base64 image, optionally as a `data:image/...;base64,` URL.
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ScanBarcodeResponse {
    pub barcode: String,
    pub format: Symbology,
}

#[derive(Debug, Serialize)]
pub struct ImageDims {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Serialize)]
pub struct FailureView {
    pub kind: &'static str,
    pub message: &'static str,
    /// Only present for expected outcomes; internal causes stay in the logs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub run_id: RunId,
    pub phase: Phase,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ImageSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageDims>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<DecodedCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<ProductRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureView>,
    #[serde(with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<OffsetDateTime>,
}

impl From<ScanSession> for SessionView {
    fn from(s: ScanSession) -> Self {
        Self {
            run_id: s.run_id,
            phase: s.phase,
            progress: s.progress,
            source: s.source,
            image: s.image.as_ref().map(|img| ImageDims {
                width: img.width(),
                height: img.height(),
            }),
            code: s.code,
            product: s.product,
            failure: s.failure.map(|f| FailureView {
                kind: f.kind(),
                message: f.user_message(),
                detail: f.is_expected().then(|| f.to_string()),
            }),
            finished_at: s.finished_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CreatedSession {
    pub id: Uuid,
    pub session: SessionView,
}
