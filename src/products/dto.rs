use serde::{Deserialize, Serialize};

use super::model::ProductRecord;

#[derive(Debug, Deserialize)]
pub struct ProductInfoRequest {
    #[serde(default)]
    pub barcode: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductInfoResponse {
    pub product_info: ProductRecord,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: Option<String>,
}
