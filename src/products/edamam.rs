use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::model::{Nutrition, ProductRecord};
use super::source::{ProductSource, SourceError};
use crate::config::EdamamConfig;

/// Client for the Edamam food-database parser, used both for barcode lookups
/// (`upc=`) and free-text food search (`ingr=`).
#[derive(Clone)]
pub struct EdamamClient {
    http: reqwest::Client,
    base_url: String,
    app_id: String,
    app_key: String,
}

#[derive(Debug, Deserialize)]
struct ParserResponse {
    #[serde(default)]
    parsed: Vec<ParsedEntry>,
    #[serde(default)]
    hints: Vec<ParsedEntry>,
}

#[derive(Debug, Deserialize)]
struct ParsedEntry {
    food: EdamamFood,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EdamamFood {
    food_id: String,
    label: String,
    #[serde(default)]
    brand: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    food_contents_label: Option<String>,
    #[serde(default)]
    nutrients: HashMap<String, f64>,
}

impl EdamamFood {
    fn nutrient(&self, key: &str) -> f64 {
        self.nutrients
            .get(key)
            .copied()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .unwrap_or(0.0)
    }

    fn nutrition(&self) -> Nutrition {
        Nutrition {
            calories: self.nutrient("ENERC_KCAL"),
            protein: self.nutrient("PROCNT"),
            fat: self.nutrient("FAT"),
            carbs: self.nutrient("CHOCDF"),
            sugar: self.nutrient("SUGAR"),
            fiber: self.nutrient("FIBTG"),
        }
    }

    fn into_record(self) -> ProductRecord {
        let nutrition = self.nutrition();
        ProductRecord {
            name: self.label,
            brand: self.brand.unwrap_or_default(),
            nutrition,
            ingredients: self.food_contents_label.unwrap_or_default(),
            allergens: BTreeSet::new(),
            health_score: None,
        }
    }

    fn into_hit(self) -> FoodHit {
        let n = self.nutrition();
        FoodHit {
            food_id: self.food_id,
            label: self.label,
            brand: self.brand,
            category: self.category,
            nutrients: HitNutrients {
                calories: n.calories,
                protein: n.protein,
                fat: n.fat,
                carbs: n.carbs,
                fiber: n.fiber,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FoodHit {
    pub food_id: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub nutrients: HitNutrients,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HitNutrients {
    pub calories: f64,
    pub protein: f64,
    pub fat: f64,
    pub carbs: f64,
    pub fiber: f64,
}

impl EdamamClient {
    pub fn new(cfg: &EdamamConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(cfg.timeout()).build()?;
        Ok(Self {
            http,
            base_url: cfg.base_url.clone(),
            app_id: cfg.app_id.clone(),
            app_key: cfg.app_key.clone(),
        })
    }

    async fn query(&self, param: &str, value: &str) -> Result<Option<ParserResponse>, SourceError> {
        let res = self
            .http
            .get(&self.base_url)
            .query(&[
                ("app_id", self.app_id.as_str()),
                ("app_key", self.app_key.as_str()),
                (param, value),
            ])
            .send()
            .await
            // the request URL carries the credentials
            .map_err(|e| SourceError::Unavailable(e.without_url().to_string()))?;

        match res.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let body = res
                    .json::<ParserResponse>()
                    .await
                    .map_err(|e| SourceError::Malformed(e.without_url().to_string()))?;
                Ok(Some(body))
            }
            s => {
                warn!(status = %s, param, "edamam request failed");
                Err(SourceError::Status(s.as_u16()))
            }
        }
    }

    pub async fn search(&self, query: &str) -> Result<Vec<FoodHit>, SourceError> {
        let Some(body) = self.query("ingr", query).await? else {
            return Ok(Vec::new());
        };
        let hits = collect_hits(body);
        debug!(query, hits = hits.len(), "edamam search");
        Ok(hits)
    }
}

fn first_food(body: ParserResponse) -> Option<EdamamFood> {
    body.parsed
        .into_iter()
        .chain(body.hints)
        .map(|e| e.food)
        .next()
}

fn collect_hits(body: ParserResponse) -> Vec<FoodHit> {
    let mut seen = std::collections::HashSet::new();
    body.parsed
        .into_iter()
        .chain(body.hints)
        .map(|e| e.food)
        .filter(|f| seen.insert(f.food_id.clone()))
        .map(EdamamFood::into_hit)
        .collect()
}

#[async_trait]
impl ProductSource for EdamamClient {
    async fn lookup(&self, code: &str) -> Result<Option<ProductRecord>, SourceError> {
        let Some(body) = self.query("upc", code).await? else {
            return Ok(None);
        };
        Ok(first_food(body).map(EdamamFood::into_record))
    }

    fn name(&self) -> &'static str {
        "edamam"
    }
}

#[cfg(test)]
mod edamam_tests {
    use super::*;

    fn sample() -> ParserResponse {
        serde_json::from_value(serde_json::json!({
            "text": "granola",
            "parsed": [{
                "food": {
                    "foodId": "food_a1",
                    "label": "Granola Clusters",
                    "brand": "Nature's Best",
                    "foodContentsLabel": "Oats; Honey",
                    "nutrients": {"ENERC_KCAL": 471.0, "PROCNT": 10.5, "FAT": 20.0, "CHOCDF": 64.0, "FIBTG": 6.0}
                }
            }],
            "hints": [
                {"food": {"foodId": "food_a1", "label": "Granola Clusters", "nutrients": {}}, "measures": []},
                {"food": {"foodId": "food_b2", "label": "Granola Bar", "category": "Packaged foods",
                          "nutrients": {"ENERC_KCAL": 400.0, "FAT": -3.0}}, "measures": []}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn maps_first_parsed_food_to_record() {
        let rec = first_food(sample()).unwrap().into_record();
        assert_eq!(rec.name, "Granola Clusters");
        assert_eq!(rec.brand, "Nature's Best");
        assert_eq!(rec.ingredients, "Oats; Honey");
        assert_eq!(rec.nutrition.calories, 471.0);
        assert_eq!(rec.nutrition.carbs, 64.0);
        assert_eq!(rec.nutrition.sugar, 0.0);
        assert!(rec.validate().is_ok());
    }

    #[test]
    fn search_hits_are_deduplicated_and_sanitized() {
        let hits = collect_hits(sample());
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[1].food_id, "food_b2");
        assert_eq!(hits[1].category.as_deref(), Some("Packaged foods"));
        // negative upstream values are clamped to absent
        assert_eq!(hits[1].nutrients.fat, 0.0);
    }

    /// Serves a parser stand-in on an ephemeral port: `upc=5901234123457`
    /// answers with a food, other upcs 404, `upc=500` fails, `ingr` searches.
    async fn fake_parser() -> EdamamClient {
        use axum::{extract::Query, http::StatusCode as Status, routing::get, Json, Router};

        async fn parser(Query(q): Query<HashMap<String, String>>) -> Result<Json<serde_json::Value>, Status> {
            if q.get("app_key").map(String::as_str) != Some("key") {
                return Err(Status::UNAUTHORIZED);
            }
            match (q.get("upc").map(String::as_str), q.get("ingr")) {
                (Some("5901234123457"), _) | (None, Some(_)) => Ok(Json(serde_json::json!({
                    "hints": [{"food": {"foodId": "food_g", "label": "Organic Granola",
                                        "brand": "Nature's Best",
                                        "nutrients": {"ENERC_KCAL": 120.0, "PROCNT": 3.0}}}]
                }))),
                (Some("500"), _) => Err(Status::INTERNAL_SERVER_ERROR),
                _ => Err(Status::NOT_FOUND),
            }
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, Router::new().route("/parser", get(parser)))
                .await
                .unwrap();
        });

        EdamamClient::new(&EdamamConfig {
            base_url: format!("http://{}/parser", addr),
            app_id: "id".into(),
            app_key: "key".into(),
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn lookup_against_live_parser() {
        let client = fake_parser().await;

        let rec = client.lookup("5901234123457").await.unwrap().unwrap();
        assert_eq!(rec.name, "Organic Granola");
        assert_eq!(rec.nutrition.calories, 120.0);

        assert!(client.lookup("0000000000000").await.unwrap().is_none());
        assert!(matches!(client.lookup("500").await, Err(SourceError::Status(500))));
    }

    #[tokio::test]
    async fn search_against_live_parser() {
        let client = fake_parser().await;
        let hits = client.search("granola").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].label, "Organic Granola");
        assert_eq!(hits[0].nutrients.protein, 3.0);
    }

    #[tokio::test]
    async fn transport_errors_do_not_carry_credentials() {
        let client = EdamamClient::new(&EdamamConfig {
            base_url: "http://127.0.0.1:9/parser".into(),
            app_id: "id".into(),
            app_key: "SECRET-KEY-123".into(),
            timeout_secs: 2,
        })
        .unwrap();

        let err = client.lookup("5901234123457").await.unwrap_err();
        assert!(matches!(err, SourceError::Unavailable(_)));
        assert!(!err.to_string().contains("SECRET-KEY-123"));
        assert!(!err.to_string().contains("app_key"));
    }

    #[test]
    fn empty_response_has_no_food() {
        let body: ParserResponse = serde_json::from_str(r#"{"text":"x"}"#).unwrap();
        assert!(first_food(body).is_none());
    }
}
