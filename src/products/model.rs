use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Per-serving nutrient amounts. Calories in kcal, the rest in grams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Nutrition {
    #[serde(default)]
    pub calories: f64,
    #[serde(default)]
    pub protein: f64,
    #[serde(default)]
    pub fat: f64,
    #[serde(default)]
    pub carbs: f64,
    #[serde(default)]
    pub sugar: f64,
    #[serde(default)]
    pub fiber: f64,
}

impl Nutrition {
    fn fields(&self) -> [(&'static str, f64); 6] {
        [
            ("calories", self.calories),
            ("protein", self.protein),
            ("fat", self.fat),
            ("carbs", self.carbs),
            ("sugar", self.sugar),
            ("fiber", self.fiber),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductRecord {
    pub name: String,
    #[serde(default)]
    pub brand: String,
    #[serde(default)]
    pub nutrition: Nutrition,
    #[serde(default)]
    pub ingredients: String,
    #[serde(default)]
    pub allergens: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_score: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvalidRecord {
    #[error("nutrient {0} must be a non-negative number, got {1}")]
    Nutrient(&'static str, f64),

    #[error("health score {0} is outside 0..=100")]
    HealthScore(u8),

    #[error("product name is empty")]
    EmptyName,
}

impl ProductRecord {
    pub fn validate(&self) -> Result<(), InvalidRecord> {
        if self.name.trim().is_empty() {
            return Err(InvalidRecord::EmptyName);
        }
        for (name, value) in self.nutrition.fields() {
            if !value.is_finite() || value < 0.0 {
                return Err(InvalidRecord::Nutrient(name, value));
            }
        }
        match self.health_score {
            Some(score) if score > 100 => Err(InvalidRecord::HealthScore(score)),
            _ => Ok(()),
        }
    }
}
