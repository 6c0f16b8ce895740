use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// A single procedure inside a product offer, e.g. "Shrink Universe 300 shots".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct IndividualTreatment {
    pub name: String,
    pub dosage: Option<f64>,
    pub unit: Option<String>,
    #[serde(default)]
    pub equipments: Vec<String>,
    #[serde(default)]
    pub medications: Vec<String>,
    #[serde(default)]
    pub target_area: Vec<String>,
    pub description: Option<String>,
}

/// One priced offer as listed by a clinic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TreatmentProduct {
    pub id: String,
    pub site_id: String,
    pub clinic_name: String,
    pub source_url: String,
    pub product_name: String,
    pub category: Option<String>,
    pub original_price: Option<Decimal>,
    pub event_price: Option<Decimal>,
    pub description: Option<String>,
    #[serde(default)]
    pub treatments: Vec<IndividualTreatment>,
    /// Acquisition step whose snapshot produced this record.
    pub captured_at_step: u32,
    pub scraped_at: DateTime<Utc>,
}

impl TreatmentProduct {
    /// Lowest advertised price, preferring the event price.
    pub fn effective_price(&self) -> Option<Decimal> {
        match (self.event_price, self.original_price) {
            (Some(event), Some(original)) => Some(event.min(original)),
            (Some(event), None) => Some(event),
            (None, original) => original,
        }
    }
}

/// Parse a price the way clinics print them: "150,000원", "₩99,000", 99000.
pub fn parse_price_value(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::Number(n) => {
            let price = Decimal::from_str(&n.to_string()).ok()?;
            (price > Decimal::ZERO).then_some(price)
        }
        serde_json::Value::String(s) => {
            let digits: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            let digits = digits.trim_matches('.');
            if digits.is_empty() {
                return None;
            }
            let price = Decimal::from_str(digits).ok()?;
            (price > Decimal::ZERO).then_some(price)
        }
        _ => None,
    }
}
