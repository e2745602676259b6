use crate::store::ExternalId;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FulfillmentStatus {
    Unfulfilled,
}

impl FulfillmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FulfillmentStatus::Unfulfilled => "unfulfilled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderFilter {
    pub status: FulfillmentStatus,
    pub created_after: DateTime<Utc>,
}

impl OrderFilter {
    pub fn unfulfilled_since(created_after: DateTime<Utc>) -> Self {
        Self {
            status: FulfillmentStatus::Unfulfilled,
            created_after,
        }
    }

    /// `status=any` so open and closed orders are both scanned; the
    /// fulfillment filter does the real narrowing.
    pub(crate) fn query(&self) -> Vec<(&'static str, String)> {
        vec![
            ("status", "any".to_string()),
            ("fulfillment_status", self.status.as_str().to_string()),
            (
                "created_at_min",
                self.created_after.to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            ("fields", "id,line_items".to_string()),
            ("limit", "250".to_string()),
        ]
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Order {
    pub id: u64,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
}

impl Order {
    /// Custom line items carry no product id and are skipped.
    pub fn product_ids(&self) -> Vec<ExternalId> {
        self.line_items
            .iter()
            .filter_map(|item| item.product_id)
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LineItem {
    #[serde(default)]
    pub product_id: Option<ExternalId>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OrdersResponse {
    #[serde(default)]
    pub orders: Vec<Order>,
}

/// Extracts the `rel="next"` target from a `Link` pagination header.
pub(crate) fn next_page_url(link_header: &str) -> Option<String> {
    link_header.split(',').find_map(|part| {
        let mut pieces = part.split(';');
        let target = pieces.next()?.trim();
        let is_next = pieces.any(|attr| {
            let attr = attr.trim();
            attr == "rel=\"next\"" || attr == "rel=next"
        });
        if !is_next {
            return None;
        }
        target
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .map(str::to_string)
    })
}
