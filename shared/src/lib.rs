use serde::{Deserialize, Serialize};

pub mod money;
mod status;

pub use money::{line_total, parse_price, PriceError, MONEY_SCALE, TOTAL_CEILING};
pub use status::{ContactStatus, ModerationStatus, OrderStatus, Role, UnknownVariant};

/// Province assigned to listings that do not name one.
pub const DEFAULT_PROVINCE: &str = "Haut-Katanga";

pub const COMMUNES: &[&str] = &[
    "Annexe",
    "Lubumbashi",
    "Kenya",
    "Katuba",
    "Kamalondo",
    "Kampemba",
    "Ruashi",
];

pub const CATEGORIES: &[&str] = &[
    "Maraîchage",
    "Céréales",
    "Légumineuses",
    "Tubercules",
    "Élevage",
    "Fruits",
];

/// Catalog query. Every filter is independent; `approved: None` leaves the
/// approval flag unrestricted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductFilters {
    pub category: Option<String>,
    pub commune: Option<String>,
    pub province: Option<String>,
    pub search: Option<String>,
    pub approved: Option<bool>,
    pub active_only: bool,
}

impl ProductFilters {
    /// What anonymous visitors are allowed to see.
    pub fn public() -> Self {
        Self {
            approved: Some(true),
            active_only: true,
            ..Self::default()
        }
    }
}

/// A listing shows up publicly only once it is both active and approved.
pub fn is_publicly_visible(is_active: bool, is_approved: bool) -> bool {
    is_active && is_approved
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSummary {
    pub total_farmers: i64,
    pub total_products: i64,
    pub total_orders: i64,
    pub total_communes: i64,
}

/// A mutation queued by a client while offline, replayed through the sync
/// endpoint once connectivity returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCommand {
    pub idempotency_key: String,
    pub kind: SyncKind,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncKind {
    CreateProduct,
    PlaceOrder,
    AddContact,
}

impl SyncKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncKind::CreateProduct => "createProduct",
            SyncKind::PlaceOrder => "placeOrder",
            SyncKind::AddContact => "addContact",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReply {
    pub idempotency_key: String,
    pub status: SyncStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Executed for the first time in this batch.
    Applied,
    /// Already executed earlier; the stored result is returned.
    Replayed,
    Rejected,
}

impl SyncReply {
    pub fn applied(idempotency_key: String, result: serde_json::Value) -> Self {
        Self {
            idempotency_key,
            status: SyncStatus::Applied,
            result: Some(result),
            error: None,
        }
    }

    pub fn replayed(idempotency_key: String, result: Option<serde_json::Value>) -> Self {
        Self {
            idempotency_key,
            status: SyncStatus::Replayed,
            result,
            error: None,
        }
    }

    pub fn rejected(idempotency_key: String, error: String) -> Self {
        Self {
            idempotency_key,
            status: SyncStatus::Rejected,
            result: None,
            error: Some(error),
        }
    }
}
