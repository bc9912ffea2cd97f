//! Request bodies and their validation. Every `validate` collects all field
//! issues before failing so the client can correct the whole form at once.

use axum::{
    async_trait,
    extract::{FromRequest, FromRequestParts, Path, Request},
    http::request::Parts,
    Json,
};
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use shared::{parse_price, ContactStatus, OrderStatus, ProductFilters, Role, SyncCommand, DEFAULT_PROVINCE};

use crate::error::{AppError, AppResult, FieldIssue};

pub const MAX_IMAGES: usize = 5;

/// JSON body extractor whose rejection is a structured validation error.
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(AppError::validation("body", rejection.body_text())),
        }
    }
}

/// Path extractor whose rejection is a structured validation error.
pub struct ApiPath<T>(pub T);

#[async_trait]
impl<T, S> FromRequestParts<S> for ApiPath<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Path::<T>::from_request_parts(parts, state).await {
            Ok(Path(value)) => Ok(ApiPath(value)),
            Err(rejection) => Err(AppError::validation("path", rejection.body_text())),
        }
    }
}

#[derive(Default)]
struct Issues(Vec<FieldIssue>);

impl Issues {
    fn push(&mut self, field: &str, message: impl Into<String>) {
        self.0.push(FieldIssue::new(field, message));
    }

    /// Required text: trimmed, non-empty, at most `max` characters.
    fn required(&mut self, field: &str, value: &str, max: usize) -> String {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            self.push(field, "is required");
        } else if trimmed.chars().count() > max {
            self.push(field, format!("must be at most {} characters", max));
        }
        trimmed.to_string()
    }

    /// Optional text: blank becomes `None`.
    fn optional(&mut self, field: &str, value: Option<&str>, max: usize) -> Option<String> {
        let trimmed = value.map(str::trim).filter(|v| !v.is_empty())?;
        if trimmed.chars().count() > max {
            self.push(field, format!("must be at most {} characters", max));
        }
        Some(trimmed.to_string())
    }

    /// Patch of a nullable column: absent keeps the value, blank clears it.
    fn clearable(&mut self, field: &str, value: Option<&str>, max: usize) -> Option<Option<String>> {
        let value = value?;
        Some(self.optional(field, Some(value), max))
    }

    /// Present-but-blank is an error for patch fields that are required on
    /// the record.
    fn patch_required(&mut self, field: &str, value: Option<&str>, max: usize) -> Option<String> {
        value.map(|v| self.required(field, v, max))
    }

    fn email(&mut self, field: &str, value: &str) -> String {
        let email = value.trim().to_lowercase();
        let valid = match email.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty()
                    && domain.contains('.')
                    && !domain.starts_with('.')
                    && !domain.ends_with('.')
                    && !domain.contains('@')
                    && !email.contains(char::is_whitespace)
            }
            None => false,
        };
        if !valid {
            self.push(field, "must be a valid email address");
        } else if email.len() > 255 {
            self.push(field, "must be at most 255 characters");
        }
        email
    }

    fn username(&mut self, field: &str, value: &str) -> String {
        let username = value.trim().to_string();
        let length = username.chars().count();
        if !(3..=100).contains(&length) {
            self.push(field, "must be between 3 and 100 characters");
        } else if !username
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            self.push(field, "may only contain letters, digits, '_', '-' and '.'");
        }
        username
    }

    fn price(&mut self, field: &str, value: &str) -> Option<BigDecimal> {
        match parse_price(value) {
            Ok(price) => Some(price),
            Err(err) => {
                self.push(field, err.to_string());
                None
            }
        }
    }

    fn harvest_date(&mut self, field: &str, value: &str) -> Option<NaiveDate> {
        let parsed = parse_harvest_date(value);
        if parsed.is_none() {
            self.push(field, "must be a date (YYYY-MM-DD or RFC 3339)");
        }
        parsed
    }

    fn images(&mut self, field: &str, images: Option<&[String]>) -> Option<Vec<String>> {
        let images = images?;
        if images.len() > MAX_IMAGES {
            self.push(field, format!("at most {} images are allowed", MAX_IMAGES));
        }
        if images.iter().any(|url| url.trim().is_empty() || url.len() > 500) {
            self.push(field, "image URLs must be non-empty and at most 500 characters");
        }
        Some(images.iter().map(|url| url.trim().to_string()).collect())
    }

    fn finish(self) -> AppResult<()> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(AppError::Validation(self.0))
        }
    }
}

pub fn parse_harvest_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok().or_else(|| {
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|moment| moment.date_naive())
    })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
    #[serde(alias = "userType")]
    pub role: Option<String>,
    pub location: Option<String>,
}

/// A registration that passed validation.
#[derive(Debug, Clone)]
pub struct Registration {
    pub username: String,
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
    pub role: Role,
    pub location: Option<String>,
}

impl RegisterRequest {
    pub fn validate(self) -> AppResult<Registration> {
        let mut issues = Issues::default();
        let username = issues.username("username", &self.username);
        let email = issues.email("email", &self.email);
        let length = self.password.chars().count();
        if !(6..=128).contains(&length) {
            issues.push("password", "must be between 6 and 128 characters");
        }
        let first_name = issues.required("firstName", &self.first_name, 100);
        let last_name = issues.required("lastName", &self.last_name, 100);
        let phone = issues.optional("phone", self.phone.as_deref(), 20);
        let location = issues.optional("location", self.location.as_deref(), 255);
        let role = match self.role.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
            None => Role::Buyer,
            Some(raw) => match raw.parse::<Role>() {
                Ok(Role::Admin) => {
                    issues.push("role", "admin accounts cannot be self-registered");
                    Role::Admin
                }
                Ok(role) => role,
                Err(_) => {
                    issues.push("role", "must be `farmer` or `buyer`");
                    Role::Buyer
                }
            },
        };
        issues.finish()?;

        Ok(Registration {
            username,
            email,
            password: self.password,
            first_name,
            last_name,
            phone,
            role,
            location,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

impl LoginRequest {
    pub fn normalized_email(&self) -> String {
        self.email.trim().to_lowercase()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProfileRequest {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub location: Option<String>,
    pub profile_image: Option<String>,
}

/// `Some(None)` clears a nullable column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfilePatch {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<Option<String>>,
    pub location: Option<Option<String>>,
    pub profile_image: Option<Option<String>>,
}

impl UpdateProfileRequest {
    pub fn validate(self) -> AppResult<ProfilePatch> {
        let mut issues = Issues::default();
        let patch = ProfilePatch {
            first_name: issues.patch_required("firstName", self.first_name.as_deref(), 100),
            last_name: issues.patch_required("lastName", self.last_name.as_deref(), 100),
            phone: issues.clearable("phone", self.phone.as_deref(), 20),
            location: issues.clearable("location", self.location.as_deref(), 255),
            profile_image: issues.clearable("profileImage", self.profile_image.as_deref(), 500),
        };
        issues.finish()?;
        Ok(patch)
    }
}

/// Arbitrary field update performed by an admin.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminUserUpdate {
    pub username: Option<String>,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    #[serde(alias = "userType")]
    pub role: Option<Role>,
    pub location: Option<String>,
    pub profile_image: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountPatch {
    pub username: Option<String>,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<Option<String>>,
    pub role: Option<Role>,
    pub location: Option<Option<String>>,
    pub profile_image: Option<Option<String>>,
    pub is_active: Option<bool>,
}

impl AdminUserUpdate {
    pub fn validate(self) -> AppResult<AccountPatch> {
        let mut issues = Issues::default();
        let username = self.username.as_deref().map(|u| issues.username("username", u));
        let email = self.email.as_deref().map(|e| issues.email("email", e));
        let validated = AccountPatch {
            username,
            email,
            first_name: issues.patch_required("firstName", self.first_name.as_deref(), 100),
            last_name: issues.patch_required("lastName", self.last_name.as_deref(), 100),
            phone: issues.clearable("phone", self.phone.as_deref(), 20),
            role: self.role,
            location: issues.clearable("location", self.location.as_deref(), 255),
            profile_image: issues.clearable("profileImage", self.profile_image.as_deref(), 500),
            is_active: self.is_active,
        };
        issues.finish()?;
        Ok(validated)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProductRequest {
    #[serde(default)]
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub quantity: i32,
    #[serde(default)]
    pub harvest_date: String,
    #[serde(default)]
    pub commune: String,
    pub location: Option<String>,
    pub province: Option<String>,
    pub images: Option<Vec<String>>,
    pub is_active: Option<bool>,
}

/// A listing that passed validation, ready to be stored for some farmer.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductDraft {
    pub name: String,
    pub description: Option<String>,
    pub category: String,
    pub price: BigDecimal,
    pub unit: String,
    pub quantity: i32,
    pub harvest_date: NaiveDate,
    pub commune: String,
    pub location: Option<String>,
    pub province: String,
    pub images: Vec<String>,
    pub is_active: bool,
}

impl CreateProductRequest {
    pub fn validate(self) -> AppResult<ProductDraft> {
        let mut issues = Issues::default();
        let name = issues.required("name", &self.name, 255);
        let description = issues.optional("description", self.description.as_deref(), 5000);
        let category = issues.required("category", &self.category, 100);
        let price = issues.price("price", &self.price);
        let unit = issues.required("unit", &self.unit, 50);
        if self.quantity < 1 {
            issues.push("quantity", "must be at least 1");
        }
        let harvest_date = issues.harvest_date("harvestDate", &self.harvest_date);
        let commune = issues.required("commune", &self.commune, 100);
        let location = issues.optional("location", self.location.as_deref(), 255);
        let province = issues
            .optional("province", self.province.as_deref(), 100)
            .unwrap_or_else(|| DEFAULT_PROVINCE.to_string());
        let images = issues
            .images("images", self.images.as_deref())
            .unwrap_or_default();
        issues.finish()?;

        match (price, harvest_date) {
            (Some(price), Some(harvest_date)) => Ok(ProductDraft {
                name,
                description,
                category,
                price,
                unit,
                quantity: self.quantity,
                harvest_date,
                commune,
                location,
                province,
                images,
                is_active: self.is_active.unwrap_or(true),
            }),
            _ => Err(AppError::validation("body", "invalid product")),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProductRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub price: Option<String>,
    pub unit: Option<String>,
    pub quantity: Option<i32>,
    pub available_quantity: Option<i32>,
    pub harvest_date: Option<String>,
    pub commune: Option<String>,
    pub location: Option<String>,
    pub province: Option<String>,
    pub images: Option<Vec<String>>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProductPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub category: Option<String>,
    pub price: Option<BigDecimal>,
    pub unit: Option<String>,
    pub quantity: Option<i32>,
    pub available_quantity: Option<i32>,
    pub harvest_date: Option<NaiveDate>,
    pub commune: Option<String>,
    pub location: Option<Option<String>>,
    pub province: Option<String>,
    pub images: Option<Vec<String>>,
    pub is_active: Option<bool>,
}

impl ProductPatch {
    /// Whether the listing's content changes, as opposed to only its
    /// visibility toggle.
    pub fn touches_listing(&self) -> bool {
        let visibility_only = ProductPatch {
            is_active: self.is_active,
            ..ProductPatch::default()
        };
        *self != visibility_only
    }

    pub fn is_empty(&self) -> bool {
        *self == ProductPatch::default()
    }
}

impl UpdateProductRequest {
    pub fn validate(self) -> AppResult<ProductPatch> {
        let mut issues = Issues::default();
        if matches!(self.quantity, Some(q) if q < 1) {
            issues.push("quantity", "must be at least 1");
        }
        if matches!(self.available_quantity, Some(a) if a < 0) {
            issues.push("availableQuantity", "must not be negative");
        }
        if let (Some(quantity), Some(available)) = (self.quantity, self.available_quantity) {
            if available > quantity {
                issues.push("availableQuantity", "must not exceed quantity");
            }
        }
        let patch = ProductPatch {
            name: issues.patch_required("name", self.name.as_deref(), 255),
            description: issues.clearable("description", self.description.as_deref(), 5000),
            category: issues.patch_required("category", self.category.as_deref(), 100),
            price: self.price.as_deref().and_then(|p| issues.price("price", p)),
            unit: issues.patch_required("unit", self.unit.as_deref(), 50),
            quantity: self.quantity,
            available_quantity: self.available_quantity,
            harvest_date: self
                .harvest_date
                .as_deref()
                .and_then(|d| issues.harvest_date("harvestDate", d)),
            commune: issues.patch_required("commune", self.commune.as_deref(), 100),
            location: issues.clearable("location", self.location.as_deref(), 255),
            province: issues.patch_required("province", self.province.as_deref(), 100),
            images: issues.images("images", self.images.as_deref()),
            is_active: self.is_active,
        };
        if patch.is_empty() {
            issues.push("body", "nothing to update");
        }
        issues.finish()?;
        Ok(patch)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RejectProductRequest {
    #[serde(default)]
    pub reason: String,
}

impl RejectProductRequest {
    pub fn validate(self) -> AppResult<String> {
        let mut issues = Issues::default();
        let reason = issues.required("reason", &self.reason, 500);
        issues.finish()?;
        Ok(reason)
    }
}

/// Query string of `GET /api/products`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProductQuery {
    pub category: Option<String>,
    pub commune: Option<String>,
    pub province: Option<String>,
    pub search: Option<String>,
    pub approved: Option<String>,
}

impl ProductQuery {
    /// Returns the filters and whether they reach beyond the public listing.
    pub fn into_filters(self) -> AppResult<(ProductFilters, bool)> {
        let (approved, active_only, privileged) = match self.approved.as_deref().map(str::trim) {
            None | Some("") | Some("true") => (Some(true), true, false),
            Some("false") => (Some(false), false, true),
            Some("all") => (None, false, true),
            Some(_) => {
                return Err(AppError::validation(
                    "approved",
                    "must be `true`, `false` or `all`",
                ))
            }
        };
        let non_blank = |value: Option<String>| {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let filters = ProductFilters {
            category: non_blank(self.category),
            commune: non_blank(self.commune),
            province: non_blank(self.province),
            search: non_blank(self.search),
            approved,
            active_only,
        };
        Ok((filters, privileged))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderRequest {
    pub product_id: i32,
    pub quantity: i32,
    pub delivery_address: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderDraft {
    pub product_id: i32,
    pub quantity: i32,
    pub delivery_address: Option<String>,
    pub notes: Option<String>,
}

impl PlaceOrderRequest {
    pub fn validate(self) -> AppResult<OrderDraft> {
        let mut issues = Issues::default();
        if self.quantity < 1 {
            issues.push("quantity", "must be at least 1");
        }
        let delivery_address =
            issues.optional("deliveryAddress", self.delivery_address.as_deref(), 500);
        let notes = issues.optional("notes", self.notes.as_deref(), 2000);
        issues.finish()?;
        Ok(OrderDraft {
            product_id: self.product_id,
            quantity: self.quantity,
            delivery_address,
            notes,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOrderRequest {
    pub status: Option<OrderStatus>,
    pub delivery_address: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderPatch {
    pub status: Option<OrderStatus>,
    pub delivery_address: Option<String>,
    pub notes: Option<String>,
}

impl OrderPatch {
    pub fn touches_details(&self) -> bool {
        self.delivery_address.is_some() || self.notes.is_some()
    }
}

impl UpdateOrderRequest {
    pub fn validate(self) -> AppResult<OrderPatch> {
        let mut issues = Issues::default();
        let patch = OrderPatch {
            status: self.status,
            delivery_address: issues.optional(
                "deliveryAddress",
                self.delivery_address.as_deref(),
                500,
            ),
            notes: issues.optional("notes", self.notes.as_deref(), 2000),
        };
        if patch.status.is_none() && !patch.touches_details() {
            issues.push("body", "nothing to update");
        }
        issues.finish()?;
        Ok(patch)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReviewRequest {
    pub product_id: i32,
    pub rating: i32,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewDraft {
    pub product_id: i32,
    pub rating: i32,
    pub comment: Option<String>,
}

impl CreateReviewRequest {
    pub fn validate(self) -> AppResult<ReviewDraft> {
        let mut issues = Issues::default();
        if !(1..=5).contains(&self.rating) {
            issues.push("rating", "must be between 1 and 5");
        }
        let comment = issues.optional("comment", self.comment.as_deref(), 2000);
        issues.finish()?;
        Ok(ReviewDraft {
            product_id: self.product_id,
            rating: self.rating,
            comment,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateContactRequest {
    pub product_id: i32,
    #[serde(default)]
    pub message: String,
    pub buyer_phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactDraft {
    pub product_id: i32,
    pub message: String,
    pub buyer_phone: Option<String>,
}

impl CreateContactRequest {
    pub fn validate(self) -> AppResult<ContactDraft> {
        let mut issues = Issues::default();
        let message = issues.required("message", &self.message, 2000);
        let buyer_phone = issues.optional("buyerPhone", self.buyer_phone.as_deref(), 20);
        issues.finish()?;
        Ok(ContactDraft {
            product_id: self.product_id,
            message,
            buyer_phone,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateContactRequest {
    pub status: ContactStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncRequest {
    pub commands: Vec<SyncCommand>,
}
