use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use serde::Serialize;
use shared::{ContactStatus, ModerationStatus, OrderStatus, Role};

use crate::schema::{contacts, orders, processed_commands, products, reviews, users};

#[derive(Debug, Clone, Queryable, Selectable, Identifiable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: i32,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
    pub role: Role,
    pub location: Option<String>,
    pub profile_image: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
    pub role: Role,
    pub location: Option<String>,
}

#[derive(Debug, Clone, Default, AsChangeset)]
#[diesel(table_name = users)]
pub struct UserChanges {
    pub username: Option<String>,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<Option<String>>,
    pub role: Option<Role>,
    pub location: Option<Option<String>>,
    pub profile_image: Option<Option<String>>,
    pub is_active: Option<bool>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A user as returned to the account holder or an admin. Never carries the
/// password hash.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountView {
    pub id: i32,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
    pub role: Role,
    pub location: Option<String>,
    pub profile_image: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<User> for AccountView {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            email: user.email,
            first_name: user.first_name,
            last_name: user.last_name,
            phone: user.phone,
            role: user.role,
            location: user.location,
            profile_image: user.profile_image,
            is_active: user.is_active,
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }
}

/// What other parties may see of a user.
#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = users)]
#[serde(rename_all = "camelCase")]
pub struct PublicProfile {
    pub id: i32,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
    pub location: Option<String>,
    pub role: Role,
}

/// Shallow farmer card embedded in catalog listings.
#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = users)]
#[serde(rename_all = "camelCase")]
pub struct FarmerSummary {
    pub id: i32,
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = products)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: i32,
    pub farmer_id: i32,
    pub name: String,
    pub description: Option<String>,
    pub category: String,
    pub price: BigDecimal,
    pub unit: String,
    pub quantity: i32,
    pub available_quantity: i32,
    pub harvest_date: NaiveDate,
    pub commune: String,
    pub location: Option<String>,
    pub province: String,
    pub images: Vec<String>,
    pub is_active: bool,
    pub is_approved: bool,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    pub fn moderation_status(&self) -> ModerationStatus {
        ModerationStatus::derive(self.is_approved, self.rejection_reason.as_deref())
    }

    pub fn is_publicly_visible(&self) -> bool {
        shared::is_publicly_visible(self.is_active, self.is_approved)
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = products)]
pub struct NewProduct {
    pub farmer_id: i32,
    pub name: String,
    pub description: Option<String>,
    pub category: String,
    pub price: BigDecimal,
    pub unit: String,
    pub quantity: i32,
    pub available_quantity: i32,
    pub harvest_date: NaiveDate,
    pub commune: String,
    pub location: Option<String>,
    pub province: String,
    pub images: Vec<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Default, AsChangeset)]
#[diesel(table_name = products)]
pub struct ProductChanges {
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
    pub rejection_reason: Option<Option<String>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Compact product card embedded in orders and contacts.
#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = products)]
#[serde(rename_all = "camelCase")]
pub struct ProductSummary {
    pub id: i32,
    pub name: String,
    pub unit: String,
    pub price: BigDecimal,
    pub commune: String,
    pub images: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductView<F> {
    #[serde(flatten)]
    pub product: Product,
    pub moderation_status: ModerationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub farmer: Option<F>,
}

impl<F> ProductView<F> {
    pub fn new(product: Product, farmer: Option<F>) -> Self {
        Self {
            moderation_status: product.moderation_status(),
            product,
            farmer,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = orders)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: i32,
    pub buyer_id: i32,
    pub product_id: i32,
    pub farmer_id: i32,
    pub quantity: i32,
    pub total_price: BigDecimal,
    pub status: OrderStatus,
    pub delivery_address: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = orders)]
pub struct NewOrder {
    pub buyer_id: i32,
    pub product_id: i32,
    pub farmer_id: i32,
    pub quantity: i32,
    pub total_price: BigDecimal,
    pub status: OrderStatus,
    pub delivery_address: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, AsChangeset)]
#[diesel(table_name = orders)]
pub struct OrderChanges {
    pub status: Option<OrderStatus>,
    pub delivery_address: Option<String>,
    pub notes: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderView {
    #[serde(flatten)]
    pub order: Order,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<ProductSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buyer: Option<PublicProfile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub farmer: Option<PublicProfile>,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = reviews)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub id: i32,
    pub buyer_id: i32,
    pub product_id: i32,
    pub farmer_id: i32,
    pub rating: i32,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = reviews)]
pub struct NewReview {
    pub buyer_id: i32,
    pub product_id: i32,
    pub farmer_id: i32,
    pub rating: i32,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewView {
    #[serde(flatten)]
    pub review: Review,
    pub buyer: Option<PublicProfile>,
}

#[derive(Debug, Clone, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = contacts)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: i32,
    pub buyer_id: i32,
    pub product_id: i32,
    pub farmer_id: i32,
    pub message: String,
    pub buyer_phone: Option<String>,
    pub status: ContactStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = contacts)]
pub struct NewContact {
    pub buyer_id: i32,
    pub product_id: i32,
    pub farmer_id: i32,
    pub message: String,
    pub buyer_phone: Option<String>,
    pub status: ContactStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactView {
    #[serde(flatten)]
    pub contact: Contact,
    pub buyer: Option<PublicProfile>,
    pub product: Option<ProductSummary>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = processed_commands)]
pub struct ProcessedCommand {
    pub user_id: i32,
    pub idempotency_key: String,
    pub kind: String,
    pub result: Option<serde_json::Value>,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = processed_commands)]
pub struct NewProcessedCommand {
    pub user_id: i32,
    pub idempotency_key: String,
    pub kind: String,
}
