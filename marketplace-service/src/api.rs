use axum::{
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, patch, post, put},
    Router,
};
use serde_json::{json, Value};
use shared::{Role, StatsSummary, SyncReply, CATEGORIES, COMMUNES};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::auth::{CurrentUser, TokenSigner};
use crate::catalog::Catalog;
use crate::error::{AppError, AppResult};
use crate::identity::{Identity, Session};
use crate::ledger::Ledger;
use crate::models::{AccountView, ContactView, FarmerSummary, OrderView, ProductView, PublicProfile, ReviewView};
use crate::moderation::Moderation;
use crate::orders::OrderEngine;
use crate::outbox::SyncProcessor;
use crate::requests::{
    AdminUserUpdate, ApiJson, ApiPath, CreateContactRequest, CreateProductRequest, CreateReviewRequest,
    LoginRequest, PlaceOrderRequest, ProductQuery, RegisterRequest, RejectProductRequest,
    SyncRequest, UpdateContactRequest, UpdateOrderRequest, UpdateProductRequest,
    UpdateProfileRequest,
};
use crate::stats;
use crate::uploads::{self, UploadConfig};
use crate::DbPool;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub tokens: TokenSigner,
    pub uploads: UploadConfig,
}

type Created<T> = (StatusCode, Json<T>);

pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/users/me", get(current_account).patch(update_account))
        .route("/products", get(list_products).post(create_product))
        .route(
            "/products/:id",
            get(product_detail).patch(update_product).delete(delete_product),
        )
        .route("/products/:id/reviews", get(product_reviews))
        .route("/farmer/:farmer_id/products", get(farmer_products))
        .route("/farmer/:farmer_id/orders", get(farmer_orders))
        .route("/farmer/:farmer_id/contacts", get(farmer_contacts))
        .route("/buyer/:buyer_id/orders", get(buyer_orders))
        .route("/orders", post(place_order))
        .route("/orders/:id", get(order_detail).patch(update_order))
        .route("/reviews", post(add_review))
        .route("/contacts", post(add_contact))
        .route("/contacts/:id", patch(update_contact))
        .route("/admin/products/pending", get(pending_products))
        .route("/admin/products/:id/approve", patch(approve_product))
        .route("/admin/products/:id/reject", patch(reject_product))
        .route("/admin/users", get(list_users))
        .route("/admin/users/:id", put(admin_update_user))
        .route("/stats", get(stats_summary))
        .route("/communes", get(communes))
        .route("/categories", get(categories))
        .route(
            "/uploads",
            post(upload_images).layer(DefaultBodyLimit::max(uploads::MAX_BODY_BYTES)),
        )
        .route("/sync", post(sync_commands));

    let static_files = ServeDir::new(&state.uploads.dir);

    Router::new()
        .nest("/api", api)
        .nest_service(uploads::PUBLIC_PREFIX, static_files)
        .route("/health", get(health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

pub async fn health_check() -> &'static str {
    "OK"
}

async fn register(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<RegisterRequest>,
) -> AppResult<Created<Session>> {
    let registration = request.validate()?;
    let session = Identity::new(state.pool, state.tokens)
        .register(registration)
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn login(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<LoginRequest>,
) -> AppResult<Json<Session>> {
    let session = Identity::new(state.pool, state.tokens).login(request).await?;
    Ok(Json(session))
}

async fn current_account(State(state): State<AppState>, user: CurrentUser) -> AppResult<Json<AccountView>> {
    let account = Identity::new(state.pool, state.tokens).find(user.id).await?;
    Ok(Json(account))
}

async fn update_account(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiJson(request): ApiJson<UpdateProfileRequest>,
) -> AppResult<Json<AccountView>> {
    let patch = request.validate()?;
    let account = Identity::new(state.pool, state.tokens)
        .update_profile(user.id, patch)
        .await?;
    Ok(Json(account))
}

async fn list_products(
    State(state): State<AppState>,
    viewer: Option<CurrentUser>,
    Query(query): Query<ProductQuery>,
) -> AppResult<Json<Vec<ProductView<FarmerSummary>>>> {
    let (filters, needs_admin) = query.into_filters()?;
    if needs_admin {
        viewer
            .ok_or(AppError::Unauthenticated)?
            .require_any(&[Role::Admin])?;
    }
    let listings = Catalog::new(state.pool).list(filters).await?;
    Ok(Json(listings))
}

async fn create_product(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiJson(request): ApiJson<CreateProductRequest>,
) -> AppResult<Created<ProductView<FarmerSummary>>> {
    user.require_any(&[Role::Farmer, Role::Admin])?;
    let draft = request.validate()?;
    let product = Catalog::new(state.pool).create(&user, draft).await?;
    Ok((StatusCode::CREATED, Json(product)))
}

async fn product_detail(
    State(state): State<AppState>,
    viewer: Option<CurrentUser>,
    ApiPath(id): ApiPath<i32>,
) -> AppResult<Json<ProductView<PublicProfile>>> {
    let product = Catalog::new(state.pool).get(id, viewer.as_ref()).await?;
    Ok(Json(product))
}

async fn update_product(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(id): ApiPath<i32>,
    ApiJson(request): ApiJson<UpdateProductRequest>,
) -> AppResult<Json<ProductView<FarmerSummary>>> {
    let patch = request.validate()?;
    let product = Catalog::new(state.pool).update(id, &user, patch).await?;
    Ok(Json(product))
}

async fn delete_product(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(id): ApiPath<i32>,
) -> AppResult<StatusCode> {
    Catalog::new(state.pool).delete(id, &user).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn product_reviews(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i32>,
) -> AppResult<Json<Vec<ReviewView>>> {
    let reviews = Ledger::new(state.pool).list_reviews_for_product(id).await?;
    Ok(Json(reviews))
}

async fn farmer_products(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(farmer_id): ApiPath<i32>,
) -> AppResult<Json<Vec<ProductView<FarmerSummary>>>> {
    let listings = Catalog::new(state.pool).list_by_farmer(farmer_id, &user).await?;
    Ok(Json(listings))
}

async fn farmer_orders(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(farmer_id): ApiPath<i32>,
) -> AppResult<Json<Vec<OrderView>>> {
    let orders = OrderEngine::new(state.pool).list_by_farmer(farmer_id, &user).await?;
    Ok(Json(orders))
}

async fn buyer_orders(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(buyer_id): ApiPath<i32>,
) -> AppResult<Json<Vec<OrderView>>> {
    let orders = OrderEngine::new(state.pool).list_by_buyer(buyer_id, &user).await?;
    Ok(Json(orders))
}

async fn farmer_contacts(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(farmer_id): ApiPath<i32>,
) -> AppResult<Json<Vec<ContactView>>> {
    let contacts = Ledger::new(state.pool)
        .list_contacts_for_farmer(farmer_id, &user)
        .await?;
    Ok(Json(contacts))
}

async fn place_order(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiJson(request): ApiJson<PlaceOrderRequest>,
) -> AppResult<Created<OrderView>> {
    let draft = request.validate()?;
    let order = OrderEngine::new(state.pool).place(&user, draft).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

async fn order_detail(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(id): ApiPath<i32>,
) -> AppResult<Json<OrderView>> {
    let order = OrderEngine::new(state.pool).get(id, &user).await?;
    Ok(Json(order))
}

async fn update_order(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(id): ApiPath<i32>,
    ApiJson(request): ApiJson<UpdateOrderRequest>,
) -> AppResult<Json<OrderView>> {
    let patch = request.validate()?;
    let order = OrderEngine::new(state.pool).update_status(id, &user, patch).await?;
    Ok(Json(order))
}

async fn add_review(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiJson(request): ApiJson<CreateReviewRequest>,
) -> AppResult<Created<ReviewView>> {
    let draft = request.validate()?;
    let review = Ledger::new(state.pool).add_review(&user, draft).await?;
    Ok((StatusCode::CREATED, Json(review)))
}

async fn add_contact(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiJson(request): ApiJson<CreateContactRequest>,
) -> AppResult<Created<ContactView>> {
    let draft = request.validate()?;
    let contact = Ledger::new(state.pool).add_contact(&user, draft).await?;
    Ok((StatusCode::CREATED, Json(contact)))
}

async fn update_contact(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(id): ApiPath<i32>,
    ApiJson(request): ApiJson<UpdateContactRequest>,
) -> AppResult<Json<ContactView>> {
    let contact = Ledger::new(state.pool)
        .update_contact_status(id, &user, request.status)
        .await?;
    Ok(Json(contact))
}

async fn pending_products(
    State(state): State<AppState>,
    user: CurrentUser,
) -> AppResult<Json<Vec<ProductView<FarmerSummary>>>> {
    user.require_any(&[Role::Admin])?;
    let queue = Moderation::new(state.pool).pending_queue().await?;
    Ok(Json(queue))
}

async fn approve_product(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(id): ApiPath<i32>,
) -> AppResult<Json<ProductView<FarmerSummary>>> {
    user.require_any(&[Role::Admin])?;
    let product = Moderation::new(state.pool).approve(id).await?;
    Ok(Json(product))
}

async fn reject_product(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(id): ApiPath<i32>,
    ApiJson(request): ApiJson<RejectProductRequest>,
) -> AppResult<Json<ProductView<FarmerSummary>>> {
    user.require_any(&[Role::Admin])?;
    let reason = request.validate()?;
    let product = Moderation::new(state.pool).reject(id, reason).await?;
    Ok(Json(product))
}

async fn list_users(State(state): State<AppState>, user: CurrentUser) -> AppResult<Json<Vec<AccountView>>> {
    user.require_any(&[Role::Admin])?;
    let users = Identity::new(state.pool, state.tokens).list_all().await?;
    Ok(Json(users))
}

async fn admin_update_user(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiPath(id): ApiPath<i32>,
    ApiJson(request): ApiJson<AdminUserUpdate>,
) -> AppResult<Json<AccountView>> {
    user.require_any(&[Role::Admin])?;
    let update = request.validate()?;
    let account = Identity::new(state.pool, state.tokens)
        .admin_update(id, update)
        .await?;
    Ok(Json(account))
}

async fn stats_summary(State(state): State<AppState>) -> AppResult<Json<StatsSummary>> {
    Ok(Json(stats::summary(&state.pool).await?))
}

async fn communes() -> Json<&'static [&'static str]> {
    Json(COMMUNES)
}

async fn categories() -> Json<&'static [&'static str]> {
    Json(CATEGORIES)
}

async fn upload_images(
    State(state): State<AppState>,
    _user: CurrentUser,
    multipart: Result<Multipart, MultipartRejection>,
) -> AppResult<Json<Value>> {
    let multipart = multipart.map_err(|e| AppError::validation(uploads::FIELD_NAME, e.body_text()))?;
    let images = uploads::collect_images(multipart).await?;
    let urls = uploads::store_images(&state.uploads, images).await?;
    Ok(Json(json!({ "success": true, "urls": urls })))
}

async fn sync_commands(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiJson(request): ApiJson<SyncRequest>,
) -> AppResult<Json<Value>> {
    let results: Vec<SyncReply> = SyncProcessor::new(state.pool)
        .process(&user, request.commands)
        .await?;
    Ok(Json(json!({ "results": results })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::login_ttl;
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use chrono::{Duration, Utc};
    use diesel_async::pooled_connection::{bb8::Pool, AsyncDieselConnectionManager};
    use diesel_async::AsyncPgConnection;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const SECRET: &str = "router-test-secret";

    /// A router whose pool never connects. Every request here must be
    /// answered before a store touches the database.
    fn app() -> Router {
        let manager =
            AsyncDieselConnectionManager::<AsyncPgConnection>::new("postgres://nobody@127.0.0.1:1/none");
        let pool = Pool::builder().build_unchecked(manager);
        create_router(AppState {
            pool,
            tokens: TokenSigner::new(SECRET),
            uploads: UploadConfig::new(std::env::temp_dir().join("agri-router-tests")),
        })
    }

    fn token(id: i32, role: Role) -> String {
        TokenSigner::new(SECRET)
            .issue(id, &format!("user{id}@x.cd"), role, login_ttl())
            .unwrap()
    }

    fn request(method: Method, uri: &str, bearer: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(request: Request<Body>) -> (StatusCode, Value) {
        let response = app().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn product_body() -> Value {
        json!({
            "name": "Maïs blanc",
            "category": "Céréales",
            "price": "1500.00",
            "unit": "sac",
            "quantity": 10,
            "harvestDate": "2025-02-01",
            "commune": "Katuba"
        })
    }

    #[tokio::test]
    async fn health_check_answers() {
        let response = app()
            .oneshot(request(Method::GET, "/health", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"OK");
    }

    #[tokio::test]
    async fn static_lists_are_public() {
        let (status, body) = send(request(Method::GET, "/api/communes", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 7);
        assert_eq!(body[0], "Annexe");

        let (status, body) = send(request(Method::GET, "/api/categories", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_array().unwrap().contains(&json!("Fruits")));
    }

    #[tokio::test]
    async fn mutations_require_a_token() {
        let (status, body) = send(request(Method::POST, "/api/products", None, Some(product_body()))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "authentication required");

        let (status, _) = send(request(
            Method::POST,
            "/api/orders",
            None,
            Some(json!({"productId": 1, "quantity": 1})),
        ))
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn bad_or_expired_tokens_are_invalid_sessions() {
        let (status, body) = send(request(
            Method::POST,
            "/api/products",
            Some("not.a.token"),
            Some(product_body()),
        ))
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "session expired or invalid");

        let expired = TokenSigner::new(SECRET)
            .issue_at(
                4,
                "old@x.cd",
                Role::Farmer,
                Utc::now() - Duration::days(31),
                login_ttl(),
            )
            .unwrap();
        let (status, _) = send(request(
            Method::POST,
            "/api/products",
            Some(&expired),
            Some(product_body()),
        ))
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn buyers_cannot_sell_or_moderate() {
        let buyer = token(5, Role::Buyer);
        let (status, _) = send(request(
            Method::POST,
            "/api/products",
            Some(&buyer),
            Some(product_body()),
        ))
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = send(request(
            Method::PATCH,
            "/api/admin/products/1/approve",
            Some(&buyer),
            None,
        ))
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = send(request(Method::GET, "/api/admin/users", Some(&buyer), None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn farmers_cannot_moderate() {
        let farmer = token(3, Role::Farmer);
        let (status, _) = send(request(
            Method::PATCH,
            "/api/admin/products/1/reject",
            Some(&farmer),
            Some(json!({"reason": "doublon"})),
        ))
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn moderation_listing_needs_admin() {
        let (status, _) = send(request(Method::GET, "/api/products?approved=false", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let buyer = token(5, Role::Buyer);
        let (status, _) = send(request(
            Method::GET,
            "/api/products?approved=all",
            Some(&buyer),
            None,
        ))
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = send(request(Method::GET, "/api/products?approved=maybe", None, None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["issues"][0]["field"], "approved");
    }

    #[tokio::test]
    async fn order_history_is_private() {
        let other = token(6, Role::Buyer);
        let (status, _) = send(request(Method::GET, "/api/buyer/5/orders", Some(&other), None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = send(request(Method::GET, "/api/farmer/3/contacts", Some(&other), None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn registration_validates_before_storing() {
        let (status, body) = send(request(
            Method::POST,
            "/api/register",
            None,
            Some(json!({
                "username": "root",
                "email": "root@x.cd",
                "password": "secret-pw",
                "firstName": "R",
                "lastName": "T",
                "role": "admin"
            })),
        ))
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["issues"][0]["field"], "role");
    }

    #[tokio::test]
    async fn non_numeric_ids_are_validation_errors() {
        let (status, body) = send(request(Method::GET, "/api/products/tomates", None, None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "validation failed");
        assert_eq!(body["issues"][0]["field"], "path");

        let buyer = token(8, Role::Buyer);
        let (status, body) = send(request(
            Method::PATCH,
            "/api/orders/first",
            Some(&buyer),
            Some(json!({"status": "cancelled"})),
        ))
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["issues"][0]["field"], "path");
    }

    #[tokio::test]
    async fn empty_product_edit_is_refused() {
        let farmer = token(3, Role::Farmer);
        let (status, body) = send(request(Method::PATCH, "/api/products/12", Some(&farmer), Some(json!({})))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["issues"][0]["field"], "body");
    }

    #[tokio::test]
    async fn malformed_json_is_a_validation_error() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/login")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{\"email\": "))
            .unwrap();
        let (status, body) = send(request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["issues"][0]["field"], "body");
    }

    #[tokio::test]
    async fn invalid_order_body_is_rejected() {
        let buyer = token(5, Role::Buyer);
        let (status, body) = send(request(
            Method::POST,
            "/api/orders",
            Some(&buyer),
            Some(json!({"productId": 1, "quantity": 0})),
        ))
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["issues"][0]["field"], "quantity");
    }

    #[tokio::test]
    async fn uploads_require_a_token() {
        let (status, _) = send(request(Method::POST, "/api/uploads", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn oversized_sync_batches_are_refused() {
        let buyer = token(5, Role::Buyer);
        let commands: Vec<Value> = (0..51)
            .map(|i| {
                json!({
                    "idempotencyKey": format!("k-{i}"),
                    "kind": "placeOrder",
                    "payload": {"productId": 1, "quantity": 1}
                })
            })
            .collect();
        let (status, body) = send(request(
            Method::POST,
            "/api/sync",
            Some(&buyer),
            Some(json!({ "commands": commands })),
        ))
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["issues"][0]["field"], "commands");
    }
}
