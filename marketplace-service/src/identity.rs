use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::Serialize;
use shared::Role;
use std::collections::HashMap;
use tracing::info;

use crate::auth::{self, login_ttl, registration_ttl, TokenSigner};
use crate::error::{map_user_conflict, AppError, AppResult};
use crate::models::{AccountView, NewUser, PublicProfile, User, UserChanges};
use crate::requests::{AccountPatch, LoginRequest, ProfilePatch, Registration};
use crate::schema::users;
use crate::DbPool;

/// Account plus a freshly issued bearer token.
#[derive(Debug, Serialize)]
pub struct Session {
    pub user: AccountView,
    pub token: String,
}

pub struct Identity {
    pool: DbPool,
    tokens: TokenSigner,
}

impl Identity {
    pub fn new(pool: DbPool, tokens: TokenSigner) -> Self {
        Self { pool, tokens }
    }

    pub async fn register(&self, registration: Registration) -> AppResult<Session> {
        if registration.role == Role::Admin {
            return Err(AppError::validation(
                "role",
                "admin accounts cannot be self-registered",
            ));
        }
        let user = self.create_account(registration).await?;
        let token = self
            .tokens
            .issue(user.id, &user.email, user.role, registration_ttl())?;
        info!("Registered {} account {} ({})", user.role, user.id, user.username);

        Ok(Session {
            user: user.into(),
            token,
        })
    }

    /// Bootstraps an administrator. Only reachable from the command line.
    pub async fn create_admin(&self, mut registration: Registration) -> AppResult<AccountView> {
        registration.role = Role::Admin;
        let user = self.create_account(registration).await?;
        info!("Created admin account {} ({})", user.id, user.username);
        Ok(user.into())
    }

    pub async fn login(&self, request: LoginRequest) -> AppResult<Session> {
        let email = request.normalized_email();
        let mut conn = self.pool.get().await?;
        let user = users::table
            .filter(users::email.eq(&email))
            .select(User::as_select())
            .first(&mut conn)
            .await
            .optional()?
            .ok_or(AppError::InvalidCredentials)?;
        drop(conn);

        let hash = user.password_hash.clone();
        let password = request.password;
        let matches = tokio::task::spawn_blocking(move || auth::verify_password(&hash, &password))
            .await
            .map_err(|e| AppError::Internal(e.into()))?;
        if !matches {
            return Err(AppError::InvalidCredentials);
        }
        if !user.is_active {
            return Err(AppError::AccountDisabled);
        }

        let token = self
            .tokens
            .issue(user.id, &user.email, user.role, login_ttl())?;
        Ok(Session {
            user: user.into(),
            token,
        })
    }

    pub async fn find(&self, user_id: i32) -> AppResult<AccountView> {
        let mut conn = self.pool.get().await?;
        let user = users::table
            .find(user_id)
            .select(User::as_select())
            .first(&mut conn)
            .await
            .optional()?
            .ok_or(AppError::NotFound("user"))?;
        Ok(user.into())
    }

    pub async fn update_profile(&self, user_id: i32, patch: ProfilePatch) -> AppResult<AccountView> {
        let changes = UserChanges {
            first_name: patch.first_name,
            last_name: patch.last_name,
            phone: patch.phone,
            location: patch.location,
            profile_image: patch.profile_image,
            updated_at: Some(Utc::now()),
            ..UserChanges::default()
        };
        let mut conn = self.pool.get().await?;
        apply_changes(&mut conn, user_id, changes).await
    }

    pub async fn admin_update(&self, user_id: i32, update: AccountPatch) -> AppResult<AccountView> {
        let changes = UserChanges {
            username: update.username,
            email: update.email,
            first_name: update.first_name,
            last_name: update.last_name,
            phone: update.phone,
            role: update.role,
            location: update.location,
            profile_image: update.profile_image,
            is_active: update.is_active,
            updated_at: Some(Utc::now()),
        };
        let mut conn = self.pool.get().await?;
        let account = apply_changes(&mut conn, user_id, changes).await?;
        info!(
            "Admin updated user {} (role {}, active {})",
            account.id, account.role, account.is_active
        );
        Ok(account)
    }

    pub async fn list_all(&self) -> AppResult<Vec<AccountView>> {
        let mut conn = self.pool.get().await?;
        let all = users::table
            .order(users::created_at.desc())
            .select(User::as_select())
            .load(&mut conn)
            .await?;
        Ok(all.into_iter().map(AccountView::from).collect())
    }

    async fn create_account(&self, registration: Registration) -> AppResult<User> {
        let mut conn = self.pool.get().await?;
        let email_taken: bool = diesel::select(diesel::dsl::exists(
            users::table.filter(users::email.eq(&registration.email)),
        ))
        .get_result(&mut conn)
        .await?;
        if email_taken {
            return Err(AppError::DuplicateEmail);
        }
        let username_taken: bool = diesel::select(diesel::dsl::exists(
            users::table.filter(users::username.eq(&registration.username)),
        ))
        .get_result(&mut conn)
        .await?;
        if username_taken {
            return Err(AppError::DuplicateUsername);
        }

        let password = registration.password;
        let password_hash = tokio::task::spawn_blocking(move || auth::hash_password(&password))
            .await
            .map_err(|e| AppError::Internal(e.into()))??;

        let new_user = NewUser {
            username: registration.username,
            email: registration.email,
            password_hash,
            first_name: registration.first_name,
            last_name: registration.last_name,
            phone: registration.phone,
            role: registration.role,
            location: registration.location,
        };
        // The unique constraints still decide concurrent registrations.
        diesel::insert_into(users::table)
            .values(&new_user)
            .returning(User::as_returning())
            .get_result(&mut conn)
            .await
            .map_err(map_user_conflict)
    }
}

async fn apply_changes(
    conn: &mut AsyncPgConnection,
    user_id: i32,
    changes: UserChanges,
) -> AppResult<AccountView> {
    let user = diesel::update(users::table.find(user_id))
        .set(&changes)
        .returning(User::as_returning())
        .get_result(conn)
        .await
        .optional()
        .map_err(map_user_conflict)?
        .ok_or(AppError::NotFound("user"))?;
    Ok(user.into())
}

/// Session tokens outlive a deactivation, so every mutating path re-checks
/// the account inside its own transaction.
pub(crate) async fn ensure_active(conn: &mut AsyncPgConnection, user_id: i32) -> AppResult<()> {
    let active: Option<bool> = users::table
        .find(user_id)
        .select(users::is_active)
        .first(conn)
        .await
        .optional()?;
    match active {
        Some(true) => Ok(()),
        Some(false) => Err(AppError::AccountDisabled),
        None => Err(AppError::InvalidSession),
    }
}

/// Loads public profiles for a set of ids, keyed by id.
pub(crate) async fn load_profiles(
    conn: &mut AsyncPgConnection,
    ids: Vec<i32>,
) -> AppResult<HashMap<i32, PublicProfile>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let profiles = users::table
        .filter(users::id.eq_any(ids))
        .select(PublicProfile::as_select())
        .load(conn)
        .await?;
    Ok(profiles.into_iter().map(|p| (p.id, p)).collect())
}
