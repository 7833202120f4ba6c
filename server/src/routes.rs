//! HTTP route handlers for the Beer API server.
//!
//! This module provides the HTTP API endpoints. REST routes live under the
//! configured prefix (default `/api/v1`):
//!
//! - `POST /user`, `POST /user/login`, `GET /user`, `GET|PATCH|DELETE /user/{id}`
//! - `GET|POST /beer`, `GET|PATCH|DELETE /beer/{id}`
//! - `GET|POST /beer/{id}/comments`
//! - `GET|POST /brewery`, `GET /brewery/{id}`
//!
//! and two unprefixed routes:
//!
//! - `GET /ws` - WebSocket notification channel
//! - `GET /health` - Health check endpoint
//!
//! # Architecture
//!
//! All routes share application state through [`AppState`], which contains:
//! - Configuration
//! - The document store
//! - Token keys and the password hasher
//! - The connection registry, the websocket [`ConnectionHandler`], and the
//!   [`Notifier`] write handlers announce changes through
//! - Server start time for uptime reporting
//!
//! # Example
//!
//! ```rust,no_run
//! use beerapi_server::routes::{create_router, AppState};
//! use beerapi_server::config::Config;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("failed to load config");
//!     let state = AppState::new(config);
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, FromRef, Path, Query, State, WebSocketUpgrade},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::auth::{AuthError, AuthUser, JwtKeys, PasswordHasher};
use crate::broadcast::{Broadcaster, Notifier};
use crate::codec;
use crate::config::Config;
use crate::connection::{ConnectionHandler, LoggingInboundHandler};
use crate::error::{ApiError, ApiResult, FieldError};
use crate::pagination::{first_value, Page, PageLimits, PageQuery};
use crate::registry::ConnectionRegistry;
use crate::store::{Store, StoreError};
use crate::types::{
    is_object_id, Beer, BeerPatch, BreweryAttributes, Credentials, Document, JsonApi, NewBeer,
    NewBrewery, NewComment, NewUser, Resource, TokenAttributes, UserPatch,
};

// ============================================================================
// Constants
// ============================================================================

/// Maximum accepted request body size (1 MB).
const MAX_BODY_SIZE: usize = 1024 * 1024;

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
///
/// Every field is cheap to clone; axum clones the state for each request.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,

    /// Document store.
    pub store: Arc<Store>,

    /// Token signing and verification keys.
    pub jwt: JwtKeys,

    /// Password hasher for registration and login.
    pub passwords: PasswordHasher,

    /// Page-size bounds shared by every listing endpoint.
    pub page_limits: PageLimits,

    /// Live notification connections.
    pub registry: ConnectionRegistry,

    /// Runs accepted websocket connections.
    pub connections: ConnectionHandler,

    /// Announces completed writes to listeners.
    pub notifier: Arc<dyn Notifier>,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Creates application state with an empty store and a live broadcaster.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use beerapi_server::routes::AppState;
    /// use beerapi_server::config::Config;
    ///
    /// let config = Config::from_env().expect("failed to load config");
    /// let state = AppState::new(config);
    /// ```
    #[must_use]
    pub fn new(config: Config) -> Self {
        let registry = ConnectionRegistry::new();
        let connections = ConnectionHandler::new(
            registry.clone(),
            Arc::new(LoggingInboundHandler),
            config.connection,
        );

        Self {
            jwt: JwtKeys::new(config.secret_key.as_bytes()),
            config: Arc::new(config),
            store: Arc::new(Store::new()),
            passwords: PasswordHasher::default(),
            page_limits: PageLimits::default(),
            notifier: Arc::new(Broadcaster::new(registry.clone())),
            registry,
            connections,
            start_time: Instant::now(),
        }
    }

    /// Replaces the notifier write handlers use.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Replaces the password hasher (e.g. with cheaper parameters in tests).
    #[must_use]
    pub fn with_password_hasher(mut self, passwords: PasswordHasher) -> Self {
        self.passwords = passwords;
        self
    }

    /// Base URL plus route prefix, the root of every `self` and `Link` URL.
    fn api_base(&self) -> String {
        format!("{}{}", self.config.base_url, self.config.url_prefix)
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"<Config>")
            .field("store", &self.store)
            .field("registry", &self.registry)
            .field("page_limits", &self.page_limits)
            .field("start_time", &self.start_time)
            .finish()
    }
}

impl FromRef<AppState> for JwtKeys {
    fn from_ref(state: &AppState) -> Self {
        state.jwt.clone()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
///
/// REST routes are nested under `config.url_prefix`; `/ws` and `/health`
/// are mounted at the root.
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/user", get(list_users).post(create_user))
        .route("/user/login", post(login))
        .route(
            "/user/{id}",
            get(get_user).patch(patch_user).delete(delete_user),
        )
        .route("/beer", get(list_beers).post(create_beer))
        .route(
            "/beer/{id}",
            get(get_beer).patch(patch_beer).delete(delete_beer),
        )
        .route(
            "/beer/{id}/comments",
            get(list_comments).post(create_comment),
        )
        .route("/brewery", get(list_breweries).post(create_brewery))
        .route("/brewery/{id}", get(get_brewery));

    let prefix = state.config.url_prefix.clone();
    let router = if prefix.is_empty() {
        api
    } else {
        Router::new().nest(&prefix, api)
    };

    router
        .route("/ws", get(get_ws))
        .route("/health", get(get_health))
        .fallback(route_not_found)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn route_not_found() -> ApiError {
    ApiError::NotFound("route not found".to_string())
}

// ============================================================================
// Request helpers
// ============================================================================

/// Parses a request body that must be a JSON object sent as
/// `application/json`.
fn json_object(headers: &HeaderMap, body: &Bytes) -> ApiResult<Map<String, Value>> {
    let is_json = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"));
    if !is_json {
        return Err(ApiError::UnsupportedMediaType);
    }

    match codec::decode(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(ApiError::field(FieldError::body(
            "body",
            other,
            "request body must be a JSON object",
        ))),
        Err(err) => Err(ApiError::field(FieldError::body(
            "body",
            Value::Null,
            err.to_string(),
        ))),
    }
}

/// Validates an id read from the query string.
fn query_id(param: &str, value: &str) -> ApiResult<()> {
    if is_object_id(value) {
        Ok(())
    } else {
        Err(ApiError::field(FieldError::query(
            param,
            Value::String(value.to_string()),
            format!("{param} must be a valid id"),
        )))
    }
}

/// Maps a missing referenced document to a body validation error.
fn require_brewery(state: &AppState, brewery_id: &str) -> ApiResult<()> {
    if state.store.brewery_exists(brewery_id) {
        Ok(())
    } else {
        Err(ApiError::field(FieldError::body(
            "breweryId",
            Value::String(brewery_id.to_string()),
            "brewery does not exist",
        )))
    }
}

fn single<T: JsonApi>(state: &AppState, doc: &T) -> Json<Document<Resource<T::Attributes>>> {
    Json(Document::new(doc.to_resource(&state.api_base())))
}

fn created<T: JsonApi>(state: &AppState, doc: &T) -> Response {
    (StatusCode::CREATED, single(state, doc)).into_response()
}

/// Renders one page of a listing with its pagination headers.
fn paged<A: Serialize>(url: &str, page: Page, document: Document<Vec<Resource<A>>>) -> Response {
    let mut response = Json(document).into_response();
    page.apply_headers(response.headers_mut(), url);
    response
}

fn resources<T: JsonApi>(state: &AppState, items: &[T]) -> Vec<Resource<T::Attributes>> {
    let base = state.api_base();
    items.iter().map(|item| item.to_resource(&base)).collect()
}

// ============================================================================
// Users
// ============================================================================

/// POST /user - Register a new user.
///
/// # Responses
///
/// - `201 Created` - User document (without password)
/// - `400 Bad Request` - Validation failed or username taken
/// - `415 Unsupported Media Type` - Body is not JSON
async fn create_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let input = NewUser::from_body(&json_object(&headers, &body)?)?;

    // Checked before hashing; the insert re-checks under the write lock.
    if state.store.find_user_by_username(&input.username).is_some() {
        return Err(StoreError::DuplicateUsername(input.username).into());
    }

    let hash = state.passwords.hash_blocking(input.password.clone()).await?;
    let user = state.store.insert_user(input, hash)?;
    info!(user_id = %user.id, username = %user.username, "User registered");

    Ok(created(&state, &user))
}

/// POST /user/login - Exchange credentials for a bearer token.
///
/// # Responses
///
/// - `200 OK` - `{"data": {"type": "token", "attributes": {"access_token", ...}}}`
/// - `401 Unauthorized` - Unknown user or wrong password
async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Document<Resource<TokenAttributes>>>> {
    let credentials = Credentials::from_body(&json_object(&headers, &body)?)?;

    let user = state
        .store
        .find_user_by_username(&credentials.username)
        .ok_or(AuthError::InvalidCredentials)?;
    let valid = state
        .passwords
        .verify_blocking(credentials.password, user.password_hash.clone())
        .await?;
    if !valid {
        debug!(user_id = %user.id, "Login rejected");
        return Err(AuthError::InvalidCredentials.into());
    }

    let token = state.jwt.issue(&user.id)?;
    info!(user_id = %user.id, "User logged in");

    Ok(Json(Document::new(Resource {
        kind: "token",
        id: Utc::now().timestamp_millis().to_string(),
        attributes: TokenAttributes {
            access_token: token.access_token,
            token_type: "Bearer",
            expires_in: token.expires_in,
        },
        links: None,
    })))
}

/// GET /user - Paginated user list, sorted by username.
async fn list_users(
    _auth: AuthUser,
    State(state): State<AppState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    let params = PageQuery::from_pairs(&pairs).params(state.page_limits);
    let listing = state.store.list_users(params.skip(), params.per_page);
    let url = format!("{}/user", state.api_base());

    paged(
        &url,
        params.with_total(listing.total),
        Document::new(resources(&state, &listing.items)),
    )
}

/// GET /user/{id}
async fn get_user(
    _auth: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let user = state.store.find_user(&id)?;
    Ok(single(&state, &user).into_response())
}

/// PATCH /user/{id} - Update your own profile. Passwords cannot be changed here.
async fn patch_user(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    if auth.user_id != id {
        return Err(ApiError::Forbidden(
            "You can modify only your own account!".to_string(),
        ));
    }

    let patch = UserPatch::from_body(&json_object(&headers, &body)?)?;
    let user = state.store.update_user(&id, patch)?;
    info!(user_id = %user.id, "User updated");

    Ok(single(&state, &user).into_response())
}

/// DELETE /user/{id} - Delete your own account and your comments.
async fn delete_user(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if auth.user_id != id {
        return Err(ApiError::Forbidden(
            "You can delete only your account!".to_string(),
        ));
    }

    state.store.delete_user(&id)?;
    info!(user_id = %id, "User deleted");
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Beers
// ============================================================================

/// Query parameters for `GET /beer`.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BeerListQuery {
    /// Single-beer lookup.
    pub id: Option<String>,

    /// Restrict the listing to one brewery.
    pub brewery_id: Option<String>,

    /// `brewery` embeds the referenced breweries under `included`.
    pub include: Option<String>,

    pub page: PageQuery,
}

impl BeerListQuery {
    /// Picks the known parameters out of decoded query pairs, first
    /// occurrence wins.
    #[must_use]
    pub fn from_pairs(pairs: &[(String, String)]) -> Self {
        let get = |key| first_value(pairs, key).map(str::to_string);
        Self {
            id: get("id"),
            brewery_id: get("breweryId"),
            include: get("include"),
            page: PageQuery::from_pairs(pairs),
        }
    }

    fn include_breweries(&self) -> ApiResult<bool> {
        match self.include.as_deref() {
            None | Some("") => Ok(false),
            Some("brewery") => Ok(true),
            Some(other) => Err(ApiError::field(FieldError::query(
                "include",
                Value::String(other.to_string()),
                "include only supports 'brewery'",
            ))),
        }
    }
}

/// Renders the breweries referenced by `beers`, each once.
fn included_breweries(
    state: &AppState,
    beers: &[Beer],
) -> Vec<Resource<BreweryAttributes>> {
    let base = state.api_base();
    beers
        .iter()
        .map(|beer| beer.brewery_id.as_str())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .filter_map(|id| state.store.find_brewery(id).ok())
        .map(|brewery| brewery.to_resource(&base))
        .collect()
}

/// GET /beer - Paginated beer list sorted by name.
///
/// `?id=` turns the listing into a single lookup, `?breweryId=` filters by
/// brewery, and `?include=brewery` embeds the referenced breweries.
async fn list_beers(
    State(state): State<AppState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> ApiResult<Response> {
    let query = BeerListQuery::from_pairs(&pairs);
    let include = query.include_breweries()?;

    if let Some(id) = query.id.as_deref() {
        query_id("id", id)?;
        let beer = state.store.find_beer(id)?;
        let beers = [beer];
        let mut document = Document::new(resources(&state, &beers));
        if include {
            document = document.with_included(included_breweries(&state, &beers));
        }
        return Ok(Json(document).into_response());
    }

    let mut url = format!("{}/beer", state.api_base());
    if let Some(brewery_id) = query.brewery_id.as_deref() {
        query_id("breweryId", brewery_id)?;
        url = format!("{url}?breweryId={brewery_id}");
    }

    let params = query.page.params(state.page_limits);
    let listing = state.store.list_beers(
        query.brewery_id.as_deref(),
        params.skip(),
        params.per_page,
    );

    let mut document = Document::new(resources(&state, &listing.items));
    if include {
        document = document.with_included(included_breweries(&state, &listing.items));
    }

    Ok(paged(
        &url,
        params.with_total(listing.total),
        document,
    ))
}

/// POST /beer - Create a beer. The brewery must exist.
async fn create_beer(
    _auth: AuthUser,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let input = NewBeer::from_body(&json_object(&headers, &body)?)?;
    require_brewery(&state, &input.brewery_id)?;

    let beer = state.store.insert_beer(input);
    info!(beer_id = %beer.id, "Beer created");
    Ok(created(&state, &beer))
}

/// GET /beer/{id}
async fn get_beer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let beer = state.store.find_beer(&id)?;
    Ok(single(&state, &beer).into_response())
}

/// PATCH /beer/{id} - Partial update.
async fn patch_beer(
    _auth: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let patch = BeerPatch::from_body(&json_object(&headers, &body)?)?;
    if let Some(brewery_id) = &patch.brewery_id {
        require_brewery(&state, brewery_id)?;
    }

    let beer = state.store.update_beer(&id, patch)?;
    info!(beer_id = %beer.id, "Beer updated");
    Ok(single(&state, &beer).into_response())
}

/// DELETE /beer/{id} - Delete a beer and its comments.
async fn delete_beer(
    _auth: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.store.delete_beer(&id)?;
    info!(beer_id = %id, "Beer deleted");
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Comments
// ============================================================================

/// GET /beer/{id}/comments - Paginated comments, newest first.
async fn list_comments(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> ApiResult<Response> {
    let params = PageQuery::from_pairs(&pairs).params(state.page_limits);
    let listing = state
        .store
        .list_comments(&id, params.skip(), params.per_page)?;
    let url = format!("{}/beer/{id}/comments", state.api_base());

    Ok(paged(
        &url,
        params.with_total(listing.total),
        Document::new(resources(&state, &listing.items)),
    ))
}

/// POST /beer/{id}/comments - Comment on a beer, then notify listeners.
///
/// The notification `{"action": "beer_comment", "user": <id>, "beer": <id>}`
/// is sent only after the comment is stored.
async fn create_comment(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let input = NewComment::from_body(&json_object(&headers, &body)?)?;

    // A token can outlive its user; the store refuses such authors.
    let comment = state.store.insert_comment(&id, &auth.user_id, input)?;
    info!(comment_id = %comment.id, beer_id = %id, user_id = %auth.user_id, "Comment added");

    state.notifier.notify(&json!({
        "action": "beer_comment",
        "user": auth.user_id,
        "beer": id,
    }));

    Ok(created(&state, &comment))
}

// ============================================================================
// Breweries
// ============================================================================

/// GET /brewery - Paginated brewery list sorted by name.
async fn list_breweries(
    State(state): State<AppState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    let params = PageQuery::from_pairs(&pairs).params(state.page_limits);
    let listing = state.store.list_breweries(params.skip(), params.per_page);
    let url = format!("{}/brewery", state.api_base());

    paged(
        &url,
        params.with_total(listing.total),
        Document::new(resources(&state, &listing.items)),
    )
}

/// POST /brewery
async fn create_brewery(
    _auth: AuthUser,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let input = NewBrewery::from_body(&json_object(&headers, &body)?)?;
    let brewery = state.store.insert_brewery(input);
    info!(brewery_id = %brewery.id, "Brewery created");
    Ok(created(&state, &brewery))
}

/// GET /brewery/{id}
async fn get_brewery(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let brewery = state.store.find_brewery(&id)?;
    Ok(single(&state, &brewery).into_response())
}

// ============================================================================
// GET /ws - WebSocket Notifications
// ============================================================================

/// GET /ws - WebSocket notification endpoint.
///
/// No authentication is required. Once connected, the server pushes one
/// JSON text frame per notification. Frames sent by the client are decoded
/// and logged; malformed ones are dropped without closing the connection
/// unless a malformed-frame limit is configured.
async fn get_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let handler = state.connections.clone();
    ws.on_upgrade(move |socket| async move {
        let reason = handler.run(socket).await;
        debug!(reason = %reason, "WebSocket handler finished");
    })
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Response body for health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Server status (always "ok" if responding).
    pub status: String,

    /// Number of live websocket connections.
    pub connections: usize,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

/// GET /health - Health check endpoint.
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        connections: state.registry.len(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// Tests
// ============================================================================
