use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc, time::Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Role attached to an API key. Users submit listings, partners work leads,
/// admins moderate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Partner,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Partner => "partner",
            Role::Admin => "admin",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "user" => Some(Role::User),
            "partner" => Some(Role::Partner),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct AuthState {
    records: Arc<HashMap<String, PrincipalRecord>>,
    limiter: Arc<RateLimiter>,
}

#[derive(Clone, Debug)]
pub struct AuthContext {
    pub user_id: i64,
    pub role: Role,
    pub api_key_id: String,
}

#[derive(Clone)]
struct PrincipalRecord {
    user_id: i64,
    role: Role,
    api_key_id: String,
}

impl AuthState {
    pub fn from_env() -> Self {
        let records = Arc::new(load_keys_from_env());
        let limiter = Arc::new(RateLimiter::from_env());
        Self { records, limiter }
    }

    #[cfg(test)]
    fn for_tests(raw_keys: &str, limiter: RateLimiter) -> Self {
        Self {
            records: Arc::new(parse_keys(raw_keys)),
            limiter: Arc::new(limiter),
        }
    }

    fn authenticate(&self, presented: &str) -> Option<AuthContext> {
        self.records.get(presented).map(|record| AuthContext {
            user_id: record.user_id,
            role: record.role,
            api_key_id: record.api_key_id.clone(),
        })
    }

    async fn consume(&self, user_id: i64) -> Result<RatePermit, RateExceeded> {
        self.limiter.consume(user_id).await
    }
}

pub async fn require_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(deny(
            StatusCode::UNAUTHORIZED,
            "missing_api_key",
            "Provide X-Ecoloop-Key or Bearer token",
        ));
    };

    let Some(context) = state.authenticate(&presented) else {
        return Ok(deny(
            StatusCode::UNAUTHORIZED,
            "invalid_api_key",
            "Key not recognized",
        ));
    };

    match state.consume(context.user_id).await {
        Ok(permit) => {
            request.extensions_mut().insert(context);
            let mut response = next.run(request).await;
            permit.apply_headers(response.headers_mut());
            Ok(response)
        }
        Err(exceeded) => {
            let mut response = deny(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "Too many requests",
            );
            exceeded.apply_headers(response.headers_mut());
            Ok(response)
        }
    }
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get("X-Ecoloop-Key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn deny(status: StatusCode, code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (status, Json(payload)).into_response()
}

fn load_keys_from_env() -> HashMap<String, PrincipalRecord> {
    let raw = env::var("API_KEYS").unwrap_or_default();
    let mut entries = parse_keys(&raw);

    if entries.is_empty() {
        warn!(
            target = "ecoloop.api",
            "API_KEYS produced no keys; falling back to demo credentials"
        );
        entries = parse_keys(
            "1:user:demo-user-key,2:partner:demo-partner-key,9:admin:demo-admin-key",
        );
    } else {
        info!(
            target = "ecoloop.api",
            key_count = entries.len(),
            "loaded API keys from env"
        );
    }

    entries
}

/// `API_KEYS` holds comma-separated `user_id:role:secret` triplets.
fn parse_keys(raw: &str) -> HashMap<String, PrincipalRecord> {
    let mut entries = HashMap::new();
    for (idx, token) in raw.split(',').enumerate() {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.splitn(3, ':');
        let user_id = parts
            .next()
            .map(str::trim)
            .and_then(|s| s.parse::<i64>().ok());
        let role = parts.next().map(str::trim).and_then(Role::from_str);
        let secret = parts.next().map(str::trim).filter(|s| !s.is_empty());
        match (user_id, role, secret) {
            (Some(user_id), Some(role), Some(secret)) => {
                let record = PrincipalRecord {
                    user_id,
                    role,
                    api_key_id: format!("key-{:02}", idx + 1),
                };
                entries.insert(secret.to_string(), record);
            }
            _ => warn!(
                target = "ecoloop.api",
                "ignored malformed API_KEYS entry: {trimmed}"
            ),
        }
    }
    entries
}

struct RateLimiter {
    rate_per_sec: f64,
    capacity: f64,
    buckets: Mutex<HashMap<i64, BucketState>>,
}

impl RateLimiter {
    fn from_env() -> Self {
        let rate_per_sec = env::var("RATE_LIMIT_PER_SEC")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value > 0.0)
            .unwrap_or(5.0);
        let capacity = env::var("RATE_LIMIT_CAPACITY")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value >= 1.0)
            .unwrap_or(10.0);
        Self::new(rate_per_sec, capacity)
    }

    fn new(rate_per_sec: f64, capacity: f64) -> Self {
        Self {
            rate_per_sec,
            capacity,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    async fn consume(&self, user_id: i64) -> Result<RatePermit, RateExceeded> {
        let mut guard = self.buckets.lock().await;
        let now = Instant::now();
        let state = guard.entry(user_id).or_insert_with(|| BucketState {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            state.last_refill = now;
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(RatePermit {
                capacity: self.capacity,
                tokens: state.tokens,
                rate: self.rate_per_sec,
            })
        } else {
            let deficit = 1.0 - state.tokens;
            let retry_after = (deficit / self.rate_per_sec).max(0.0);
            Err(RateExceeded {
                retry_after,
                capacity: self.capacity,
                tokens: state.tokens,
                rate: self.rate_per_sec,
            })
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug, Clone)]
pub struct RatePermit {
    capacity: f64,
    tokens: f64,
    rate: f64,
}

impl RatePermit {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        rate_limit_headers(headers, self.capacity, self.tokens, self.rate);
    }
}

#[derive(Debug, Clone)]
pub struct RateExceeded {
    retry_after: f64,
    capacity: f64,
    tokens: f64,
    rate: f64,
}

impl RateExceeded {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        let retry = self.retry_after.ceil().max(0.0) as u64;
        headers.insert(
            http::header::RETRY_AFTER,
            HeaderValue::from_str(&retry.to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("1")),
        );
        rate_limit_headers(headers, self.capacity, self.tokens, self.rate);
    }
}

// Overdrawn buckets floor remaining to zero.
fn rate_limit_headers(headers: &mut http::HeaderMap, capacity: f64, tokens: f64, rate: f64) {
    let remaining = tokens.max(0.0).floor() as u64;
    let reset = ((capacity - tokens) / rate).ceil().max(0.0) as u64;
    for (name, value) in [
        ("X-RateLimit-Limit", capacity as u64),
        ("X-RateLimit-Remaining", remaining),
        ("X-RateLimit-Reset", reset),
    ] {
        headers.insert(
            name,
            HeaderValue::from_str(&value.to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("0")),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_triplets() {
        let keys = parse_keys("1:user:alpha, 7:partner:beta ,9:admin:gamma");
        assert_eq!(keys.len(), 3);
        let beta = keys.get("beta").expect("partner key");
        assert_eq!(beta.user_id, 7);
        assert_eq!(beta.role, Role::Partner);
    }

    #[test]
    fn malformed_entries_are_dropped() {
        let keys = parse_keys("nope,8:wizard:key,:user:key,5:user:");
        assert!(keys.is_empty());
    }

    #[test]
    fn role_names_round_trip() {
        for role in [Role::User, Role::Partner, Role::Admin] {
            assert_eq!(Role::from_str(role.as_str()), Some(role));
        }
        assert_eq!(Role::from_str("superuser"), None);
    }

    #[tokio::test]
    async fn bucket_drains_and_rejects() {
        let limiter = RateLimiter::new(1.0, 2.0);
        assert!(limiter.consume(42).await.is_ok());
        assert!(limiter.consume(42).await.is_ok());
        assert!(limiter.consume(42).await.is_err());
        // Buckets are per principal.
        assert!(limiter.consume(43).await.is_ok());
    }

    #[tokio::test]
    async fn middleware_gates_and_budgets_requests() {
        use axum::{Extension, Router, middleware::from_fn_with_state, routing::get};
        use tower::ServiceExt;

        async fn whoami(Extension(context): Extension<AuthContext>) -> String {
            format!("{}:{}", context.user_id, context.role.as_str())
        }

        let state = AuthState::for_tests("7:partner:sesame", RateLimiter::new(1.0, 2.0));
        let app = Router::new()
            .route("/whoami", get(whoami))
            .route_layer(from_fn_with_state(state, require_api_auth));

        let bare = Request::builder()
            .uri("/whoami")
            .body(Body::empty())
            .expect("request");
        let denied = app.clone().oneshot(bare).await.expect("response");
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let keyed = || {
            Request::builder()
                .uri("/whoami")
                .header("X-Ecoloop-Key", "sesame")
                .body(Body::empty())
                .expect("request")
        };
        let ok = app.clone().oneshot(keyed()).await.expect("response");
        assert_eq!(ok.status(), StatusCode::OK);
        assert!(ok.headers().contains_key("X-RateLimit-Limit"));

        // Capacity 2: the third keyed call overdraws the bucket.
        app.clone().oneshot(keyed()).await.expect("response");
        let limited = app.clone().oneshot(keyed()).await.expect("response");
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(limited.headers().contains_key("Retry-After"));
    }
}
