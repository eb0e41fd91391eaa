mod dedupe;
mod geo;
mod importer;
mod lifecycle;
mod metrics;
mod models;
mod pipeline;
mod rules;
mod security;
mod store;
mod tabular;
mod vision;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Extension, Multipart, Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use lifecycle::{TransitionError, VisibilityError};
use models::{
    ApiError, CompleteLeadRequest, DeviceSpecs, EstimationResult, Intent, KycStatus, LeadSummary,
    ListingStatus, ListingSummary, PartnerProfile, PartnerSelection, PartnerType,
    PartnerUpsertRequest, Visibility,
};
use pipeline::{Estimator, ImageUpload};
use security::{AuthContext, AuthState, Role, require_api_auth};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use store::{ImageStore, ListingRow, NewListing, PartnerRecord, Store, StoreError};
// metrics macros disabled in demo build
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

/// Rows returned by `/listings/mine` and the admin board.
const LISTINGS_PAGE_LIMIT: i64 = 200;
/// Partners embedded into every estimation response.
const NEARBY_EMBED_LIMIT: usize = 5;
const NEARBY_DEFAULT_LIMIT: usize = 10;
const NEARBY_MAX_LIMIT: usize = 50;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "ecoloop.api", "server crashed: {err}");
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let auth_state = AuthState::from_env();

    let db_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:ewaste.db".to_string());
    let store = Store::connect(&db_url).await?;
    store.init_schema().await?;

    if let Ok(path) = std::env::var("PARTNER_CSV")
        && !path.trim().is_empty()
    {
        match importer::import_partners(&store, std::path::Path::new(&path)).await {
            Ok(report) => info!(
                target = "ecoloop.api",
                created = report.created,
                updated = report.updated,
                skipped = report.skipped,
                "partner directory imported",
            ),
            Err(err) => warn!(
                target = "ecoloop.api",
                path = %path,
                "partner directory import failed: {err}",
            ),
        }
    }

    let estimator = Estimator::from_env();

    let upload_dir = std::env::var("UPLOAD_DIR").unwrap_or_else(|_| "uploads".to_string());
    let images = ImageStore::open(&upload_dir).await?;

    let openapi_raw = include_str!("../docs/openapi.yaml");
    let openapi: serde_json::Value =
        serde_yaml::from_str(openapi_raw).unwrap_or(serde_json::json!({"openapi":"3.0.3"}));
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("prom recorder");

    let state = AppState {
        store,
        estimator,
        images,
        openapi: Arc::new(openapi),
        prometheus_handle,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let admin = Router::new()
        .route("/partners", get(admin_partners))
        .route("/partners/verify", post(admin_verify_partners))
        .route("/partners/{user_id}/reject", post(admin_reject_partner))
        .route("/listings", get(admin_listings))
        .route("/listings/{id}/hide", post(admin_hide_listing))
        .route("/listings/{id}/restore", post(admin_restore_listing))
        .route("/listings/{id}/remove", post(admin_remove_listing));

    let protected = Router::new()
        .route("/listings", post(create_listing))
        .route("/listings/mine", get(my_listings))
        .route("/listings/{id}", delete(delete_listing))
        .route("/partners/nearby", get(nearby_partners))
        .route("/partners/register", post(register_partner))
        .route(
            "/partners/me",
            get(partner_profile).put(update_partner_profile),
        )
        .route("/leads", get(list_leads))
        .route("/leads/{id}/accept", post(accept_lead))
        .route("/leads/{id}/reject", post(reject_lead))
        .route("/leads/{id}/complete", post(complete_lead))
        .nest("/admin", admin)
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "ecoloop.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    store: Store,
    estimator: Estimator,
    images: ImageStore,
    openapi: Arc<serde_json::Value>,
    prometheus_handle: PrometheusHandle,
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
///
/// Returns a small JSON payload with `status` and `service`.
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "ecoloop-api-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(AppError::Forbidden("docs key required".to_string()));
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> axum::http::Response<String> {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Ecoloop API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    axum::http::Response::builder()
        .header("Content-Type", "text/html; charset=utf-8")
        .body(html.to_string())
        .unwrap()
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(10 * 1024 * 1024)
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(axum::http::StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap();
        }
    }
    let body = state.prometheus_handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap()
}

// -------- Listings --------

#[derive(Debug, Serialize)]
struct CreateListingResponse {
    listing_id: i64,
    status: &'static str,
    image: String,
    result: EstimationResult,
}

struct Intake {
    specs: DeviceSpecs,
    image: Option<(String, Bytes)>,
}

/// Submit a device with a photo and get the tiered estimate back.
///
/// - Method: `POST`
/// - Path: `/listings`
/// - Auth: `Authorization: Bearer <key>` or `X-Ecoloop-Key: <key>`
/// - Body: multipart form (`image` file plus device spec fields)
/// - Response: `CreateListingResponse` with the stored listing id and estimate
async fn create_listing(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    mut multipart: Multipart,
) -> Result<Json<CreateListingResponse>, AppError> {
    crate::metrics::inc_requests("/listings");
    info!(
        target = "ecoloop.api",
        user_id = context.user_id,
        api_key = %context.api_key_id,
        "listing intake invoked",
    );

    let intake = collect_intake(&mut multipart).await?;
    let specs = intake.specs;

    let Some((filename, bytes)) = intake.image else {
        return Err(AppError::Validation("image file is required".to_string()));
    };
    if bytes.is_empty() {
        return Err(AppError::Validation("image file is empty".to_string()));
    }
    for (field, value) in [
        ("category", &specs.category),
        ("brand", &specs.brand),
        ("model", &specs.model),
    ] {
        if value.trim().is_empty() {
            return Err(AppError::Validation(format!("missing field: {field}")));
        }
    }

    let image_md5 = dedupe::image_md5(&bytes);
    let key = dedupe::listing_key(context.user_id, &specs.brand, &specs.model, &image_md5);
    if state.store.has_listing_key(context.user_id, &key).await? {
        crate::metrics::duplicate_rejected();
        return Err(duplicate_listing_error());
    }

    let mut result = state
        .estimator
        .estimate(
            &specs,
            Some(ImageUpload {
                bytes: &bytes,
                filename: &filename,
            }),
        )
        .await;

    // No coordinates still gets the matching directory, just unranked.
    let rows = state.store.partners(None).await?;
    let profiles: Vec<PartnerProfile> = rows.iter().map(|row| row.profile()).collect();
    result.nearby_partners =
        geo::rank_partners(&profiles, specs.lat.zip(specs.lon), specs.intent, NEARBY_EMBED_LIMIT);

    let status = lifecycle::initial_status(specs.intent, result.predictions.decision);
    let stored_name = ImageStore::file_name(&image_md5, Some(&filename));
    state.images.save(&stored_name, &bytes).await.map_err(|err| {
        error!(target = "ecoloop.api", "image write failed: {err}");
        AppError::Internal("could not persist image".to_string())
    })?;

    let payload = serde_json::to_string(&specs).map_err(internal)?;
    let result_json = serde_json::to_string(&result).map_err(internal)?;

    let inserted = state
        .store
        .insert_listing(NewListing {
            user_id: context.user_id,
            payload: &payload,
            image_path: &stored_name,
            image_md5: &image_md5,
            dedupe_key: &key,
            result_json: &result_json,
            status,
            intent: specs.intent,
            decision: result.predictions.decision,
        })
        .await;

    let listing_id = match inserted {
        Ok(id) => id,
        Err(StoreError::DuplicateListing) => {
            crate::metrics::duplicate_rejected();
            cleanup_orphan_image(&state, &image_md5, &stored_name).await;
            return Err(duplicate_listing_error());
        }
        Err(other) => {
            // The photo went to disk before the INSERT; take it back out.
            cleanup_orphan_image(&state, &image_md5, &stored_name).await;
            return Err(other.into());
        }
    };

    info!(
        target = "ecoloop.api",
        user_id = context.user_id,
        listing_id,
        method = result.method.as_str(),
        status = status.as_str(),
        "listing created",
    );

    Ok(Json(CreateListingResponse {
        listing_id,
        status: status.as_str(),
        image: stored_name,
        result,
    }))
}

async fn collect_intake(multipart: &mut Multipart) -> Result<Intake, AppError> {
    let mut specs = DeviceSpecs::default();
    let mut image: Option<(String, Bytes)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::Validation(format!("malformed multipart body: {err}")))?
    {
        let Some(name) = field.name().map(|n| n.to_string()) else {
            continue;
        };
        if name == "image" {
            let filename = field
                .file_name()
                .map(|n| n.to_string())
                .unwrap_or_else(|| "upload.jpg".to_string());
            let bytes = field
                .bytes()
                .await
                .map_err(|err| AppError::Validation(format!("unreadable image field: {err}")))?;
            image = Some((filename, bytes));
        } else {
            let value = field
                .text()
                .await
                .map_err(|err| AppError::Validation(format!("unreadable field {name}: {err}")))?;
            apply_spec_field(&mut specs, &name, &value);
        }
    }
    Ok(Intake { specs, image })
}

fn apply_spec_field(specs: &mut DeviceSpecs, name: &str, value: &str) {
    let text = value.trim();
    match name {
        "category" => specs.category = text.to_string(),
        "brand" => specs.brand = text.to_string(),
        "model" => specs.model = text.to_string(),
        "accessories" => specs.accessories = text.to_string(),
        "city" => specs.city = text.to_string(),
        "age_months" => specs.age_months = form_f64(text),
        "original_price" => specs.original_price = form_f64(text),
        "battery_health" => specs.battery_health = form_f64(text),
        "lat" => specs.lat = form_f64(text),
        "lon" => specs.lon = form_f64(text),
        "defect_count" => specs.defect_count = form_i64(text).unwrap_or(0),
        "screen_issues" => specs.screen_issues = form_i64(text).unwrap_or(0),
        "body_issues" => specs.body_issues = form_i64(text).unwrap_or(0),
        "storage_gb" => specs.storage_gb = form_i64(text),
        "ram_gb" => specs.ram_gb = form_i64(text),
        "intent" => {
            if let Some(intent) = Intent::from_str(text) {
                specs.intent = intent;
            }
        }
        _ => {}
    }
}

// Form values arrive as strings; junk falls back to the estimator defaults.
fn form_f64(value: &str) -> Option<f64> {
    if value.is_empty() {
        return None;
    }
    value.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn form_i64(value: &str) -> Option<i64> {
    if value.is_empty() {
        return None;
    }
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|v| v as i64)
}

fn duplicate_listing_error() -> AppError {
    AppError::Conflict("you already submitted this device with the same photo".to_string())
}

async fn cleanup_orphan_image(state: &AppState, image_md5: &str, stored_name: &str) {
    match state.store.count_image_refs(image_md5).await {
        Ok(0) => {
            if let Err(err) = state.images.remove(stored_name).await {
                warn!(target = "ecoloop.api", "orphan image cleanup failed: {err}");
            }
        }
        Ok(_) => {}
        Err(err) => warn!(target = "ecoloop.api", "image ref count failed: {err}"),
    }
}

async fn my_listings(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/listings/mine");
    let rows = state
        .store
        .listings_for_user(context.user_id, LISTINGS_PAGE_LIMIT)
        .await?;
    let listings: Vec<ListingSummary> = rows.iter().map(summarize_listing).collect();
    Ok(Json(json!({ "listings": listings })))
}

/// Withdraw one of the caller's listings; the image file goes with it when no
/// other listing still references the same bytes.
async fn delete_listing(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/listings/{id}");
    let Some(row) = state.store.delete_listing(id, context.user_id).await? else {
        return Err(AppError::NotFound("listing not found".to_string()));
    };
    cleanup_orphan_image(&state, &row.image_md5, &row.image_path).await;
    info!(
        target = "ecoloop.api",
        user_id = context.user_id,
        listing_id = id,
        "listing deleted",
    );
    Ok(Json(json!({ "ok": true })))
}

fn summarize_listing(row: &ListingRow) -> ListingSummary {
    let specs = row.specs().unwrap_or_default();
    let result = row.result();
    ListingSummary {
        id: row.id,
        created_at: row.created_at,
        brand: specs.brand,
        model: specs.model,
        category: specs.category,
        city: specs.city,
        image: row.image_path.clone(),
        status: lifecycle::effective_status(row.status(), row.visibility()),
        intent: row.intent(),
        predictions: result.as_ref().map(|r| r.predictions.clone()),
        image_condition: result.map(|r| r.image_condition),
        chosen_partner_id: row.chosen_partner_id,
        outcome: row.outcome.clone(),
    }
}

// -------- Partners --------

#[derive(Debug, Deserialize)]
struct NearbyQuery {
    lat: Option<f64>,
    lon: Option<f64>,
    intent: Option<String>,
    limit: Option<usize>,
}

/// Rank partners around a point for a given intent.
///
/// - Method: `GET`
/// - Path: `/partners/nearby?lat=..&lon=..&intent=..&limit=..`
///
/// Without coordinates the directory is returned unranked.
async fn nearby_partners(
    State(state): State<AppState>,
    Query(query): Query<NearbyQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/partners/nearby");
    let intent = query
        .intent
        .as_deref()
        .and_then(Intent::from_str)
        .unwrap_or_default();
    let limit = query
        .limit
        .unwrap_or(NEARBY_DEFAULT_LIMIT)
        .min(NEARBY_MAX_LIMIT);
    let origin = match (query.lat, query.lon) {
        (Some(lat), Some(lon)) => Some((lat, lon)),
        _ => None,
    };
    let rows = state.store.partners(None).await?;
    let profiles: Vec<PartnerProfile> = rows.iter().map(|row| row.profile()).collect();
    let partners = geo::rank_partners(&profiles, origin, intent, limit);
    Ok(Json(json!({ "partners": partners })))
}

async fn register_partner(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<PartnerUpsertRequest>,
) -> Result<Json<PartnerProfile>, AppError> {
    crate::metrics::inc_requests("/partners/register");
    require_role(&context, Role::Partner)?;
    let record = partner_record(context.user_id, &payload)?;
    state
        .store
        .insert_partner(record, KycStatus::Submitted)
        .await?;
    let Some(row) = state.store.get_partner(context.user_id).await? else {
        return Err(AppError::Internal(
            "partner row missing after insert".to_string(),
        ));
    };
    info!(
        target = "ecoloop.api",
        user_id = context.user_id,
        org = %payload.org_name,
        "partner registered",
    );
    Ok(Json(row.profile()))
}

async fn partner_profile(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Result<Json<PartnerProfile>, AppError> {
    crate::metrics::inc_requests("/partners/me");
    require_role(&context, Role::Partner)?;
    let Some(row) = state.store.get_partner(context.user_id).await? else {
        return Err(AppError::NotFound("partner profile not found".to_string()));
    };
    Ok(Json(row.profile()))
}

async fn update_partner_profile(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<PartnerUpsertRequest>,
) -> Result<Json<PartnerProfile>, AppError> {
    crate::metrics::inc_requests("/partners/me");
    require_role(&context, Role::Partner)?;
    let record = partner_record(context.user_id, &payload)?;
    if !state.store.update_partner(record).await? {
        return Err(AppError::NotFound("partner profile not found".to_string()));
    }
    let Some(row) = state.store.get_partner(context.user_id).await? else {
        return Err(AppError::NotFound("partner profile not found".to_string()));
    };
    Ok(Json(row.profile()))
}

fn partner_record<'a>(
    user_id: i64,
    payload: &'a PartnerUpsertRequest,
) -> Result<PartnerRecord<'a>, AppError> {
    if payload.org_name.trim().is_empty() {
        return Err(AppError::Validation("org_name is required".to_string()));
    }
    let Some(partner_type) = PartnerType::from_str(&payload.partner_type) else {
        return Err(AppError::Validation(
            "partner_type must be repair or recycler".to_string(),
        ));
    };
    Ok(PartnerRecord {
        user_id,
        org_name: payload.org_name.trim(),
        partner_type,
        city: payload.city.trim(),
        address: payload.address.trim(),
        lat: payload.lat,
        lon: payload.lon,
        service_radius_km: payload
            .service_radius_km
            .filter(|r| *r > 0.0)
            .unwrap_or(importer::DEFAULT_SERVICE_RADIUS_KM),
        contact_phone: payload
            .contact_phone
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty()),
    })
}

// -------- Leads --------

async fn list_leads(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/leads");
    require_role(&context, Role::Partner)?;
    let Some(partner) = state.store.get_partner(context.user_id).await? else {
        return Err(AppError::Forbidden(
            "register as a partner before browsing leads".to_string(),
        ));
    };
    let rows = state
        .store
        .leads_for_partner(context.user_id, partner.partner_type())
        .await?;
    let leads: Vec<LeadSummary> = rows
        .iter()
        .map(|row| lead_summary(row, context.user_id))
        .collect();
    Ok(Json(json!({ "leads": leads })))
}

fn lead_summary(row: &ListingRow, partner_id: i64) -> LeadSummary {
    let specs = row.specs().unwrap_or_default();
    LeadSummary {
        listing_id: row.id,
        created_at: row.created_at,
        brand: specs.brand,
        model: specs.model,
        category: specs.category,
        city: specs.city,
        intent: row.intent(),
        decision: row.decision(),
        status: row.status().as_str(),
        mine: row.chosen_partner_id == Some(partner_id),
        predictions: row.result().map(|r| r.predictions),
    }
}

/// Claim an open lead.
///
/// - Method: `POST`
/// - Path: `/leads/{id}/accept`
///
/// First caller wins; the conditional update arbitrates concurrent accepts.
async fn accept_lead(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/leads/{id}/accept");
    require_role(&context, Role::Partner)?;
    let row = fetch_listing(&state, id).await?;
    if row.visibility() != Visibility::Visible {
        return Err(AppError::NotFound("listing not found".to_string()));
    }
    lifecycle::accept(row.status(), row.chosen_partner_id, context.user_id)?;
    if !state.store.try_accept(id, context.user_id).await? {
        return Err(stale_lead_error(&state, id, context.user_id, lifecycle::accept).await);
    }
    crate::metrics::lead_action("accept");
    info!(
        target = "ecoloop.api",
        listing_id = id,
        partner_id = context.user_id,
        "lead accepted",
    );
    Ok(Json(json!({ "ok": true, "status": "in_progress" })))
}

async fn reject_lead(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/leads/{id}/reject");
    require_role(&context, Role::Partner)?;
    let row = fetch_listing(&state, id).await?;
    lifecycle::reject(row.status(), row.chosen_partner_id, context.user_id)?;
    if !state.store.try_reject(id, context.user_id).await? {
        return Err(stale_lead_error(&state, id, context.user_id, lifecycle::reject).await);
    }
    crate::metrics::lead_action("reject");
    info!(
        target = "ecoloop.api",
        listing_id = id,
        partner_id = context.user_id,
        "lead rejected",
    );
    Ok(Json(json!({ "ok": true, "status": "created" })))
}

async fn complete_lead(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<i64>,
    Json(payload): Json<CompleteLeadRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/leads/{id}/complete");
    require_role(&context, Role::Partner)?;
    let outcome = payload.outcome.trim();
    if outcome.is_empty() {
        return Err(AppError::Validation("outcome is required".to_string()));
    }
    let row = fetch_listing(&state, id).await?;
    lifecycle::complete(row.status(), row.chosen_partner_id, context.user_id)?;
    let done = state
        .store
        .try_complete(
            id,
            context.user_id,
            outcome,
            payload.final_price,
            payload.final_rul_months,
        )
        .await?;
    if !done {
        return Err(stale_lead_error(&state, id, context.user_id, lifecycle::complete).await);
    }
    crate::metrics::lead_action("complete");
    info!(
        target = "ecoloop.api",
        listing_id = id,
        partner_id = context.user_id,
        outcome,
        "lead completed",
    );
    Ok(Json(json!({ "ok": true, "status": "completed" })))
}

async fn fetch_listing(state: &AppState, id: i64) -> Result<ListingRow, AppError> {
    let Some(row) = state.store.get_listing(id).await? else {
        return Err(AppError::NotFound("listing not found".to_string()));
    };
    Ok(row)
}

/// The conditional update raced another writer. Re-read and report whatever
/// the fresh row implies.
async fn stale_lead_error(
    state: &AppState,
    id: i64,
    partner_id: i64,
    check: fn(ListingStatus, Option<i64>, i64) -> Result<(), TransitionError>,
) -> AppError {
    match state.store.get_listing(id).await {
        Ok(Some(row)) => match check(row.status(), row.chosen_partner_id, partner_id) {
            Err(err) => err.into(),
            Ok(()) => AppError::Conflict("listing changed concurrently".to_string()),
        },
        Ok(None) => AppError::NotFound("listing not found".to_string()),
        Err(err) => err.into(),
    }
}

// -------- Admin --------

#[derive(Debug, Deserialize)]
struct AdminPartnersQuery {
    kyc: Option<String>,
}

async fn admin_partners(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Query(query): Query<AdminPartnersQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/admin/partners");
    require_role(&context, Role::Admin)?;
    let kyc = match query.kyc.as_deref() {
        None => None,
        Some(raw) => Some(
            KycStatus::from_str(raw)
                .ok_or_else(|| AppError::Validation(format!("unknown kyc status: {raw}")))?,
        ),
    };
    let rows = state.store.partners(kyc).await?;
    let partners: Vec<PartnerProfile> = rows.iter().map(|row| row.profile()).collect();
    Ok(Json(json!({ "partners": partners })))
}

async fn admin_verify_partners(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(selection): Json<PartnerSelection>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/admin/partners/verify");
    require_role(&context, Role::Admin)?;
    let verified = match selection {
        PartnerSelection::All => state.store.verify_all_partners().await?,
        PartnerSelection::Ids { ids } => {
            let mut count = 0u64;
            for user_id in ids {
                if state.store.set_kyc(user_id, KycStatus::Verified).await? {
                    count += 1;
                }
            }
            count
        }
    };
    info!(target = "ecoloop.api", verified, "partners verified");
    Ok(Json(json!({ "verified": verified })))
}

async fn admin_reject_partner(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(user_id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/admin/partners/{user_id}/reject");
    require_role(&context, Role::Admin)?;
    if !state.store.set_kyc(user_id, KycStatus::Rejected).await? {
        return Err(AppError::NotFound("partner not found".to_string()));
    }
    info!(target = "ecoloop.api", user_id, "partner kyc rejected");
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct AdminListingsQuery {
    visibility: Option<String>,
    limit: Option<i64>,
}

async fn admin_listings(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Query(query): Query<AdminListingsQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/admin/listings");
    require_role(&context, Role::Admin)?;
    let visibility = match query.visibility.as_deref() {
        None => None,
        Some(raw) => Some(
            Visibility::from_str(raw)
                .ok_or_else(|| AppError::Validation(format!("unknown visibility: {raw}")))?,
        ),
    };
    let limit = query.limit.unwrap_or(LISTINGS_PAGE_LIMIT).clamp(1, 500);
    let rows = state.store.admin_listings(visibility, limit).await?;
    let listings: Vec<ListingSummary> = rows.iter().map(summarize_listing).collect();
    Ok(Json(json!({ "listings": listings })))
}

async fn admin_hide_listing(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/admin/listings/{id}/hide");
    require_role(&context, Role::Admin)?;
    let visibility = change_visibility(&state, id, lifecycle::hide).await?;
    info!(target = "ecoloop.api", listing_id = id, "listing hidden");
    Ok(Json(json!({ "ok": true, "visibility": visibility.as_str() })))
}

async fn admin_restore_listing(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/admin/listings/{id}/restore");
    require_role(&context, Role::Admin)?;
    let visibility = change_visibility(&state, id, lifecycle::restore).await?;
    info!(target = "ecoloop.api", listing_id = id, "listing restored");
    Ok(Json(json!({ "ok": true, "visibility": visibility.as_str() })))
}

async fn admin_remove_listing(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    crate::metrics::inc_requests("/admin/listings/{id}/remove");
    require_role(&context, Role::Admin)?;
    let visibility = change_visibility(&state, id, lifecycle::remove).await?;
    info!(target = "ecoloop.api", listing_id = id, "listing removed");
    Ok(Json(json!({ "ok": true, "visibility": visibility.as_str() })))
}

/// Soft-moderation shared by hide, restore and remove. Removal is terminal so
/// it skips the from-state check on the write.
async fn change_visibility(
    state: &AppState,
    id: i64,
    check: fn(Visibility) -> Result<Visibility, VisibilityError>,
) -> Result<Visibility, AppError> {
    let row = fetch_listing(state, id).await?;
    let current = row.visibility();
    let target = check(current)?;
    let applied = if target == Visibility::Removed {
        state.store.mark_removed(id).await?
    } else {
        state.store.set_visibility(id, current, target).await?
    };
    if !applied {
        return Err(AppError::Conflict(
            "listing visibility changed concurrently".to_string(),
        ));
    }
    Ok(target)
}

// -------- Errors --------

#[derive(Debug)]
enum AppError {
    Validation(String),
    Conflict(String),
    Forbidden(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, detail) = match self {
            AppError::Validation(detail) => (StatusCode::BAD_REQUEST, "validation_error", detail),
            AppError::Conflict(detail) => (StatusCode::CONFLICT, "conflict", detail),
            AppError::Forbidden(detail) => (StatusCode::FORBIDDEN, "forbidden", detail),
            AppError::NotFound(detail) => (StatusCode::NOT_FOUND, "not_found", detail),
            AppError::Internal(detail) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", detail)
            }
        };
        let payload = ApiError {
            error: code.to_string(),
            detail: Some(detail),
        };
        (status, Json(payload)).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::DuplicateListing => AppError::Conflict("duplicate listing".to_string()),
            StoreError::DuplicatePartner => {
                AppError::Conflict("partner profile already exists".to_string())
            }
            StoreError::Database(err) => {
                error!(target = "ecoloop.api", "database failure: {err}");
                AppError::Internal("storage failure".to_string())
            }
        }
    }
}

impl From<TransitionError> for AppError {
    fn from(value: TransitionError) -> Self {
        let detail = value.to_string();
        match value {
            TransitionError::AlreadyCompleted | TransitionError::AlreadyAccepted => {
                AppError::Conflict(detail)
            }
            TransitionError::AssignedToOther | TransitionError::NotAssigned => {
                AppError::Forbidden(detail)
            }
        }
    }
}

impl From<VisibilityError> for AppError {
    fn from(value: VisibilityError) -> Self {
        AppError::Conflict(value.to_string())
    }
}

fn internal(err: impl std::fmt::Display) -> AppError {
    AppError::Internal(err.to_string())
}

fn require_role(context: &AuthContext, role: Role) -> Result<(), AppError> {
    if context.role == role {
        Ok(())
    } else {
        Err(AppError::Forbidden(format!(
            "requires {} role",
            role.as_str()
        )))
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
