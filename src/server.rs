use crate::config::{AppConfig, UserConfig};
use crate::data;
use crate::filters::{self, FilterSelection};
use crate::query::{self, AreaEnvelope, Predicate};
use crate::session::{QueryRecord, Session, SessionStore};
use crate::types::{EnumerationArea, Role, SurveyPoint};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use geo::bounding_rect::BoundingRect;
use geojson::{Feature, FeatureCollection, Geometry, JsonObject};
use rstar::RTree;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{error, info};

pub struct AppState {
    pub areas: Vec<EnumerationArea>,
    pub tree: RTree<AreaEnvelope>,
    pub users: HashMap<String, UserConfig>,
    pub sessions: SessionStore,
    pub default_points: Option<Vec<SurveyPoint>>,
}

const SESSION_HEADER: &str = "x-session-token";

/// API error carried back to the frontend as `{"error": "..."}`.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "Invalid login or password".to_string(),
        }
    }

    fn no_session() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "Not logged in".to_string(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn bad_gateway(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        error!("internal error: {:#}", err);
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{}", err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

#[derive(Deserialize)]
pub struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    token: String,
    username: String,
    role: Role,
    regions: Vec<String>,
}

#[derive(Serialize)]
pub struct AreasResponse {
    count: usize,
    bounds: Option<[f64; 4]>,
    areas: FeatureCollection,
}

#[derive(Serialize)]
pub struct PointsResponse {
    loaded: usize,
    skipped: usize,
}

#[derive(Deserialize)]
pub struct DriveRequest {
    url: String,
}

#[derive(Deserialize)]
pub struct QueryRequest {
    predicate: Predicate,
    #[serde(flatten)]
    selection: FilterSelection,
}

#[derive(Serialize)]
pub struct QueryResponse {
    count: usize,
    points: FeatureCollection,
}

#[derive(Serialize)]
pub struct PopulationRow {
    num_se: String,
    pop_se: u32,
}

pub async fn start_server(config: AppConfig, areas: Vec<EnumerationArea>) -> Result<()> {
    info!(areas = areas.len(), "building spatial index");
    let tree = query::build_index(&areas);

    let default_points = match &config.input.points_csv {
        Some(source) => match data::load_points(source).await {
            Ok(points) => Some(points),
            Err(err) => {
                // Default points are a convenience; the dashboard still
                // works with per-session uploads.
                error!("default point CSV unavailable: {:#}", err);
                None
            }
        },
        None => None,
    };

    let users: HashMap<String, UserConfig> = config
        .auth
        .users
        .iter()
        .map(|u| (u.username.clone(), u.clone()))
        .collect();

    let state = Arc::new(AppState {
        areas,
        tree,
        users,
        sessions: SessionStore::new(),
        default_points,
    });

    let host: IpAddr = config
        .server
        .host
        .parse()
        .with_context(|| format!("Invalid server host: {}", config.server.host))?;
    let addr = SocketAddr::new(host, config.server.port);

    let app = Router::new()
        .route("/api/login", post(login_handler))
        .route("/api/logout", post(logout_handler))
        .route("/api/regions", get(regions_handler))
        .route("/api/cercles", get(cercles_handler))
        .route("/api/communes", get(communes_handler))
        .route("/api/se", get(se_handler))
        .route("/api/areas", get(areas_handler))
        .route("/api/population", get(population_handler))
        .route("/api/points", post(upload_points_handler))
        .route("/api/points/drive", post(drive_points_handler))
        .route("/api/query", post(query_handler))
        .fallback_service(ServeDir::new(&config.server.static_dir))
        .layer(CorsLayer::permissive())
        .with_state(state);

    info!("starting server on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<Session, ApiError> {
    let token = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(ApiError::no_session)?;
    state.sessions.get(token).ok_or_else(ApiError::no_session)
}

fn session_token(headers: &HeaderMap) -> Option<&str> {
    headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok())
}

async fn login_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let user = state
        .users
        .get(&request.username)
        .filter(|u| u.password == request.password)
        .ok_or_else(ApiError::unauthorized)?;

    let token = state
        .sessions
        .open(&user.username, user.role, user.regions.clone());
    info!(username = %user.username, "login");

    Ok(Json(LoginResponse {
        token,
        username: user.username.clone(),
        role: user.role,
        regions: user.regions.clone(),
    }))
}

async fn logout_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    if let Some(token) = session_token(&headers) {
        state.sessions.close(token);
    }
    Ok(Json(json!({ "ok": true })))
}

async fn regions_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<String>>, ApiError> {
    let session = authorize(&state, &headers)?;
    Ok(Json(filters::accessible_regions(
        &state.areas,
        session.role,
        &session.regions,
    )))
}

async fn cercles_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(selection): Query<FilterSelection>,
) -> Result<Json<Vec<String>>, ApiError> {
    let session = authorize(&state, &headers)?;
    let hits = filters::select(&state.areas, &selection, session.role, &session.regions);
    Ok(Json(filters::unique_clean(
        hits.iter().map(|a| a.cercle.as_str()),
    )))
}

async fn communes_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(selection): Query<FilterSelection>,
) -> Result<Json<Vec<String>>, ApiError> {
    let session = authorize(&state, &headers)?;
    let hits = filters::select(&state.areas, &selection, session.role, &session.regions);
    Ok(Json(filters::unique_clean(
        hits.iter().map(|a| a.commune.as_str()),
    )))
}

async fn se_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(selection): Query<FilterSelection>,
) -> Result<Json<Vec<String>>, ApiError> {
    let session = authorize(&state, &headers)?;
    let hits = filters::select(&state.areas, &selection, session.role, &session.regions);
    Ok(Json(filters::unique_clean(
        hits.iter().map(|a| a.num_se.as_str()),
    )))
}

async fn areas_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(selection): Query<FilterSelection>,
) -> Result<Json<AreasResponse>, ApiError> {
    let session = authorize(&state, &headers)?;
    let hits = filters::select(&state.areas, &selection, session.role, &session.regions);

    let features: Vec<Feature> = hits.iter().map(|a| area_feature(a)).collect();
    let bounds = total_bounds(&hits);

    Ok(Json(AreasResponse {
        count: features.len(),
        bounds,
        areas: FeatureCollection {
            bbox: None,
            features,
            foreign_members: None,
        },
    }))
}

async fn population_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(selection): Query<FilterSelection>,
) -> Result<Json<Vec<PopulationRow>>, ApiError> {
    let session = authorize(&state, &headers)?;
    let hits = filters::select(&state.areas, &selection, session.role, &session.regions);

    let mut rows: Vec<PopulationRow> = hits
        .iter()
        .map(|a| PopulationRow {
            num_se: a.num_se.clone(),
            pop_se: a.pop_se,
        })
        .collect();
    rows.sort_by(|a, b| a.num_se.cmp(&b.num_se));
    Ok(Json(rows))
}

async fn upload_points_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<PointsResponse>, ApiError> {
    authorize(&state, &headers)?;
    let token = session_token(&headers).ok_or_else(ApiError::no_session)?;

    let (points, skipped) =
        data::parse_points_csv(&body).map_err(|e| ApiError::bad_request(format!("{}", e)))?;
    let loaded = points.len();
    state.sessions.set_points(token, points);
    info!(loaded, skipped, "points uploaded");

    Ok(Json(PointsResponse { loaded, skipped }))
}

async fn drive_points_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<DriveRequest>,
) -> Result<Json<PointsResponse>, ApiError> {
    authorize(&state, &headers)?;
    let token = session_token(&headers).ok_or_else(ApiError::no_session)?;

    let url =
        data::drive_download_url(&request.url).map_err(|e| ApiError::bad_request(format!("{}", e)))?;
    let bytes = data::fetch_bytes(&url)
        .await
        .map_err(|e| ApiError::bad_gateway(format!("Failed to load CSV: {}", e)))?;
    let (points, skipped) =
        data::parse_points_csv(&bytes).map_err(|e| ApiError::bad_request(format!("{}", e)))?;
    let loaded = points.len();
    state.sessions.set_points(token, points);
    info!(loaded, skipped, "points loaded from Google Drive");

    Ok(Json(PointsResponse { loaded, skipped }))
}

async fn query_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    let session = authorize(&state, &headers)?;
    let token = session_token(&headers).ok_or_else(ApiError::no_session)?;

    let selected: HashSet<usize> = state
        .areas
        .iter()
        .enumerate()
        .filter(|(_, a)| filters::region_allowed(session.role, &session.regions, &a.region))
        .filter(|(_, a)| request.selection.matches(a))
        .map(|(i, _)| i)
        .collect();
    if selected.is_empty() {
        return Err(ApiError::bad_request("No polygons match the selection"));
    }

    let points = session
        .points
        .as_ref()
        .or(state.default_points.as_ref())
        .ok_or_else(|| ApiError::bad_request("No point data available"))?;

    let pairs = query::spatial_join(points, &state.areas, &state.tree, &selected, request.predicate);
    info!(
        predicate = ?request.predicate,
        matches = pairs.len(),
        "spatial query"
    );

    let features: Vec<Feature> = pairs
        .iter()
        .map(|pair| point_feature(&points[pair.point_index], &state.areas[pair.area_index]))
        .collect();

    state.sessions.set_last_query(
        token,
        QueryRecord {
            predicate: request.predicate,
            pairs: pairs.clone(),
        },
    );

    Ok(Json(QueryResponse {
        count: pairs.len(),
        points: FeatureCollection {
            bbox: None,
            features,
            foreign_members: None,
        },
    }))
}

fn area_feature(area: &EnumerationArea) -> Feature {
    let mut properties = JsonObject::new();
    properties.insert("region".to_string(), json!(area.region));
    properties.insert("cercle".to_string(), json!(area.cercle));
    properties.insert("commune".to_string(), json!(area.commune));
    properties.insert("num_se".to_string(), json!(area.num_se));
    properties.insert("pop_se".to_string(), json!(area.pop_se));
    properties.insert("men_se".to_string(), json!(area.men_se));

    Feature {
        bbox: None,
        geometry: Some(Geometry::new(geojson::Value::from(&area.geometry))),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}

fn point_feature(point: &SurveyPoint, area: &EnumerationArea) -> Feature {
    let mut properties = JsonObject::new();
    for (key, value) in &point.attributes {
        properties.insert(key.clone(), json!(value));
    }
    properties.insert("num_se".to_string(), json!(area.num_se));

    Feature {
        bbox: None,
        geometry: Some(Geometry::new(geojson::Value::from(&point.point))),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}

/// `[minx, miny, maxx, maxy]` over the selection, None when empty.
fn total_bounds(areas: &[&EnumerationArea]) -> Option<[f64; 4]> {
    let mut bounds: Option<[f64; 4]> = None;
    for area in areas {
        let rect = match area.geometry.bounding_rect() {
            Some(rect) => rect,
            None => continue,
        };
        bounds = Some(match bounds {
            None => [rect.min().x, rect.min().y, rect.max().x, rect.max().y],
            Some([minx, miny, maxx, maxy]) => [
                minx.min(rect.min().x),
                miny.min(rect.min().y),
                maxx.max(rect.max().x),
                maxy.max(rect.max().y),
            ],
        });
    }
    bounds
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{polygon, MultiPolygon};

    fn area(x0: f64, y0: f64, x1: f64, y1: f64) -> EnumerationArea {
        let p = polygon![
            (x: x0, y: y0),
            (x: x1, y: y0),
            (x: x1, y: y1),
            (x: x0, y: y1),
            (x: x0, y: y0),
        ];
        EnumerationArea {
            region: "Kayes".to_string(),
            cercle: "Kita".to_string(),
            commune: "Kita Nord".to_string(),
            num_se: "001".to_string(),
            pop_se: 420,
            men_se: Some(61),
            geometry: MultiPolygon::new(vec![p]),
        }
    }

    #[test]
    fn total_bounds_merges_rectangles() {
        let a = area(0.0, 0.0, 1.0, 1.0);
        let b = area(2.0, -1.0, 3.0, 4.0);
        let bounds = total_bounds(&[&a, &b]).unwrap();
        assert_eq!(bounds, [0.0, -1.0, 3.0, 4.0]);
    }

    #[test]
    fn total_bounds_of_nothing_is_none() {
        assert!(total_bounds(&[]).is_none());
    }

    #[test]
    fn area_feature_carries_the_tooltip_properties() {
        let a = area(0.0, 0.0, 1.0, 1.0);
        let feature = area_feature(&a);
        let props = feature.properties.unwrap();
        assert_eq!(props.get("num_se").unwrap(), "001");
        assert_eq!(props.get("pop_se").unwrap(), 420);
        assert_eq!(props.get("men_se").unwrap(), 61);
        assert!(feature.geometry.is_some());
    }
}
