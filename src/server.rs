//! HTTP surface: routes every tile request through the layer registry, the query
//! builder and the executor, and renders the JSON envelope for everything else.
use crate::error::{Error, Result};
use crate::executor::{TileExecutor, TileResult};
use crate::layers::{FilterContract, LayerDescriptor, LayerRegistry};
use crate::query::{self, FilterParameters};
use crate::{TileCoordinate, TileSource};

use std::sync::Arc;

use axum::{
    extract::{rejection::PathRejection, OriginalUri, Path, State},
    http::{header, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tower_http::{
    cors::{Any, CorsLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::{debug, error};

pub const TILE_CONTENT_TYPE: &str = "application/x-protobuf";
/// One day, applied to every response.
pub const CACHE_CONTROL: &str = "max-age=86400";

const TILE_SUFFIX: &str = ".pbf";

/// Process-wide resources shared by all requests.
pub struct AppState<S> {
    pub layers: Arc<LayerRegistry>,
    pub executor: TileExecutor<S>,
}

impl<S: TileSource> AppState<S> {
    pub fn new(layers: LayerRegistry, executor: TileExecutor<S>) -> AppState<S> {
        AppState {
            layers: Arc::new(layers),
            executor,
        }
    }
}

/// A tile request resolved against the registry.
#[derive(Debug)]
pub struct TileRequest<'a> {
    pub layer: &'a LayerDescriptor,
    pub coordinate: TileCoordinate,
    pub filters: FilterParameters,
}

fn parse_index<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.parse::<T>().map_err(|_| {
        Error::InvalidCoordinate(format!("{} '{}' is not a valid tile index", name, value))
    })
}

impl<'a> TileRequest<'a> {
    /// Parses `<route>/<z>/<x>/<y>.pbf[/<token>[/<filters>...]]`.
    ///
    /// Shapes that match no layer yield [`Error::NotFound`] carrying `request_path`.
    pub fn parse(
        layers: &'a LayerRegistry,
        request_path: &str,
        tile_path: &str,
    ) -> Result<TileRequest<'a>> {
        let not_found = || Error::NotFound(request_path.to_owned());

        let segments: Vec<&str> = tile_path.trim_start_matches('/').split('/').collect();
        if segments.len() < 4 {
            return Err(not_found());
        }

        let layer = layers.by_route(segments[0]).ok_or_else(not_found)?;
        let row = segments[3].strip_suffix(TILE_SUFFIX).ok_or_else(not_found)?;
        let extra = &segments[4..];
        if extra.len() > layer.filter.max_path_segments() {
            return Err(not_found());
        }

        let coordinate = TileCoordinate::new(
            parse_index("zoom", segments[1])?,
            parse_index("column", segments[2])?,
            parse_index("row", row)?,
        )?;

        // The first extra segment is the access token; it is not checked.
        let segment = |i: usize| extra.get(i).copied();
        let filters = match &layer.filter {
            FilterContract::None => FilterParameters::default(),
            FilterContract::CropType { .. } => FilterParameters::new(segment(1), None),
            FilterContract::StateAndCropType { .. } => {
                FilterParameters::new(segment(2), segment(1))
            }
        };

        Ok(TileRequest {
            layer,
            coordinate,
            filters,
        })
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    path: &'a str,
    date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<'a> Envelope<'a> {
    fn message(path: &'a str, message: &'a str) -> Envelope<'a> {
        Envelope {
            path,
            date: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            message: Some(message),
            error: None,
        }
    }

    fn error(path: &'a str, error: String) -> Envelope<'a> {
        Envelope {
            path,
            date: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            message: None,
            error: Some(error),
        }
    }
}

fn request_path(uri: &Uri) -> &str {
    uri.path_and_query()
        .map(|p| p.as_str())
        .unwrap_or_else(|| uri.path())
}

fn error_response(path: &str, err: &Error) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if let Some(kind) = err.store_kind() {
        error!(path, %kind, error = %err, "tile request failed");
    } else if status.is_server_error() {
        error!(path, error = %err, "tile request failed");
    } else {
        debug!(path, error = %err, status = status.as_u16(), "rejected request");
    }

    (status, Json(Envelope::error(path, err.to_string()))).into_response()
}

fn tile_response(result: TileResult) -> Response {
    let status = if result.is_empty {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::OK
    };

    (
        status,
        [(header::CONTENT_TYPE, TILE_CONTENT_TYPE)],
        result.bytes,
    )
        .into_response()
}

async fn serve_tile<S: TileSource>(
    state: &AppState<S>,
    request_path: &str,
    tile_path: &str,
) -> Result<TileResult> {
    let request = TileRequest::parse(&state.layers, request_path, tile_path)?;
    let bbox = request.coordinate.bounds();
    let query = query::build(request.layer, &bbox, &request.filters)?;

    debug!(
        layer = %request.layer.id,
        tile = %request.coordinate,
        "rendering tile"
    );
    state.executor.execute(&query).await
}

async fn home(OriginalUri(uri): OriginalUri) -> Response {
    (StatusCode::OK, Json(Envelope::message(request_path(&uri), "OK"))).into_response()
}

async fn not_found(OriginalUri(uri): OriginalUri) -> Response {
    let path = request_path(&uri);
    error_response(path, &Error::NotFound(path.to_owned()))
}

async fn tile<S: TileSource + 'static>(
    State(state): State<Arc<AppState<S>>>,
    OriginalUri(uri): OriginalUri,
    tile_path: std::result::Result<Path<String>, PathRejection>,
) -> Response {
    let path = request_path(&uri);
    let Path(tile_path) = match tile_path {
        Ok(tile_path) => tile_path,
        Err(rejection) => {
            return error_response(path, &Error::InvalidFilter(rejection.body_text()));
        }
    };

    match serve_tile(&state, path, &tile_path).await {
        Ok(result) => tile_response(result),
        Err(err) => error_response(path, &err),
    }
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::HEAD,
            Method::PUT,
            Method::POST,
            Method::DELETE,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            header::AUTHORIZATION,
            HeaderName::from_static("x-requested-with"),
        ])
}

/// Builds the application router around shared state.
pub fn router<S: TileSource + 'static>(state: Arc<AppState<S>>) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/tiles/*path", get(tile::<S>))
        .fallback(not_found)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static(CACHE_CONTROL),
        ))
}
