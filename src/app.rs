use crate::cli::CommonArgs;
use crate::duration_cache::{DurationMap, JsonFileCacheStore};
use crate::export;
use crate::probe::ffprobe::FfprobeProber;
use crate::probe::{MediaProber, DEFAULT_PROBE_TIMEOUT_SECS};
use crate::recordings::{
    self, FilterChoices, FilterSelection, FilteredView, RecordingRow,
    RecordingStats,
};
use crate::scheduler::{
    ResolveSummary, ResolverConfig, DEFAULT_BATCH_SIZE, DEFAULT_MAX_WORKERS,
};
use crate::AppState;
use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Redirect},
    routing::{get, post},
    Json, Router,
};
use chrono_tz::Tz;
use clap::Parser;
use serde::Serialize;
use std::env;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use tera::{Context as TeraContext, Tera};
use tower_http::compression::predicate::{
    NotForContentType, Predicate, SizeAbove,
};
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{prelude::*, Registry};
use tracing_tree::HierarchicalLayer;

// Add build-time information
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

type ApiError = (StatusCode, String);

fn internal_error(e: anyhow::Error) -> ApiError {
    error!("Request failed: {:#}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

// Health check endpoint
#[instrument]
pub async fn health_check() -> &'static str {
    debug!("Health check requested");
    "OK"
}

fn get_build_info() -> String {
    fn clean(value: Option<String>) -> Option<String> {
        value
            .map(|v| v.trim().to_owned())
            .filter(|v| !v.is_empty() && v != "unknown")
    }

    let clean_env = |key: &str| clean(env::var(key).ok());
    let clean_opt = |value: Option<&str>| clean(value.map(|v| v.to_string()));

    let mut parts = Vec::new();
    parts.push(format!("Version {}", built_info::PKG_VERSION));

    if let Some(tag) = clean_env("APP_BUILD_TAG") {
        parts.push(format!("Image {}", tag));
    }
    if let Some(commit) = clean_env("APP_BUILD_COMMIT") {
        let short: String = commit.chars().take(12).collect();
        parts.push(format!("Commit {}", short));
    }
    if let Some(time) = clean(Some(built_info::BUILT_TIME_UTC.to_string())) {
        parts.push(format!("Built {}", time));
    }
    if let Some(profile) = clean(Some(built_info::PROFILE.to_string())) {
        parts.push(format!("Profile {}", profile));
    }
    if let Some(ci_platform) = clean_opt(built_info::CI_PLATFORM) {
        parts.push(format!("CI {}", ci_platform));
    }
    if let Some(rustc_version) =
        clean(Some(built_info::RUSTC_VERSION.to_string()))
    {
        parts.push(format!("Rustc {}", rustc_version));
    }

    parts.join(" • ")
}

static TEMPLATES: OnceLock<Tera> = OnceLock::new();

fn init_templates() -> Tera {
    let mut tera = Tera::default();
    tera.add_raw_templates(vec![
        ("base.html", include_str!("templates/base.html")),
        ("recordings.html", include_str!("templates/recordings.html")),
    ])
    .expect("built-in templates must parse");
    tera
}

pub fn ensure_templates() {
    TEMPLATES.get_or_init(init_templates);
}

fn templates() -> &'static Tera {
    TEMPLATES.get_or_init(init_templates)
}

/// One row as the page and the JSON API show it.
#[derive(Debug, Serialize)]
struct RecordingView<'a> {
    id: &'a str,
    organization: &'a str,
    student: &'a str,
    activity: &'a str,
    topic: &'a str,
    audio_url: Option<&'a str>,
    created_at: String,
    created_at_local: String,
    duration_ms: i64,
    duration_display: String,
    transcript: Option<&'a str>,
}

fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    let (hours, minutes, secs) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{}:{:02}", minutes, secs)
    }
}

fn recording_view<'a>(
    row: &'a RecordingRow,
    durations: &DurationMap,
    timezone: Tz,
) -> RecordingView<'a> {
    let seconds = recordings::duration_seconds(row, durations);
    RecordingView {
        id: &row.id,
        organization: &row.org_name,
        student: &row.student_name,
        activity: &row.activity_name,
        topic: &row.topic_name,
        audio_url: row.audio_url.as_deref(),
        created_at: row.created_at.to_rfc3339(),
        created_at_local: row
            .created_at
            .with_timezone(&timezone)
            .format("%Y-%m-%d %H:%M")
            .to_string(),
        duration_ms: recordings::duration_ms(row, durations),
        duration_display: format_duration(seconds),
        transcript: row.transcript.as_deref(),
    }
}

// Re-encodes the effective selection for export links.
fn selection_query(selection: &FilterSelection) -> String {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    let fields = [
        ("organization", &selection.organization),
        ("student", &selection.student),
        ("activity", &selection.activity),
        ("topic", &selection.topic),
        ("date_start", &selection.date_start),
        ("date_end", &selection.date_end),
    ];
    for (key, value) in fields {
        if let Some(value) = value {
            query.append_pair(key, value);
        }
    }
    query.finish()
}

fn filter_view<'a>(
    rows: &'a [RecordingRow],
    requested: &FilterSelection,
    timezone: Tz,
) -> Result<FilteredView<'a>, ApiError> {
    recordings::apply_filters(rows, requested, timezone)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
}

fn render_page(context: &TeraContext) -> Html<String> {
    let rendered = templates()
        .render("recordings.html", context)
        .unwrap_or_else(|e| format!("Template error: {}", e));
    Html(rendered)
}

#[axum::debug_handler]
async fn recordings_page(
    State(state): State<Arc<AppState>>,
    Query(requested): Query<FilterSelection>,
) -> Html<String> {
    let mut context = TeraContext::new();
    context.insert("build_info", &get_build_info());
    context.insert("timezone", &state.timezone.name());

    let rows = match state.recordings().await {
        Ok(rows) => rows,
        Err(e) => {
            error!("Failed to load recordings: {:#}", e);
            context.insert("error", &format!("{:#}", e));
            return render_page(&context);
        }
    };
    let view = match recordings::apply_filters(&rows, &requested, state.timezone)
    {
        Ok(view) => view,
        Err(e) => {
            warn!("Rejected filter selection: {:#}", e);
            context.insert("error", &e.to_string());
            return render_page(&context);
        }
    };

    let durations = state.durations.snapshot().await;
    let stats = recordings::compute_stats(&view.rows, &durations);
    let row_views: Vec<RecordingView> = view
        .rows
        .iter()
        .map(|row| recording_view(row, &durations, state.timezone))
        .collect();

    context.insert("error", &Option::<String>::None);
    context.insert("selection", &view.selection);
    context.insert("choices", &view.choices);
    context.insert("stats", &stats);
    context.insert("rows", &row_views);
    context.insert("total_count", &rows.len());
    context.insert("query", &selection_query(&view.selection));
    render_page(&context)
}

#[derive(Debug, Serialize)]
struct RecordingsResponse<'a> {
    selection: FilterSelection,
    choices: FilterChoices,
    stats: RecordingStats,
    total_count: usize,
    filtered_count: usize,
    recordings: Vec<RecordingView<'a>>,
}

#[axum::debug_handler]
async fn get_recordings(
    State(state): State<Arc<AppState>>,
    Query(requested): Query<FilterSelection>,
) -> Result<impl IntoResponse, ApiError> {
    let rows = state.recordings().await.map_err(internal_error)?;
    let view = filter_view(&rows, &requested, state.timezone)?;
    let durations = state.durations.snapshot().await;

    let response = RecordingsResponse {
        stats: recordings::compute_stats(&view.rows, &durations),
        total_count: rows.len(),
        filtered_count: view.rows.len(),
        recordings: view
            .rows
            .iter()
            .map(|row| recording_view(row, &durations, state.timezone))
            .collect(),
        selection: view.selection,
        choices: view.choices,
    };
    // Serialized here because the views borrow the snapshot.
    Ok(Json(serde_json::to_value(&response).map_err(|e| {
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?))
}

fn attachment_headers(
    content_type: &'static str,
    file_name: &str,
) -> [(header::HeaderName, String); 2] {
    [
        (header::CONTENT_TYPE, content_type.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", file_name),
        ),
    ]
}

#[axum::debug_handler]
async fn get_recording_urls(
    State(state): State<Arc<AppState>>,
    Query(requested): Query<FilterSelection>,
) -> Result<impl IntoResponse, ApiError> {
    let rows = state.recordings().await.map_err(internal_error)?;
    let view = filter_view(&rows, &requested, state.timezone)?;
    let body = export::url_list(&view.rows);

    Ok((
        attachment_headers(
            "text/plain; charset=utf-8",
            export::URL_LIST_FILE_NAME,
        ),
        body,
    ))
}

#[axum::debug_handler]
async fn get_recordings_csv(
    State(state): State<Arc<AppState>>,
    Query(requested): Query<FilterSelection>,
) -> Result<impl IntoResponse, ApiError> {
    let rows = state.recordings().await.map_err(internal_error)?;
    let view = filter_view(&rows, &requested, state.timezone)?;
    let durations = state.durations.snapshot().await;
    let body =
        export::csv_export(&view.rows, &durations).map_err(internal_error)?;

    Ok((
        attachment_headers("text/csv; charset=utf-8", export::CSV_FILE_NAME),
        body,
    ))
}

async fn resolve_filtered(
    state: &AppState,
    requested: &FilterSelection,
) -> Result<ResolveSummary, ApiError> {
    let rows = state.recordings().await.map_err(internal_error)?;
    let urls: Vec<String> = {
        let view = filter_view(&rows, requested, state.timezone)?;
        view.rows
            .iter()
            .filter_map(|row| row.audio_url.clone())
            .collect()
    };
    info!("Resolving durations for {} filtered recordings", urls.len());

    state
        .durations
        .resolve(&urls)
        .await
        .map_err(|e| internal_error(e.into()))
}

// Where the page forms land after a POST: the page with the same filters.
fn back_to_page(requested: &FilterSelection) -> Redirect {
    let query = selection_query(requested);
    if query.is_empty() {
        Redirect::to("/")
    } else {
        Redirect::to(&format!("/?{}", query))
    }
}

#[axum::debug_handler]
async fn resolve_durations(
    State(state): State<Arc<AppState>>,
    Query(requested): Query<FilterSelection>,
) -> Result<Json<ResolveSummary>, ApiError> {
    Ok(Json(resolve_filtered(&state, &requested).await?))
}

#[axum::debug_handler]
async fn resolve_durations_form(
    State(state): State<Arc<AppState>>,
    Query(requested): Query<FilterSelection>,
) -> Result<Redirect, ApiError> {
    let summary = resolve_filtered(&state, &requested).await?;
    debug!("Form resolve finished: {:?}", summary);
    Ok(back_to_page(&requested))
}

#[axum::debug_handler]
async fn refresh_recordings(
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    state.invalidate_recordings().await;
    StatusCode::NO_CONTENT
}

#[axum::debug_handler]
async fn refresh_recordings_form(
    State(state): State<Arc<AppState>>,
    Query(requested): Query<FilterSelection>,
) -> Redirect {
    state.invalidate_recordings().await;
    back_to_page(&requested)
}

pub fn routes(state: Arc<AppState>) -> Router {
    let predicate = SizeAbove::new(32)
        // still don't compress gRPC
        .and(NotForContentType::GRPC)
        // still don't compress images
        .and(NotForContentType::IMAGES);

    let compression_layer = CompressionLayer::new()
        .br(true)
        .deflate(true)
        .gzip(true)
        .zstd(true)
        .compress_when(predicate);

    Router::new()
        .route("/", get(recordings_page))
        .route("/health", get(health_check))
        .route("/api/recordings", get(get_recordings))
        .route("/api/recordings/urls", get(get_recording_urls))
        .route("/api/recordings/csv", get(get_recordings_csv))
        .route("/api/durations/resolve", post(resolve_durations))
        .route("/api/refresh", post(refresh_recordings))
        .route("/durations/resolve", post(resolve_durations_form))
        .route("/refresh", post(refresh_recordings_form))
        .layer(compression_layer)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// Port to listen on
    #[arg(long, default_value_t = 3010)]
    port: u16,

    /// Host address to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Maximum concurrent ffprobe processes
    #[arg(long, default_value_t = DEFAULT_MAX_WORKERS)]
    max_workers: usize,

    /// URLs probed between cache saves
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Per-file probe timeout in seconds
    #[arg(long, default_value_t = DEFAULT_PROBE_TIMEOUT_SECS)]
    timeout: u64,
}

pub async fn serve() -> Result<()> {
    // Initialize logging with tracing
    let subscriber = Registry::default()
        .with(
            HierarchicalLayer::new(2)
                .with_targets(true)
                .with_bracketed_fields(true),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        );

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    // Parse command line arguments
    let args = Args::parse();

    info!("Starting audio browser");

    let recordings_pool =
        crate::db::create_pool(&args.common.database_url, true)?;

    let prober = FfprobeProber::new(
        args.common.ffprobe_path.clone(),
        Duration::from_secs(args.timeout),
        args.common.domains(),
    );
    // Browsing works without ffprobe; only probing needs it.
    if let Err(e) = prober.ensure_available().await {
        warn!("{}", e);
    }

    let cache_store = JsonFileCacheStore::in_dir(&args.common.cache_dir);
    info!("Duration cache at {}", cache_store.path().display());

    let state = crate::create_app_state(crate::AppConfig {
        recordings_pool,
        prober: Arc::new(prober),
        cache_store: Arc::new(cache_store),
        resolver_config: ResolverConfig {
            max_workers: args.max_workers,
            batch_size: args.batch_size,
            retry_failed: false,
        },
        timezone_str: args.common.timezone.clone(),
    });
    info!("Using timezone {}", state.timezone.name());

    // Initialize templates
    ensure_templates();

    // Start web server
    let app = routes(state);
    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server running on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("Received CTRL-C, shutting down");
            }
        })
        .await?;

    info!("Server shutdown complete");
    Ok(())
}
