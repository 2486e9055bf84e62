//! Axum + Askama web layer for SponsorHub: login, dashboard and admin pages,
//! static assets, and the authenticated JSON API.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Form, Path as AxumPath, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
    Router,
};
use chrono::Duration;
use serde::Deserialize;
use sponsorhub_core::Sponsor;
use sponsorhub_sync::{open_reconciler, Reconciler, StoreConfig};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod api;
pub mod session;

use session::{Session, SessionStore};

pub const CRATE_NAME: &str = "sponsorhub-web";

/// Upper bound for `SESSION_TTL_HOURS` (one year).
pub const MAX_SESSION_TTL_HOURS: i64 = 24 * 365;

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub bind_addr: String,
    pub port: u16,
    pub admin_email: Option<String>,
    pub admin_password_hash: Option<String>,
    pub session_secret: String,
    pub session_ttl_hours: i64,
    pub cookie_secure: bool,
    pub public_dir: PathBuf,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let session_secret = non_empty("SESSION_SECRET").unwrap_or_else(|| {
            warn!("SESSION_SECRET is not set; sessions will not survive a restart");
            format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
        });
        Self {
            bind_addr: non_empty("BIND_ADDR").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: non_empty("PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(3000),
            admin_email: non_empty("ADMIN_EMAIL").map(|v| v.trim().to_string()),
            admin_password_hash: non_empty("ADMIN_PASSWORD_HASH").map(|v| v.trim().to_string()),
            session_secret,
            session_ttl_hours: non_empty("SESSION_TTL_HOURS")
                .and_then(|v| v.trim().parse().ok())
                .filter(|h: &i64| *h > 0)
                .map(|h| h.min(MAX_SESSION_TTL_HOURS))
                .unwrap_or(24),
            cookie_secure: non_empty("COOKIE_SECURE")
                .is_some_and(|v| matches!(v.trim(), "true" | "1")),
            public_dir: non_empty("PUBLIC_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./public")),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub reconciler: Option<Arc<Reconciler>>,
    pub sessions: Arc<SessionStore>,
    pub config: Arc<WebConfig>,
}

impl AppState {
    pub fn new(reconciler: Option<Reconciler>, config: WebConfig) -> Self {
        let sessions = SessionStore::new(
            config.session_secret.clone(),
            Duration::hours(config.session_ttl_hours),
            config.cookie_secure,
        );
        Self {
            reconciler: reconciler.map(Arc::new),
            sessions: Arc::new(sessions),
            config: Arc::new(config),
        }
    }

    async fn session(&self, headers: &HeaderMap) -> Option<Session> {
        self.sessions.from_headers(headers).await
    }

    async fn check_credentials(&self, email: &str, password: &str) -> bool {
        let (Some(admin_email), Some(hash)) = (
            self.config.admin_email.clone(),
            self.config.admin_password_hash.clone(),
        ) else {
            warn!("login attempted but admin credentials are not configured");
            return false;
        };
        if email.trim() != admin_email {
            return false;
        }
        let password = password.to_string();
        match tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash)).await {
            Ok(Ok(valid)) => valid,
            Ok(Err(err)) => {
                error!(error = %err, "ADMIN_PASSWORD_HASH is not a valid bcrypt hash");
                false
            }
            Err(err) => {
                error!(error = %err, "password check task failed");
                false
            }
        }
    }
}

#[derive(Template)]
#[template(path = "login.html")]
struct LoginTemplate {
    error: bool,
}

#[derive(Debug, Clone)]
struct SponsorView {
    id: String,
    company: String,
    name: String,
    sponsorship_type: String,
    status: String,
    amount: String,
    paid: bool,
}

impl From<&Sponsor> for SponsorView {
    fn from(sponsor: &Sponsor) -> Self {
        let text = |v: &Option<String>| v.clone().unwrap_or_default();
        Self {
            id: sponsor.id_or_placeholder().to_string(),
            company: text(&sponsor.company),
            name: text(&sponsor.name),
            sponsorship_type: text(&sponsor.sponsorship_type),
            status: text(&sponsor.status),
            amount: format!("{:.2}", sponsor.amount),
            paid: sponsor.is_payment_received,
        }
    }
}

#[derive(Template)]
#[template(path = "dashboard.html")]
struct DashboardTemplate {
    email: String,
    persistence: bool,
    sponsors: Vec<SponsorView>,
    total_amount: String,
    paid_count: usize,
}

#[derive(Template)]
#[template(path = "admin.html")]
struct AdminTemplate {
    email: String,
    persistence: bool,
    backups: Vec<String>,
    entries: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct LoginForm {
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
}

#[derive(Debug, Default, Deserialize)]
struct LoginQuery {
    error: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { Redirect::to("/login") }))
        .route("/login", get(login_page).post(login_submit))
        .route("/logout", get(logout))
        .route("/dashboard", get(dashboard_page))
        .route("/admin", get(admin_page))
        .route("/assets/static/{file}", get(static_asset))
        .nest("/api", api::routes())
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let store_config = StoreConfig::from_env()?;
    let web_config = WebConfig::from_env();
    if web_config.admin_email.is_none() || web_config.admin_password_hash.is_none() {
        warn!("ADMIN_EMAIL or ADMIN_PASSWORD_HASH missing; every login will be rejected");
    }

    let reconciler = open_reconciler(&store_config).await?;
    let listener = TcpListener::bind((web_config.bind_addr.as_str(), web_config.port)).await?;
    info!(addr = %listener.local_addr()?, "sponsorhub listening");
    axum::serve(listener, app(AppState::new(reconciler, web_config))).await?;
    Ok(())
}

async fn login_page(Query(query): Query<LoginQuery>) -> Response {
    render_html(LoginTemplate {
        error: query.error.is_some(),
    })
}

async fn login_submit(State(state): State<AppState>, Form(form): Form<LoginForm>) -> Response {
    if !state.check_credentials(&form.email, &form.password).await {
        warn!("rejected admin login");
        return Redirect::to("/login?error=1").into_response();
    }
    let Some(value) = state.sessions.create(form.email.trim()).await else {
        return server_error(anyhow::anyhow!("session signing key rejected"));
    };
    info!(email = %form.email.trim(), "admin logged in");
    (
        [(header::SET_COOKIE, state.sessions.set_cookie(&value))],
        Redirect::to("/dashboard"),
    )
        .into_response()
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(value) = session::cookie_value(&headers) {
        state.sessions.destroy(value).await;
    }
    (
        [(header::SET_COOKIE, state.sessions.clear_cookie())],
        Redirect::to("/login"),
    )
        .into_response()
}

async fn dashboard_page(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(session) = state.session(&headers).await else {
        return Redirect::to("/login").into_response();
    };
    let sponsors = match &state.reconciler {
        Some(reconciler) => match reconciler.store().list_sponsors().await {
            Ok(sponsors) => sponsors,
            Err(err) => return server_error(err.into()),
        },
        None => Vec::new(),
    };
    let total: f64 = sponsors.iter().map(|s| s.amount).sum();
    render_html(DashboardTemplate {
        email: session.email,
        persistence: state.reconciler.is_some(),
        paid_count: sponsors.iter().filter(|s| s.is_payment_received).count(),
        total_amount: format!("{total:.2}"),
        sponsors: sponsors.iter().map(SponsorView::from).collect(),
    })
}

async fn admin_page(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(session) = state.session(&headers).await else {
        return Redirect::to("/login").into_response();
    };
    let (backups, entries) = match &state.reconciler {
        Some(reconciler) => {
            let backups = reconciler.list_backups().await;
            let entries = reconciler.applied_changes(api::APPLIED_CHANGES_LIMIT).await;
            match (backups, entries) {
                (Ok(backups), Ok(entries)) => (backups, entries),
                (Err(err), _) | (_, Err(err)) => return server_error(err.into()),
            }
        }
        None => (Vec::new(), Vec::new()),
    };
    render_html(AdminTemplate {
        email: session.email,
        persistence: state.reconciler.is_some(),
        backups,
        entries,
    })
}

async fn static_asset(State(state): State<AppState>, AxumPath(file): AxumPath<String>) -> Response {
    if !is_plain_file_name(&file) {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    }
    let path = state.config.public_dir.join(&file);
    match tokio::fs::read(&path).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, content_type_for(&path))], bytes).into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && !name.contains(['/', '\\']) && !name.contains("..")
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("html") => "text/html; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = ?err, "page render failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html("Internal server error".to_string()),
    )
        .into_response()
}
