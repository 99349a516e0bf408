use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use textmatch_api::config::Config;
use textmatch_api::feeds::SessionFeeds;
use textmatch_api::middleware::{decode_session, require_auth};
use textmatch_api::state::{AppState, AppStateInner};
use textmatch_api::{conversations, listings, messages, notifications, profiles, push_tokens, trades};
use textmatch_db::Database;
use textmatch_gateway::{FeedSource, connection};
use textmatch_gateway::email::{HttpEmailGateway, LogEmailGateway};
use textmatch_gateway::push::{FcmPushGateway, NoopPushGateway};
use textmatch_gateway::{Dispatcher, EmailGateway, PushGateway};

/// Target prefixes, so `textmatch` covers every workspace crate.
const DEFAULT_LOG_FILTER: &str = "textmatch=debug,tower_http=debug";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: {:#}", e);
            eprintln!("       Set it in your .env file and restart.");
            std::process::exit(1);
        }
    };

    let db = Arc::new(Database::open(&config.db_path)?);

    let push: Arc<dyn PushGateway> = match &config.fcm_credentials {
        Some(path) => {
            info!("Push delivery via FCM ({})", path.display());
            Arc::new(FcmPushGateway::from_file(path)?)
        }
        None => {
            warn!("TEXTMATCH_FCM_CREDENTIALS not set, push delivery disabled");
            Arc::new(NoopPushGateway)
        }
    };
    let email: Arc<dyn EmailGateway> = match &config.email_endpoint {
        Some(endpoint) => Arc::new(HttpEmailGateway::new(
            endpoint.clone(),
            config.email_api_key.clone(),
            config.email_from.clone(),
        )),
        None => {
            warn!("TEXTMATCH_EMAIL_ENDPOINT not set, emails are only logged");
            Arc::new(LogEmailGateway)
        }
    };

    let state: AppState = Arc::new(AppStateInner::new(db, Dispatcher::new(), push, email, &config));
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Textmatch server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    let protected_routes = Router::new()
        // Listings
        .route("/listings", post(listings::create_listing).get(listings::list_recent))
        .route("/listings/{id}", get(listings::get_listing).delete(listings::delete_listing))
        .route("/listings/{id}/status", post(listings::update_status))
        .route("/listings/{id}/transaction", post(listings::advance_transaction))
        .route("/listings/{id}/views", post(listings::record_view))
        .route(
            "/listings/{id}/favorite",
            put(listings::add_favorite).delete(listings::remove_favorite),
        )
        .route("/listings/{id}/paid", post(trades::mark_paid))
        .route("/me", put(profiles::update_me))
        .route("/me/favorites", get(listings::my_favorites))
        .route("/me/selling", get(listings::my_selling))
        .route("/me/purchases", get(listings::my_purchases))
        .route("/me/trading", get(listings::my_trading))
        // Admin
        .route(
            "/admin/listings/{id}",
            delete(listings::hard_delete_listing).patch(listings::moderate_listing),
        )
        .route("/admin/listings/{id}/status", post(listings::override_status))
        // Conversations
        .route(
            "/conversations",
            post(conversations::create_or_get).get(conversations::list_conversations),
        )
        .route("/conversations/unread", get(messages::unread_total))
        .route("/conversations/{id}", get(conversations::get_conversation))
        .route(
            "/conversations/{id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route("/conversations/{id}/read", post(messages::mark_read))
        .route("/conversations/{id}/sell", post(trades::sell))
        .route("/conversations/{id}/receipt", post(trades::confirm_receipt))
        // Notifications
        .route("/notifications", get(notifications::list_notifications))
        .route("/notifications/unread", get(notifications::unread_count))
        .route("/notifications/read", post(notifications::mark_read))
        .route("/notifications/{id}/read", post(notifications::mark_one_read))
        .route("/notifications/{id}", delete(notifications::delete_notification))
        // Push
        .route("/push/settings", get(push_tokens::get_settings))
        .route("/push/token", put(push_tokens::save_token))
        .route("/push/toggle", post(push_tokens::toggle))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state.clone());

    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/gateway", get(ws_upgrade))
        .with_state(state);

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Browsers cannot set headers on a WebSocket handshake, so the token rides in the query.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let session = match params
        .get("token")
        .and_then(|token| decode_session(token, &state.jwt_secret))
    {
        Some(session) => session,
        None => return StatusCode::UNAUTHORIZED.into_response(),
    };

    let (user_id, display_name) = (session.user_id.clone(), session.display_name.clone());
    let feeds: Arc<dyn FeedSource> = Arc::new(SessionFeeds::new(&state, session));
    ws.on_upgrade(move |socket| connection::handle_connection(socket, feeds, user_id, display_name))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
