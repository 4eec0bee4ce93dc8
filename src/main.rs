use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use unified_inbox::adapters::{Adapter, ChatDriver, DirectMessageDriver, EmailDriver, ManagedAdapter};
use unified_inbox::config::InboxConfig;
use unified_inbox::events::EventBus;
use unified_inbox::inbox::Inbox;
use unified_inbox::transport::{self, GmailApi, SlackApi, TwilioConversationsApi};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = InboxConfig::from_env().context("invalid configuration")?;

    // ── Tracing ─────────────────────────────────────────────────────────
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let (file_layer, _file_guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "unified-inbox.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Unified inbox starting");

    if config.is_empty() {
        warn!("No platform configured; set GMAIL_ACCESS_TOKEN, SLACK_BOT_TOKEN or TWILIO_ACCOUNT_SID");
        return Ok(());
    }

    // ── Consumers ───────────────────────────────────────────────────────
    let bus = EventBus::new();
    let (inbox, _) = Inbox::attached(&bus);
    bus.on_message(|msg| {
        info!(
            platform = %msg.platform,
            id = %msg.id,
            sender = %msg.sender,
            priority = %msg.priority,
            "New message"
        );
        Ok(())
    });

    // ── Adapters ────────────────────────────────────────────────────────
    let sync = &config.sync;
    let client = transport::http_client(sync.request_timeout).context("failed to build HTTP client")?;
    let mut adapters: Vec<Arc<dyn Adapter>> = Vec::new();
    let mut webhooks = Router::new();

    if let Some(gmail) = &config.gmail {
        let api = GmailApi::new(client.clone(), gmail, sync.request_timeout);
        let driver = EmailDriver::new(api, gmail.from_address.clone()).with_poll_interval(sync.poll_interval);
        adapters.push(Arc::new(ManagedAdapter::with_connect_timeout(
            driver,
            bus.clone(),
            sync.connect_timeout,
        )));
    }

    if let Some(slack) = &config.slack {
        let api = SlackApi::new(client.clone(), slack, sync.request_timeout);
        webhooks = webhooks.merge(api.router());
        adapters.push(Arc::new(ManagedAdapter::with_connect_timeout(
            ChatDriver::new(api),
            bus.clone(),
            sync.connect_timeout,
        )));
    }

    if let Some(twilio) = &config.twilio {
        let api = TwilioConversationsApi::new(client.clone(), twilio, sync.request_timeout);
        webhooks = webhooks.merge(api.router());
        adapters.push(Arc::new(ManagedAdapter::with_connect_timeout(
            DirectMessageDriver::new(api),
            bus.clone(),
            sync.connect_timeout,
        )));
    }

    // ── Webhook server ──────────────────────────────────────────────────
    let server = if config.slack.is_some() || config.twilio.is_some() {
        let app = webhooks.layer(TraceLayer::new_for_http());
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", sync.webhook_port))
            .await
            .with_context(|| format!("failed to bind webhook port {}", sync.webhook_port))?;
        info!(port = sync.webhook_port, "Webhook server started");
        Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "Webhook server stopped");
            }
        }))
    } else {
        None
    };

    // ── Connect ─────────────────────────────────────────────────────────
    let outcomes = futures::future::join_all(adapters.iter().map(|a| a.connect())).await;
    for (adapter, connected) in adapters.iter().zip(outcomes) {
        if connected {
            info!(platform = %adapter.platform(), "Adapter connected");
        } else {
            let last_error = adapter.status().borrow().last_error.clone();
            error!(
                platform = %adapter.platform(),
                error = ?last_error,
                "Adapter failed to connect"
            );
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Shutting down");

    futures::future::join_all(adapters.iter().map(|a| a.disconnect())).await;
    if let Some(server) = server {
        server.abort();
    }

    info!(messages = inbox.len(), unread = inbox.unread_count(), "Stopped");
    Ok(())
}
