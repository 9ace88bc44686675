//! Threshold alerting over per-service log rates. Every minute the engine
//! counts error- and warn-level entries for each enabled config over the
//! trailing minute and, on a transition into breach, records an alert row
//! and notifies by email and webhook. It is the sole writer of the alerts
//! table.

use chrono::Utc;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::config::SmtpSettings;
use crate::error::Result;
use crate::models::alert::AlertConfig;
use crate::models::log::Level;
use crate::store::Store;

const TICK_INTERVAL: Duration = Duration::from_secs(60);

const ERROR_LEVELS: [Level; 3] = [Level::Error, Level::Critical, Level::Fatal];
const WARN_LEVELS: [Level; 1] = [Level::Warn];

fn build_smtp_transport(settings: &SmtpSettings) -> Option<AsyncSmtpTransport<Tokio1Executor>> {
    let host = settings.host.as_deref()?;
    let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(host).ok()?;
    builder = builder.port(settings.port);
    if let (Some(user), Some(pass)) = (&settings.user, &settings.pass) {
        builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
    }
    Some(builder.build())
}

pub fn spawn_alert_engine(
    store: Arc<Store>,
    smtp: SmtpSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let http_client = reqwest::Client::new();
        let smtp_transport = build_smtp_transport(&smtp);
        if smtp_transport.is_some() {
            tracing::info!("alert engine: SMTP configured for email notifications");
        }
        // service → currently breaching, for transition detection.
        let mut breaching: HashMap<String, bool> = HashMap::new();

        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    tracing::info!("alert engine: shutting down");
                    return;
                }
            }
            if let Err(e) = eval_alerts(
                &store,
                &http_client,
                &smtp,
                &smtp_transport,
                &mut breaching,
            )
            .await
            {
                tracing::error!("alert engine error: {e}");
            }
        }
    });
}

async fn eval_alerts(
    store: &Store,
    http_client: &reqwest::Client,
    smtp: &SmtpSettings,
    smtp_transport: &Option<AsyncSmtpTransport<Tokio1Executor>>,
    breaching: &mut HashMap<String, bool>,
) -> Result<()> {
    let since = Utc::now() - chrono::Duration::minutes(1);
    let snapshot = store.api_metrics_snapshot(&since).unwrap_or_default();

    for config in store.list_alert_configs(true)? {
        let errors = store.count_entries_since(&config.service, &ERROR_LEVELS, &since)?;
        let warns = store.count_entries_since(&config.service, &WARN_LEVELS, &since)?;

        let breach = breach_kind(&config, errors, warns);
        let was_breaching = breaching.get(&config.service).copied().unwrap_or(false);

        match (&breach, was_breaching) {
            (Some((kind, value, threshold)), false) => {
                let message = format!(
                    "{}: {kind} {value}/min exceeds threshold {threshold}/min",
                    config.service
                );
                store.insert_alert(&config.service, kind, &message, *value as f64, *threshold as f64)?;
                tracing::warn!("alert fired: {message}");
                notify(
                    http_client,
                    smtp,
                    smtp_transport,
                    &config,
                    &message,
                    &snapshot,
                )
                .await;
                breaching.insert(config.service.clone(), true);
            }
            (None, true) => {
                tracing::info!("alert resolved for {}", config.service);
                breaching.insert(config.service.clone(), false);
            }
            _ => {}
        }
    }
    Ok(())
}

/// Which threshold is breached, if any. Error rate takes precedence.
fn breach_kind(config: &AlertConfig, errors: u64, warns: u64) -> Option<(&'static str, u64, u32)> {
    if config.error_rate_per_minute > 0 && errors > config.error_rate_per_minute as u64 {
        return Some(("error_rate", errors, config.error_rate_per_minute));
    }
    if config.warn_rate_per_minute > 0 && warns > config.warn_rate_per_minute as u64 {
        return Some(("warn_rate", warns, config.warn_rate_per_minute));
    }
    None
}

async fn notify(
    http_client: &reqwest::Client,
    smtp: &SmtpSettings,
    smtp_transport: &Option<AsyncSmtpTransport<Tokio1Executor>>,
    config: &AlertConfig,
    message: &str,
    snapshot: &crate::models::alert::ApiMetricsSnapshot,
) {
    if let Some(webhook_url) = &config.webhook_url {
        let payload = serde_json::json!({
            "service": config.service,
            "message": message,
            "api_requests_last_minute": snapshot.requests,
            "api_server_errors_last_minute": snapshot.server_errors,
        });
        if let Err(e) = http_client.post(webhook_url).json(&payload).send().await {
            tracing::warn!("alert webhook for {} failed: {e}", config.service);
        }
    }

    if let (Some(to_addr), Some(transport)) = (&config.email, smtp_transport) {
        let email = Message::builder()
            .from(match smtp.from.parse() {
                Ok(from) => from,
                Err(e) => {
                    tracing::warn!("alert email skipped, bad from address: {e}");
                    return;
                }
            })
            .to(match to_addr.parse() {
                Ok(to) => to,
                Err(e) => {
                    tracing::warn!("alert email skipped, bad to address: {e}");
                    return;
                }
            })
            .subject(format!("[foghorn] alert: {}", config.service))
            .header(ContentType::TEXT_PLAIN)
            .body(message.to_string());
        match email {
            Ok(email) => {
                if let Err(e) = transport.send(email).await {
                    tracing::warn!("alert email for {} failed: {e}", config.service);
                }
            }
            Err(e) => tracing::warn!("alert email build failed: {e}"),
        }
    }
}
