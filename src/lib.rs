pub mod alerts;
pub mod archive;
pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod hub;
pub mod ingest;
pub mod metrics_recorder;
pub mod models;
pub mod query;
pub mod retention;
pub mod store;

use std::sync::Arc;

use auth::SessionService;
use config::AppConfig;
use hub::Hub;
use metrics_recorder::MetricsRecorder;
use store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub hub: Arc<Hub>,
    pub sessions: Arc<dyn SessionService>,
    pub metrics: MetricsRecorder,
    pub config: Arc<AppConfig>,
    pub http: reqwest::Client,
}
