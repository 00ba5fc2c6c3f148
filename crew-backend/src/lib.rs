pub mod ai;
pub mod config;
pub mod controllers;
pub mod crew;
pub mod error;
pub mod telemetry;
pub mod tools;

use config::Config;
use crew::Crew;
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct AppState {
    pub config: Config,
    pub crew: Arc<Crew>,
    /// Cancellation handles of in-flight runs, keyed by run id
    pub runs: Arc<DashMap<String, CancellationToken>>,
}

impl AppState {
    pub fn new(config: Config, crew: Arc<Crew>) -> Self {
        AppState {
            config,
            crew,
            runs: Arc::new(DashMap::new()),
        }
    }
}
