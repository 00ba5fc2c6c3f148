use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use dotenv::dotenv;
use std::sync::Arc;

use crew_backend::config::Config;
use crew_backend::crew::build_default_crew;
use crew_backend::{controllers, telemetry, AppState};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    env_logger::init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("[CONFIG] {}", e);
            std::process::exit(1);
        }
    };
    let port = config.port;

    let trace = telemetry::init(&config);

    let crew = match build_default_crew(&config, trace) {
        Ok(crew) => Arc::new(crew),
        Err(e) => {
            log::error!("[CREW] Failed to assemble crew: {}", e);
            std::process::exit(1);
        }
    };
    log::info!(
        "[CREW] Ready: {} agents, order {:?}, {} process, model {}",
        crew.agents().len(),
        crew.execution_order(),
        crew.settings().process,
        config.openai.model
    );

    // One state for all workers so cancellation sees every in-flight run
    let state = web::Data::new(AppState::new(config, crew));

    log::info!("Starting server on port {}", port);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(state.clone())
            .wrap(Logger::default())
            .wrap(cors)
            .configure(controllers::health::config)
            .configure(controllers::crew::config)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
