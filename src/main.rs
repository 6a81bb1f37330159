use std::sync::Arc;

use chrono::Utc;
use state::Storage;

use skillquest_rl::api;
use skillquest_rl::coach::Coach;
use skillquest_rl::config::CoachConfig;
use skillquest_rl::risk::{LogisticRiskModel, RISK_MODEL_SEED};
use skillquest_rl::sweeper::ExpirySweeper;

static CFG: Storage<CoachConfig> = Storage::new();

/*****************************
 * Configuration and logging *
 *****************************/

fn read_configuration() -> Result<(), config::ConfigError> {
    let cfg = CoachConfig::load()?;
    CFG.set(cfg);
    Ok(())
}

fn setup_logging() -> Result<(), fern::InitError> {
    let log_level = if cfg!(debug_assertions) {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}] {}",
                Utc::now().format("[%Y-%m-%d %H:%M:%S.%6f]"),
                record.level(),
                message
            ))
        })
        .level(log_level)
        .chain(std::io::stdout());
    if let Some(log_filename) = &CFG.get().log_filename {
        dispatch = dispatch.chain(fern::log_file(log_filename)?);
    }
    dispatch.apply()?;
    Ok(())
}

async fn serve(coach: Arc<Coach>) -> Result<(), rocket::Error> {
    let figment = rocket::Config::figment()
        .merge(("port", CFG.get().port))
        .merge(("address", "0.0.0.0"));
    let rocket = api::build(rocket::custom(figment), coach).ignite().await?;
    let _rocket = rocket.launch().await?;
    Ok(())
}

#[rocket::main]
async fn main() {
    // Logging is not yet configured when configuration is read, so errors go to stderr.
    read_configuration().expect("could not parse configuration");
    setup_logging().expect("Failed to setup logging!");
    log::info!("Configuration {:?}", CFG.get());

    let (risk_model, accuracy) = LogisticRiskModel::fit_synthetic(RISK_MODEL_SEED);
    log::info!(
        "[RL] Risk model ready (weights={:?}, bias={:.3}, held-out accuracy={:.3})",
        risk_model.weights(),
        risk_model.bias(),
        accuracy
    );

    let coach = Arc::new(Coach::new(CFG.get().clone(), Box::new(risk_model)));
    let sweeper = ExpirySweeper::new(coach.clone()).spawn();

    // Rocket handles Ctrl-C and SIGTERM itself; `launch` returns once it has shut down.
    if let Err(err) = serve(coach.clone()).await {
        log::error!("[API] Server failed: {}", err);
    }

    sweeper.shutdown().await;
    match coach.save() {
        Ok(path) => log::info!("[CHECKPOINT] Final checkpoint written to {}", path),
        Err(e) => log::warn!("[CHECKPOINT] Final save failed: {}", e),
    }
}
