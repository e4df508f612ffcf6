use std::env;
use std::sync::Arc;

use dotenv::dotenv;

use rein::config::{BackendConfig, Config};
use rein::engine::{Engine, HeadlessHost};
use rein::error::Error;
use rein::external::RestBackend;
use rein::server::serve;
use rein::session::{Session, SessionStore};
use rein::simulation;

#[tokio::main]
async fn main() -> Result<(), Error> {
    dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = Config::from_env();

    if env::args().nth(1).as_deref() == Some("simulate") {
        return simulation::run(config).await;
    }

    let backend = Arc::new(RestBackend::new(BackendConfig::from_env()?)?);

    let session = match &config.session_path {
        Some(path) => Session::restore(&config.driver_id, SessionStore::new(path)).await?,
        None => Session::new(config.driver_id.clone()),
    };

    let listen_addr = config.listen_addr;
    let engine = Engine::new(backend, Arc::new(session), Arc::new(HeadlessHost), config);

    serve(engine, listen_addr).await
}
