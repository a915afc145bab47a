use quty::{Cluster, ClusterConfig, Logger};

#[tokio::main]
async fn main() {
    quty::logger::level_from_env();
    let log = Logger::new("quty");

    let config = ClusterConfig::from_env();
    if let Err(e) = config.validate() {
        log.error(format!("{e}"));
        std::process::exit(1);
    }

    let cluster = match Cluster::start(config).await {
        Ok(cluster) => cluster,
        Err(e) => {
            log.error(format!("failed to start: {e}"));
            std::process::exit(1);
        }
    };
    log.info(format!(
        "node {} up on port {}",
        cluster.id(),
        cluster.port()
    ));

    let _ = tokio::signal::ctrl_c().await;
    log.info("shutting down");
    cluster.shutdown().await;
}
