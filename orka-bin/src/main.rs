use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre;
use orka_cloud::{CloudClient, LegacyInstanceStore, ProfileConfig};
use tracing::info;

const STATUS_INTERVAL: Duration = Duration::from_secs(60);

fn log_status(client: &CloudClient) {
    for image in client.images() {
        let instances = image.instances();
        info!(
            image_id = %image.id(),
            name = %image.name(),
            instances = instances.len(),
            legacy = image.legacy_instances().len(),
            can_start = client.can_start_new_instance(&image),
            "Image status"
        );
        for instance in instances {
            info!(
                instance_id = %instance.id(),
                status = %instance.status(),
                host = ?instance.host(),
                error = ?instance.error_info(),
                "Instance status"
            );
        }
    }
    if let Some(error) = client.error_info() {
        info!(message = %error.message, details = ?error.details, "Profile is backing off");
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("Starting Orka cloud controller...");

    let config = ProfileConfig::from_env()?;
    info!(
        profile_id = %config.profile_id,
        endpoint = %config.endpoint,
        namespace = %config.namespace,
        token_source = ?config.token_source,
        "Loaded profile"
    );

    let legacy_store = Arc::new(LegacyInstanceStore::new());
    let client = CloudClient::from_config(config, legacy_store)?;
    log_status(&client);

    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => log_status(&client),
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
        }
    }

    info!("Shutting down...");
    client.dispose().await;
    Ok(())
}
