//! modelsync-watch: print the change events of the given models.
//!
//! ```text
//! MODELSYNC_ENDPOINT=api.example.com MODELSYNC_PROJECT=acme \
//! MODELSYNC_ACCESS_TOKEN=... modelsync-watch posts comments
//! ```

use anyhow::{bail, Context};
use modelsync_client::shared::Scope;
use modelsync_client::{logging, Client, ClientOptions, Document};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init("modelsync_client=info,modelsync_watch=info");

    let models: Vec<String> = std::env::args().skip(1).collect();
    if models.is_empty() {
        bail!("usage: modelsync-watch <model> [<model>...]");
    }

    let mut options = ClientOptions::from_env();
    // connect explicitly below so a bad credential fails the command
    options.realtime.auto_connect = false;
    let scopes = options.sockets.clone();

    tracing::info!(endpoint = %options.endpoint, project = ?options.project, ?scopes, "starting");
    let client = Client::new(options);

    let mut subscriptions = Vec::new();
    for model in &models {
        let adapter = client.model::<Document>(model)?;
        subscriptions.push(adapter.subscribe(|event| {
            tracing::info!(
                model = %event.model,
                operation = %event.operation,
                ids = ?event.ids(),
                origin = ?event.origin_connection_id,
                "change"
            );
        }));
    }

    for scope in &scopes {
        client.realtime().subscribe_models(*scope, &models);
        client
            .realtime()
            .connect(*scope, false)
            .await
            .with_context(|| format!("connecting {scope} socket"))?;
    }

    if scopes.is_empty() {
        // nothing configured: fall back to the project scope
        client.realtime().subscribe_models(Scope::Project, &models);
        client
            .realtime()
            .connect(Scope::Project, false)
            .await
            .context("connecting project socket")?;
    }

    tracing::info!(?models, "watching; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;

    client.close();
    drop(subscriptions);
    Ok(())
}
