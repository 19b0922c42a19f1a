//! `gst-transformer-server`: the daemon binary that wires the engine to a
//! real tonic listener. Translated from `gst-transformer.cpp`'s `main` /
//! `runServer`: parse CLI, load the JSON policy file, bind, serve forever.

mod cli;
mod logging;
mod service;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tonic::transport::Server;
use tracing::info;
use transform_engine::ServicePolicy;
use transform_proto::transformer_server::TransformerServer;

use crate::cli::Cli;
use crate::service::TransformerService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let policy = match &cli.config_file {
        Some(path) => transform_engine::config::load_from_file(path)
            .with_context(|| format!("failed to load config file {}", path.display()))?,
        None => ServicePolicy::default(),
    };

    let addr = cli
        .endpoint
        .parse()
        .with_context(|| format!("invalid endpoint '{}'", cli.endpoint))?;

    info!(endpoint = %cli.endpoint, allow_dynamic_pipelines = policy.allow_dynamic_pipelines, named_pipelines = policy.pipelines.len(), "starting gst-transformer server");

    let service = TransformerService::new(Arc::new(policy));

    Server::builder()
        .add_service(TransformerServer::new(service))
        .serve(addr)
        .await
        .context("gRPC server terminated")?;

    Ok(())
}
