//! Print the CustomResourceDefinitions the controller works with.
//!
//! ```bash
//! cargo run --bin crdgen > config/crd/all.yaml
//! cargo run --bin crdgen -- --output config/crd/all.yaml
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use kube::CustomResourceExt;
use service_catalog_controller::crd::{
    ClusterServiceBroker, ServiceBroker, ServiceInstance, ServiceInstanceBinding, Space,
};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "crdgen", about = "Generate the service catalog CRDs as YAML")]
struct Args {
    /// Write to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let crds = [
        ServiceInstance::crd(),
        ServiceInstanceBinding::crd(),
        ServiceBroker::crd(),
        ClusterServiceBroker::crd(),
        Space::crd(),
    ];
    let documents = crds
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()
        .context("failed to serialize CRDs")?;
    let yaml = documents.join("---\n");

    match args.output {
        Some(path) => std::fs::write(&path, yaml)
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => print!("{yaml}"),
    }
    Ok(())
}
