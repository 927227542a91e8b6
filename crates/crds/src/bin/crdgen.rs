//! Prints the CRD manifests for every resource in this crate.
//!
//! Usage: `cargo run -p crds --bin crdgen > config/crds.yaml`

use anyhow::Result;
use crds::{IPPool, WorkloadEndpoint};
use kube::CustomResourceExt;

fn main() -> Result<()> {
    print!("{}", serde_yaml::to_string(&IPPool::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&WorkloadEndpoint::crd())?);
    Ok(())
}
