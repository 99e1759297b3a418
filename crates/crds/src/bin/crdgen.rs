//! Prints the CRD manifests as a multi-document YAML stream.

use anyhow::Result;
use crds::{AddressPlan, HostInterface, IPPool};
use kube::CustomResourceExt;

fn main() -> Result<()> {
    let crds = [AddressPlan::crd(), HostInterface::crd(), IPPool::crd()];
    for crd in &crds {
        println!("---");
        print!("{}", serde_yaml::to_string(crd)?);
    }
    Ok(())
}
