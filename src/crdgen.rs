//! Prints the ConfigMapSecret CustomResourceDefinition as YAML.
//!
//! ```bash
//! cargo run --bin crdgen > config/crd/configmapsecret.yaml
//! ```

use configmapsecret_controller::crd::ConfigMapSecret;
use kube::CustomResourceExt;

fn main() {
    match serde_yaml::to_string(&ConfigMapSecret::crd()) {
        Ok(yaml) => print!("{yaml}"),
        Err(err) => {
            eprintln!("Failed to serialize CRD to YAML: {err}");
            std::process::exit(1);
        }
    }
}
