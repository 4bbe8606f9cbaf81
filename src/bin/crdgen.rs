//! Print the CustomResourceDefinitions served by the operator as YAML
//!
//! ```sh
//! cargo run --bin crdgen > deploy/crds.yaml
//! ```

use mysql_operator::registered_crds;

fn main() -> Result<(), serde_yaml::Error> {
    for crd in registered_crds() {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
