use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use rand::Rng;

use crate::crd::MySQLCluster;
use crate::resources::common::{cluster_labels, credentials_secret_name, owner_reference};

/// Key holding the root password
pub const ROOT_PASSWORD_KEY: &str = "MYSQL_ROOT_PASSWORD";

/// Key holding the replication account name
pub const REPLICATION_USER_KEY: &str = "MYSQL_REPLICATION_USER";

/// Key holding the replication account password
pub const REPLICATION_PASSWORD_KEY: &str = "MYSQL_REPLICATION_PASSWORD";

/// Name of the replication account
pub const REPLICATION_USER: &str = "repl";

/// Generate a secure random password
fn generate_password(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

/// Generate the credentials Secret
///
/// Passwords are random, so the Secret is only ever created; an existing
/// Secret is left untouched.
pub fn generate_credentials_secret(cluster: &MySQLCluster) -> Secret {
    let cluster_name = cluster.name_any();

    let string_data = BTreeMap::from([
        (ROOT_PASSWORD_KEY.to_string(), generate_password(32)),
        (REPLICATION_USER_KEY.to_string(), REPLICATION_USER.to_string()),
        (REPLICATION_PASSWORD_KEY.to_string(), generate_password(32)),
    ]);

    Secret {
        metadata: ObjectMeta {
            name: Some(credentials_secret_name(&cluster_name)),
            namespace: cluster.namespace(),
            labels: Some(cluster_labels(cluster)),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(string_data),
        ..Default::default()
    }
}
