//! my.cnf and helper scripts for MySQL members
//!
//! Every member boots from the same ConfigMap. The per-member `server-id`
//! cannot live in a shared file, so an init container derives it from the
//! StatefulSet ordinal and writes it next to the shared settings.

use std::collections::BTreeMap;
use std::fmt::Write;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::MySQLCluster;
use crate::resources::common::{cluster_labels, config_map_name, owner_reference};

/// Key of the shared server configuration
pub const MY_CNF_KEY: &str = "operator.cnf";

/// Key of the init container script that writes the per-member settings
pub const INIT_SCRIPT_KEY: &str = "init-member.sh";

/// Key of the initdb script that creates the replication account
pub const REPLICATION_USER_SCRIPT_KEY: &str = "10-replication-user.sh";

/// Offset added to the ordinal to form `server-id` (0 is not allowed)
pub const SERVER_ID_OFFSET: i32 = 100;

/// Render the shared `[mysqld]` section
///
/// User settings come last so they win over the operator defaults, but
/// replication-critical keys are rejected by validation before getting here.
pub fn render_my_cnf(cluster: &MySQLCluster) -> String {
    let mut cnf = String::from(
        "[mysqld]\n\
         gtid_mode = ON\n\
         enforce_gtid_consistency = ON\n\
         log_bin = binlog\n\
         binlog_format = ROW\n\
         relay_log = relay-bin\n\
         log_replica_updates = ON\n\
         skip_name_resolve = ON\n\
         skip_replica_start = ON\n",
    );

    for (key, value) in &cluster.spec.mysql_config {
        let _ = writeln!(cnf, "{} = {}", key, value);
    }

    cnf
}

/// Render the init container script
///
/// Members restarting with existing data come up read-only; the reconciler
/// decides which one gets writes enabled.
pub fn render_init_script() -> String {
    format!(
        r#"#!/bin/sh
set -eu
ordinal="${{HOSTNAME##*-}}"
cp /mnt/config/{cnf} /mnt/conf.d/{cnf}
{{
  echo "[mysqld]"
  echo "server_id = $(( {offset} + ordinal ))"
  echo "report_host = ${{HOSTNAME}}.${{SERVICE_NAME}}"
  if [ -d /var/lib/mysql/mysql ]; then
    echo "super_read_only = ON"
  fi
}} > /mnt/conf.d/member.cnf
"#,
        cnf = MY_CNF_KEY,
        offset = SERVER_ID_OFFSET,
    )
}

/// Render the initdb script that creates the replication account
///
/// Binary logging is disabled for the session so the account does not
/// produce GTIDs that would diverge between members.
pub fn render_replication_user_script() -> String {
    r#"#!/bin/bash
set -eu
mysql -uroot -p"${MYSQL_ROOT_PASSWORD}" <<EOSQL
SET SQL_LOG_BIN=0;
CREATE USER IF NOT EXISTS '${MYSQL_REPLICATION_USER}'@'%' IDENTIFIED BY '${MYSQL_REPLICATION_PASSWORD}';
GRANT REPLICATION SLAVE, REPLICATION CLIENT ON *.* TO '${MYSQL_REPLICATION_USER}'@'%';
SET SQL_LOG_BIN=1;
EOSQL
"#
    .to_string()
}

/// Generate the cluster ConfigMap
pub fn generate_config_map(cluster: &MySQLCluster) -> ConfigMap {
    let cluster_name = cluster.name_any();

    let data = BTreeMap::from([
        (MY_CNF_KEY.to_string(), render_my_cnf(cluster)),
        (INIT_SCRIPT_KEY.to_string(), render_init_script()),
        (
            REPLICATION_USER_SCRIPT_KEY.to_string(),
            render_replication_user_script(),
        ),
    ]);

    ConfigMap {
        metadata: ObjectMeta {
            name: Some(config_map_name(&cluster_name)),
            namespace: cluster.namespace(),
            labels: Some(cluster_labels(cluster)),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}
