// src/core/hashing.rs

//! Stable hashes used to detect drift between a node's tags and the current
//! config: `launch_config_hash` (node_config + auth) and `runtime_hash` /
//! `file_mounts_contents_hash` (setup/start commands + synced file set).

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Hashes a canonical JSON serialization of `value`, hex-encoded.
///
/// Serialized through `serde_json` rather than `Debug` so the hash is stable
/// across process restarts. Callers must only ever feed this types whose
/// serialization order is part of the type itself (structs, `BTreeMap`) —
/// a `HashMap` field anywhere in `value` randomizes iteration order per
/// process and makes the hash unstable across restarts.
pub(crate) fn stable_hash<T: Serialize>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).expect("config values are always serializable");
    let digest = Sha256::digest(&bytes);
    hex::encode(digest)
}

/// `launch_config_hash(node_config, auth)`: changes iff `node_config` or
/// `auth` changes (spec section 8, round-trip property).
pub fn hash_launch_conf<N: Serialize, A: Serialize>(node_config: &N, auth: &A) -> String {
    stable_hash(&(node_config, auth))
}

/// `runtime_hash` over file mount paths, the synced file list, and the
/// setup/start commands. Always computed.
pub fn hash_runtime_conf<P: Serialize>(
    file_mount_paths: &[String],
    synced_files: &[String],
    setup_commands: &[String],
    start_commands: &[String],
    extra: &P,
) -> String {
    stable_hash(&(
        file_mount_paths,
        synced_files,
        setup_commands,
        start_commands,
        extra,
    ))
}

/// `file_mounts_contents_hash`: hash of the actual file contents, computed
/// only when continuous sync is enabled; `None` otherwise (spec section 3).
pub fn hash_file_mounts_contents(contents: &[(String, Vec<u8>)]) -> String {
    let mut hasher = Sha256::new();
    for (path, data) in contents {
        hasher.update(path.as_bytes());
        hasher.update(data);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn launch_conf_hash_stable_across_calls() {
        let node_config: BTreeMap<&str, &str> = BTreeMap::from([("instance_type", "m5.large")]);
        let auth: BTreeMap<&str, &str> = BTreeMap::from([("ssh_user", "ubuntu")]);
        let h1 = hash_launch_conf(&node_config, &auth);
        let h2 = hash_launch_conf(&node_config, &auth);
        assert_eq!(h1, h2);
    }

    #[test]
    fn launch_conf_hash_changes_with_node_config() {
        let auth: BTreeMap<&str, &str> = BTreeMap::from([("ssh_user", "ubuntu")]);
        let a: BTreeMap<&str, &str> = BTreeMap::from([("instance_type", "m5.large")]);
        let b: BTreeMap<&str, &str> = BTreeMap::from([("instance_type", "m5.xlarge")]);
        assert_ne!(hash_launch_conf(&a, &auth), hash_launch_conf(&b, &auth));
    }

    #[test]
    fn launch_conf_hash_changes_with_auth() {
        let node_config: BTreeMap<&str, &str> = BTreeMap::from([("instance_type", "m5.large")]);
        let a: BTreeMap<&str, &str> = BTreeMap::from([("ssh_user", "ubuntu")]);
        let b: BTreeMap<&str, &str> = BTreeMap::from([("ssh_user", "ec2-user")]);
        assert_ne!(
            hash_launch_conf(&node_config, &a),
            hash_launch_conf(&node_config, &b)
        );
    }
}
