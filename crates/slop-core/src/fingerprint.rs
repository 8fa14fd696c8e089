//! Identity fingerprint for server descriptors.
//!
//! The fingerprint keys the on-disk tool cache: two descriptors with the
//! same fingerprint are the same downstream server. Only the transport,
//! command, args, url, headers and env take part; maps are sorted by key so
//! insertion order never matters.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::descriptor::ServerDescriptor;

/// Number of hex characters kept from the digest (64 bits).
pub const FINGERPRINT_LEN: usize = 16;

/// Compute the 16-hex-digit fingerprint of a descriptor.
pub fn fingerprint(descriptor: &ServerDescriptor) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_form(descriptor).as_bytes());
    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(FINGERPRINT_LEN);
    hex
}

/// Field-tagged serialization: `type|command|args|url|headers|env`, one
/// newline-terminated segment each.
fn canonical_form(descriptor: &ServerDescriptor) -> String {
    format!(
        "type:{}\ncommand:{}\nargs:{}\nurl:{}\nheaders:{}\nenv:{}\n",
        descriptor.kind().as_str(),
        descriptor.command,
        descriptor.args.join("\0"),
        descriptor.url,
        sorted_pairs(&descriptor.headers),
        sorted_pairs(&descriptor.env),
    )
}

fn sorted_pairs(map: &HashMap<String, String>) -> String {
    let mut pairs: Vec<(&String, &String)> = map.iter().collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("\0")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Source, TransportKind};

    fn base() -> ServerDescriptor {
        ServerDescriptor::stdio("fs", "fs-server")
            .with_args(["--root", "/tmp"])
            .with_env("A", "1")
            .with_env("B", "2")
    }

    #[test]
    fn test_deterministic_and_sized() {
        let d = base();
        let hash = fingerprint(&d);
        assert_eq!(hash, fingerprint(&d));
        assert_eq!(hash.len(), FINGERPRINT_LEN);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_map_order_irrelevant() {
        let mut forward = ServerDescriptor::http("remote", "https://example.com/mcp");
        for (k, v) in [("X-One", "1"), ("X-Two", "2"), ("X-Three", "3")] {
            forward = forward.with_header(k, v).with_env(k, v);
        }
        let mut backward = ServerDescriptor::http("remote", "https://example.com/mcp");
        for (k, v) in [("X-Three", "3"), ("X-Two", "2"), ("X-One", "1")] {
            backward = backward.with_header(k, v).with_env(k, v);
        }
        assert_eq!(fingerprint(&forward), fingerprint(&backward));
    }

    #[test]
    fn test_args_order_matters() {
        let a = base();
        let b = base().with_args(["/tmp", "--root"]);
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_volatile_fields_ignored() {
        let original = fingerprint(&base());

        let mut d = base();
        d.name = "renamed".to_string();
        d.timeout = Some("5m".to_string());
        d.max_retries = Some(-1);
        d.source = Source::Project;
        d.dynamic = true;
        assert_eq!(fingerprint(&d), original);
    }

    #[test]
    fn test_identity_fields_change_hash() {
        let original = fingerprint(&base());

        let mut d = base();
        d.transport = Some(TransportKind::Sse);
        assert_ne!(fingerprint(&d), original);

        let mut d = base();
        d.command = "fs-server-v2".to_string();
        assert_ne!(fingerprint(&d), original);

        let d = base().with_args(["--root", "/var"]);
        assert_ne!(fingerprint(&d), original);

        let mut d = base();
        d.url = "https://example.com".to_string();
        assert_ne!(fingerprint(&d), original);

        let d = base().with_header("Authorization", "Bearer x");
        assert_ne!(fingerprint(&d), original);

        let d = base().with_env("A", "changed");
        assert_ne!(fingerprint(&d), original);
    }

    #[test]
    fn test_separators_not_ambiguous() {
        let joined = ServerDescriptor::stdio("fs", "fs-server").with_args(["a b"]);
        let split = ServerDescriptor::stdio("fs", "fs-server").with_args(["a", "b"]);
        assert_ne!(fingerprint(&joined), fingerprint(&split));
    }

    #[test]
    fn test_empty_maps_canonical_form() {
        let d = ServerDescriptor::stdio("fs", "fs-server");
        assert_eq!(
            canonical_form(&d),
            "type:stdio\ncommand:fs-server\nargs:\nurl:\nheaders:\nenv:\n"
        );
    }
}
