//! Question fingerprinting.
//!
//! A query is identified by the 64-bit FNV-1a hash of its class, type, CD
//! flag, and lowercased name, in that order. The hash is stable across
//! processes and builds; keys computed by one version of the daemon are not
//! guaranteed to match another's.

use hickory_proto::rr::{DNSClass, Name, RecordType};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(hash: u64, bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(hash, |h, &b| (h ^ b as u64).wrapping_mul(FNV_PRIME))
}

/// Fingerprint of `(qname, qtype, qclass, cd)`. Case-insensitive on the name.
pub fn question_key(name: &Name, qtype: RecordType, qclass: DNSClass, cd: bool) -> u64 {
    let mut h = FNV_OFFSET;
    h = fnv1a(h, &u16::from(qclass).to_be_bytes());
    h = fnv1a(h, &u16::from(qtype).to_be_bytes());
    h = fnv1a(h, &[cd as u8]);
    let name = name.to_lowercase().to_ascii();
    fnv1a(h, name.as_bytes())
}
