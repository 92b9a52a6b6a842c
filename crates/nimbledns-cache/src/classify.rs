//! Response classification and TTL computation.
//!
//! Classification decides which store (if any) admits a response and which
//! TTL policy applies. It is a pure function of the message and the wall
//! clock; the clock only matters through RRSIG expiration.

use hickory_proto::op::{Message, OpCode, ResponseCode};
use hickory_proto::rr::dnssec::rdata::DNSSECRData;
use hickory_proto::rr::{RData, Record, RecordType};

/// Floor for cacheable TTLs, seconds.
pub const MIN_CACHE_TTL: u32 = 5;
/// Ceiling for cacheable TTLs, seconds.
pub const MAX_CACHE_TTL: u32 = 86_400;
/// Fixed TTL for SERVFAIL responses before the negative store clamps it.
pub const SERVFAIL_TTL: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    /// Answered, or an empty NoError reply with nothing better to call it.
    Success,
    /// Delegation: no answer, authority carries NS for a zone above the
    /// question.
    Referral,
    /// NODATA: name exists, no records of the requested type, SOA in
    /// authority.
    NoRecords,
    NXDomain,
    /// SERVFAIL or any other error Rcode.
    ServerFailure,
    /// Zone transfers and NOTIFY.
    MetaQuery,
    DynamicUpdate,
    NotCacheable,
    /// Carries an RRSIG whose validity window has already closed.
    ExpiredSignature,
}

/// Which store admits a classified response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Positive,
    Negative,
}

impl ResponseType {
    /// NXDomain goes positive: it carries an SOA whose TTL governs it like
    /// any other record. Only SERVFAIL lives in the short-lived negative
    /// store.
    pub fn store(&self) -> Option<StoreKind> {
        match self {
            ResponseType::Success
            | ResponseType::Referral
            | ResponseType::NoRecords
            | ResponseType::NXDomain => Some(StoreKind::Positive),
            ResponseType::ServerFailure => Some(StoreKind::Negative),
            ResponseType::MetaQuery
            | ResponseType::DynamicUpdate
            | ResponseType::NotCacheable
            | ResponseType::ExpiredSignature => None,
        }
    }
}

pub fn classify(msg: &Message, now: u64) -> ResponseType {
    if let Some(q) = msg.queries().first() {
        if matches!(q.query_type(), RecordType::AXFR | RecordType::IXFR) {
            return ResponseType::MetaQuery;
        }
    }

    match msg.op_code() {
        OpCode::Update => return ResponseType::DynamicUpdate,
        OpCode::Notify => return ResponseType::MetaQuery,
        _ => {}
    }

    match msg.response_code() {
        ResponseCode::NoError => {}
        ResponseCode::NXDomain => return ResponseType::NXDomain,
        _ => return ResponseType::ServerFailure,
    }

    if !msg.answers().is_empty() {
        if has_expired_signature(msg, now) {
            return ResponseType::ExpiredSignature;
        }
        return ResponseType::Success;
    }

    let Some(q) = msg.queries().first() else {
        return ResponseType::Success;
    };

    let referral = msg
        .name_servers()
        .iter()
        .any(|r| r.record_type() == RecordType::NS && r.name().zone_of(q.name()));
    if referral {
        return ResponseType::Referral;
    }

    if msg
        .name_servers()
        .iter()
        .any(|r| r.record_type() == RecordType::SOA)
    {
        return ResponseType::NoRecords;
    }

    if q.query_type() == RecordType::DNSKEY {
        return ResponseType::NotCacheable;
    }

    // Empty replies are still worth caching for short periods.
    ResponseType::Success
}

fn all_records(msg: &Message) -> impl Iterator<Item = &Record> {
    msg.answers()
        .iter()
        .chain(msg.name_servers())
        .chain(msg.additionals())
}

fn has_expired_signature(msg: &Message, now: u64) -> bool {
    all_records(msg).any(|r| match r.data() {
        Some(RData::DNSSEC(DNSSECRData::RRSIG(sig))) => (sig.sig_expiration() as u64) < now,
        _ => false,
    })
}

/// Effective TTL for a classified response.
///
/// Cacheable positive types take the minimum TTL across all sections; an
/// RRSIG additionally contributes the seconds left until its signature
/// expires. The result is clamped to `[MIN_CACHE_TTL, MAX_CACHE_TTL]`.
pub fn compute_ttl(msg: &Message, rt: ResponseType, now: u64) -> u32 {
    match rt {
        ResponseType::ServerFailure => SERVFAIL_TTL,
        ResponseType::Success
        | ResponseType::Referral
        | ResponseType::NoRecords
        | ResponseType::NXDomain => {
            let mut min: Option<u32> = None;
            let mut consider = |ttl: u32| {
                min = Some(min.map_or(ttl, |m: u32| m.min(ttl)));
            };
            for r in all_records(msg) {
                if r.record_type() == RecordType::OPT {
                    continue;
                }
                consider(r.ttl());
                if let Some(RData::DNSSEC(DNSSECRData::RRSIG(sig))) = r.data() {
                    consider((sig.sig_expiration() as u64).saturating_sub(now) as u32);
                }
            }
            match min {
                Some(ttl) => ttl.clamp(MIN_CACHE_TTL, MAX_CACHE_TTL),
                None => MIN_CACHE_TTL,
            }
        }
        _ => MIN_CACHE_TTL,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, Query};
    use hickory_proto::rr::dnssec::rdata::RRSIG;
    use hickory_proto::rr::dnssec::Algorithm;
    use hickory_proto::rr::rdata::{A, NS, SOA};
    use hickory_proto::rr::{DNSClass, Name};
    use std::str::FromStr;

    fn name(s: &str) -> Name {
        Name::from_str(s).unwrap()
    }

    fn base(qname: &str, qtype: RecordType, rcode: ResponseCode) -> Message {
        let mut msg = Message::new();
        msg.set_message_type(MessageType::Response);
        msg.set_response_code(rcode);
        let mut q = Query::query(name(qname), qtype);
        q.set_query_class(DNSClass::IN);
        msg.add_query(q);
        msg
    }

    fn soa_record(owner: &str, ttl: u32) -> Record {
        Record::from_rdata(
            name(owner),
            ttl,
            RData::SOA(SOA::new(
                name("ns1.example.com."),
                name("hostmaster.example.com."),
                2024010101,
                7200,
                3600,
                1209600,
                300,
            )),
        )
    }

    fn rrsig_record(owner: &str, ttl: u32, expiration: u32) -> Record {
        Record::from_rdata(
            name(owner),
            ttl,
            RData::DNSSEC(DNSSECRData::RRSIG(RRSIG::new(
                RecordType::A,
                Algorithm::RSASHA256,
                2,
                300,
                expiration,
                0,
                12345,
                name("example.com."),
                vec![0u8; 16],
            ))),
        )
    }

    #[test]
    fn test_answered_noerror_is_success() {
        let mut msg = base("example.com.", RecordType::A, ResponseCode::NoError);
        msg.add_answer(Record::from_rdata(
            name("example.com."),
            300,
            RData::A(A::new(192, 0, 2, 1)),
        ));
        assert_eq!(classify(&msg, 0), ResponseType::Success);
        assert_eq!(classify(&msg, 0).store(), Some(StoreKind::Positive));
    }

    #[test]
    fn test_nxdomain_goes_positive() {
        let mut msg = base("gone.example.com.", RecordType::A, ResponseCode::NXDomain);
        msg.add_name_server(soa_record("example.com.", 300));
        let rt = classify(&msg, 0);
        assert_eq!(rt, ResponseType::NXDomain);
        assert_eq!(rt.store(), Some(StoreKind::Positive));
    }

    #[test]
    fn test_servfail_goes_negative() {
        let msg = base("example.com.", RecordType::A, ResponseCode::ServFail);
        let rt = classify(&msg, 0);
        assert_eq!(rt, ResponseType::ServerFailure);
        assert_eq!(rt.store(), Some(StoreKind::Negative));
        assert_eq!(compute_ttl(&msg, rt, 0), SERVFAIL_TTL);
    }

    #[test]
    fn test_refused_is_server_failure() {
        let msg = base("example.com.", RecordType::A, ResponseCode::Refused);
        assert_eq!(classify(&msg, 0), ResponseType::ServerFailure);
    }

    #[test]
    fn test_referral() {
        let mut msg = base("www.example.com.", RecordType::A, ResponseCode::NoError);
        msg.add_name_server(Record::from_rdata(
            name("example.com."),
            172800,
            RData::NS(NS(name("ns1.example.com."))),
        ));
        assert_eq!(classify(&msg, 0), ResponseType::Referral);
    }

    #[test]
    fn test_nodata_with_soa() {
        let mut msg = base("example.com.", RecordType::MX, ResponseCode::NoError);
        msg.add_name_server(soa_record("example.com.", 300));
        assert_eq!(classify(&msg, 0), ResponseType::NoRecords);
    }

    #[test]
    fn test_empty_dnskey_not_cacheable() {
        let msg = base("example.com.", RecordType::DNSKEY, ResponseCode::NoError);
        assert_eq!(classify(&msg, 0), ResponseType::NotCacheable);
        assert_eq!(classify(&msg, 0).store(), None);
    }

    #[test]
    fn test_axfr_is_meta() {
        let msg = base("example.com.", RecordType::AXFR, ResponseCode::NoError);
        assert_eq!(classify(&msg, 0), ResponseType::MetaQuery);
    }

    #[test]
    fn test_update_opcode() {
        let mut msg = base("example.com.", RecordType::A, ResponseCode::NoError);
        msg.set_op_code(OpCode::Update);
        assert_eq!(classify(&msg, 0), ResponseType::DynamicUpdate);
    }

    #[test]
    fn test_expired_signature_depends_only_on_clock() {
        let mut msg = base("signed.example.com.", RecordType::A, ResponseCode::NoError);
        msg.add_answer(Record::from_rdata(
            name("signed.example.com."),
            300,
            RData::A(A::new(192, 0, 2, 7)),
        ));
        msg.add_answer(rrsig_record("signed.example.com.", 300, 1_000));

        assert_eq!(classify(&msg, 999), ResponseType::Success);
        assert_eq!(classify(&msg, 1_001), ResponseType::ExpiredSignature);
        // Purity: repeated evaluation agrees.
        assert_eq!(classify(&msg, 1_001), classify(&msg, 1_001));
    }

    #[test]
    fn test_compute_ttl_takes_section_minimum() {
        let mut msg = base("example.com.", RecordType::A, ResponseCode::NoError);
        msg.add_answer(Record::from_rdata(
            name("example.com."),
            600,
            RData::A(A::new(192, 0, 2, 1)),
        ));
        msg.add_name_server(Record::from_rdata(
            name("example.com."),
            120,
            RData::NS(NS(name("ns1.example.com."))),
        ));
        assert_eq!(compute_ttl(&msg, ResponseType::Success, 0), 120);
    }

    #[test]
    fn test_compute_ttl_considers_signature_validity() {
        let mut msg = base("signed.example.com.", RecordType::A, ResponseCode::NoError);
        msg.add_answer(Record::from_rdata(
            name("signed.example.com."),
            3600,
            RData::A(A::new(192, 0, 2, 1)),
        ));
        // Signature has 60 seconds of validity left; that wins.
        msg.add_answer(rrsig_record("signed.example.com.", 3600, 1_060));
        assert_eq!(compute_ttl(&msg, ResponseType::Success, 1_000), 60);
    }

    #[test]
    fn test_compute_ttl_clamps() {
        let mut msg = base("example.com.", RecordType::A, ResponseCode::NoError);
        msg.add_answer(Record::from_rdata(
            name("example.com."),
            1,
            RData::A(A::new(192, 0, 2, 1)),
        ));
        assert_eq!(compute_ttl(&msg, ResponseType::Success, 0), MIN_CACHE_TTL);

        let mut msg = base("example.com.", RecordType::A, ResponseCode::NoError);
        msg.add_answer(Record::from_rdata(
            name("example.com."),
            1_000_000,
            RData::A(A::new(192, 0, 2, 1)),
        ));
        assert_eq!(compute_ttl(&msg, ResponseType::Success, 0), MAX_CACHE_TTL);
    }

    #[test]
    fn test_compute_ttl_empty_reply() {
        let msg = base("example.com.", RecordType::A, ResponseCode::NoError);
        assert_eq!(compute_ttl(&msg, ResponseType::Success, 0), MIN_CACHE_TTL);
    }
}
