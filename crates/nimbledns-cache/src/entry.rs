//! Cached response entries.
//!
//! An entry stores the wire form of a response with its OPT pseudo-record
//! stripped; EDNS metadata is rebuilt per request at serve time. Entries are
//! immutable after publication. The one exception is the prefetch flag, a
//! monotonic compare-and-set guard.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hickory_proto::op::{Edns, Message, MessageType};
use hickory_proto::rr::rdata::opt::{EdnsCode, EdnsOption};
use hickory_proto::rr::RecordType;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use nimbledns_core::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// RFC 8914 Extended DNS Error option code.
const EDE_OPTION_CODE: u16 = 15;

/// Wall-clock seconds. All TTL arithmetic in the cache is done on absolute
/// second timestamps so tests can use virtual time.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Extended-error payload preserved from a stored response's OPT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedError {
    pub code: u16,
    pub text: String,
}

pub struct CacheEntry {
    /// Packed response, OPT removed.
    wire: Vec<u8>,
    /// Absolute time the entry was produced, unix seconds.
    stored: u64,
    /// Effective TTL in seconds.
    ttl: u32,
    /// TTL at first store; basis for the prefetch fraction.
    orig_ttl: u32,
    /// Set at most once, preventing duplicate prefetches for this entry.
    prefetch: AtomicBool,
    ede: Option<ExtendedError>,
    /// Configured per-entry rate in qps; 0 means unlimited.
    rate: u32,
}

impl CacheEntry {
    /// Build an entry from a response. Strips every OPT from the message,
    /// keeping any extended-error option it carried, and packs the rest.
    /// A response that cannot be packed is refused.
    pub fn from_response(res: &Message, ttl: u32, rate: u32, now: u64) -> Result<Self> {
        let mut msg = res.clone();

        let ede = msg.extensions_mut().take().as_ref().and_then(extract_ede);
        // OPT records inserted directly into the additional section rather
        // than through the edns accessors are stripped too.
        let additionals: Vec<_> = msg
            .take_additionals()
            .into_iter()
            .filter(|r| r.record_type() != RecordType::OPT)
            .collect();
        msg.insert_additionals(additionals);

        let wire = msg.to_bytes().map_err(|e| Error::WirePack(e.to_string()))?;

        Ok(Self {
            wire,
            stored: now,
            ttl,
            orig_ttl: ttl,
            prefetch: AtomicBool::new(false),
            ede,
            rate,
        })
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.stored) >= self.ttl as u64
    }

    /// Seconds of validity left at `now`.
    pub fn remaining(&self, now: u64) -> u32 {
        (self.ttl as u64).saturating_sub(now.saturating_sub(self.stored)) as u32
    }

    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn extended_error(&self) -> Option<&ExtendedError> {
        self.ede.as_ref()
    }

    /// True when the entry is close enough to expiry that a refresh is due:
    /// `remaining <= threshold% of orig_ttl`. A zero threshold disables.
    pub fn should_prefetch(&self, threshold_pct: u32, now: u64) -> bool {
        if threshold_pct == 0 || self.is_expired(now) || self.prefetch.load(Ordering::Relaxed) {
            return false;
        }
        self.remaining(now) as u64 * 100 <= self.orig_ttl as u64 * threshold_pct as u64
    }

    /// Claim the one prefetch this entry is entitled to. Only the caller that
    /// flips the flag gets `true`.
    pub fn claim_prefetch(&self) -> bool {
        self.prefetch
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Materialise a reply to `req` from the stored wire bytes.
    ///
    /// The stored Rcode and record sections are preserved; the id and
    /// question come from the request. Each record's TTL is decremented by
    /// the time the entry has spent in the cache. AA is always cleared, and
    /// AD is cleared whenever the request has CD set (RFC 4035 §3.2.2).
    pub fn to_msg(&self, req: &Message, now: u64) -> Result<Message> {
        if self.is_expired(now) {
            return Err(Error::CacheExpired);
        }

        let mut msg = Message::from_bytes(&self.wire)?;

        msg.set_id(req.id());
        msg.set_message_type(MessageType::Response);
        msg.set_op_code(req.op_code());
        msg.set_recursion_desired(req.recursion_desired());
        msg.set_recursion_available(true);
        msg.set_authoritative(false);
        msg.set_checking_disabled(req.checking_disabled());
        if req.checking_disabled() {
            msg.set_authentic_data(false);
        }

        msg.take_queries();
        for q in req.queries() {
            msg.add_query(q.clone());
        }

        let elapsed = now.saturating_sub(self.stored) as u32;
        let rewrite = |records: Vec<hickory_proto::rr::Record>| {
            records
                .into_iter()
                .map(|mut r| {
                    if r.record_type() != RecordType::OPT {
                        let ttl = r.ttl().saturating_sub(elapsed);
                        r.set_ttl(ttl);
                    }
                    r
                })
                .collect::<Vec<_>>()
        };
        let answers = rewrite(msg.take_answers());
        msg.insert_answers(answers);
        let authority = rewrite(msg.take_name_servers());
        msg.insert_name_servers(authority);
        let additionals = rewrite(msg.take_additionals());
        msg.insert_additionals(additionals);

        // Re-emit the stored extended error, but only to clients that spoke
        // EDNS0 themselves.
        if let Some(ede) = &self.ede {
            if let Some(req_edns) = req.edns() {
                let mut edns = Edns::new();
                edns.set_version(0);
                edns.set_max_payload(req_edns.max_payload().max(512));
                edns.options_mut().insert(encode_ede(ede));
                msg.set_edns(edns);
            }
        }

        Ok(msg)
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("wire_len", &self.wire.len())
            .field("stored", &self.stored)
            .field("ttl", &self.ttl)
            .field("orig_ttl", &self.orig_ttl)
            .field("rate", &self.rate)
            .finish()
    }
}

fn extract_ede(edns: &Edns) -> Option<ExtendedError> {
    let opt = edns.options().get(EdnsCode::Unknown(EDE_OPTION_CODE))?;
    match opt {
        EdnsOption::Unknown(_, data) if data.len() >= 2 => Some(ExtendedError {
            code: u16::from_be_bytes([data[0], data[1]]),
            text: String::from_utf8_lossy(&data[2..]).into_owned(),
        }),
        _ => None,
    }
}

fn encode_ede(ede: &ExtendedError) -> EdnsOption {
    let mut data = ede.code.to_be_bytes().to_vec();
    data.extend_from_slice(ede.text.as_bytes());
    EdnsOption::Unknown(EDE_OPTION_CODE, data)
}

/// Encode a purge question name: base64 of `"QTYPE:QNAME"`. The admin purge
/// route and the cache's purge recognition share this format.
pub fn purge_qname(qname: &str, qtype: RecordType) -> String {
    BASE64.encode(format!("{qtype}:{qname}"))
}

/// Decode a purge question name back into `(qname, qtype)`.
pub fn parse_purge_qname(label: &str) -> Option<(String, RecordType)> {
    let decoded = BASE64.decode(label).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (qtype, qname) = text.split_once(':')?;
    let qtype = std::str::FromStr::from_str(qtype).ok()?;
    Some((qname.to_string(), qtype))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Query, ResponseCode};
    use hickory_proto::rr::rdata::{A, AAAA, NS};
    use hickory_proto::rr::{Name, RData, Record};
    use std::str::FromStr;

    fn name(s: &str) -> Name {
        Name::from_str(s).unwrap()
    }

    fn request(qname: &str, qtype: RecordType) -> Message {
        let mut req = Message::new();
        req.set_id(4321);
        req.add_query(Query::query(name(qname), qtype));
        req
    }

    fn response(qname: &str) -> Message {
        let mut res = Message::new();
        res.set_id(1);
        res.set_message_type(MessageType::Response);
        res.set_response_code(ResponseCode::NoError);
        res.add_query(Query::query(name(qname), RecordType::A));
        res.add_answer(Record::from_rdata(
            name(qname),
            10,
            RData::A(A::new(192, 0, 2, 1)),
        ));
        res
    }

    #[test]
    fn test_round_trip_preserves_sections_and_rcode() {
        let mut res = response("www.example.com.");
        res.set_response_code(ResponseCode::NXDomain);
        res.add_name_server(Record::from_rdata(
            name("example.com."),
            10,
            RData::NS(NS(name("ns1.example.com."))),
        ));

        let entry = CacheEntry::from_response(&res, 10, 0, 100).unwrap();
        let out = entry
            .to_msg(&request("www.example.com.", RecordType::A), 100)
            .unwrap();

        assert_eq!(out.response_code(), ResponseCode::NXDomain);
        assert_eq!(out.id(), 4321);
        assert_eq!(out.answers().len(), 1);
        assert_eq!(out.name_servers().len(), 1);
        assert_eq!(out.queries().len(), 1);
        assert!(!out.authoritative());
    }

    #[test]
    fn test_ttl_countdown_per_record() {
        // A at 10, AAAA at 20, NS at 10; effective entry TTL is 10.
        let mut res = response("example.com.");
        res.add_answer(Record::from_rdata(
            name("example.com."),
            20,
            RData::AAAA(AAAA::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
        ));
        res.add_name_server(Record::from_rdata(
            name("example.com."),
            10,
            RData::NS(NS(name("ns1.example.com."))),
        ));
        let entry = CacheEntry::from_response(&res, 10, 0, 0).unwrap();

        let at5 = entry
            .to_msg(&request("example.com.", RecordType::A), 5)
            .unwrap();
        let ttls: Vec<u32> = at5.answers().iter().map(|r| r.ttl()).collect();
        assert_eq!(ttls, vec![5, 15]);
        assert_eq!(at5.name_servers()[0].ttl(), 5);

        assert!(entry
            .to_msg(&request("example.com.", RecordType::A), 10)
            .is_err());
        assert!(entry
            .to_msg(&request("example.com.", RecordType::A), 11)
            .is_err());
    }

    #[test]
    fn test_cd_request_clears_ad() {
        let mut res = response("example.com.");
        res.set_authentic_data(true);
        let entry = CacheEntry::from_response(&res, 30, 0, 0).unwrap();

        let mut req = request("example.com.", RecordType::A);
        req.set_checking_disabled(true);
        let out = entry.to_msg(&req, 0).unwrap();
        assert!(!out.authentic_data());
        assert!(out.checking_disabled());

        let plain = entry
            .to_msg(&request("example.com.", RecordType::A), 0)
            .unwrap();
        assert!(plain.authentic_data());
    }

    #[test]
    fn test_opt_stripped_and_ede_preserved() {
        let mut res = response("broken.example.");
        res.set_response_code(ResponseCode::ServFail);
        let mut edns = Edns::new();
        edns.set_version(0);
        edns.set_max_payload(1232);
        edns.options_mut().insert(encode_ede(&ExtendedError {
            code: 22,
            text: "no reachable authority".to_string(),
        }));
        res.set_edns(edns);

        let entry = CacheEntry::from_response(&res, 30, 0, 0).unwrap();
        assert_eq!(
            entry.extended_error(),
            Some(&ExtendedError {
                code: 22,
                text: "no reachable authority".to_string(),
            })
        );

        // A plain-DNS client gets no OPT back.
        let plain = entry
            .to_msg(&request("broken.example.", RecordType::A), 0)
            .unwrap();
        assert!(plain.edns().is_none());

        // An EDNS0 client gets the extended error re-emitted.
        let mut req = request("broken.example.", RecordType::A);
        let mut req_edns = Edns::new();
        req_edns.set_max_payload(4096);
        req.set_edns(req_edns);
        let out = entry.to_msg(&req, 0).unwrap();
        let opt = out.edns().expect("opt rebuilt");
        let ede = extract_ede(opt).expect("ede present");
        assert_eq!(ede.code, 22);
        assert_eq!(ede.text, "no reachable authority");
    }

    #[test]
    fn test_prefetch_flag_claims_once() {
        let res = response("hot.example.");
        let entry = CacheEntry::from_response(&res, 100, 0, 0).unwrap();

        // 10% threshold: due once 90 of the 100 seconds have elapsed.
        assert!(!entry.should_prefetch(10, 50));
        assert!(entry.should_prefetch(10, 95));

        assert!(entry.claim_prefetch());
        assert!(!entry.claim_prefetch());
        assert!(!entry.should_prefetch(10, 95));
    }

    #[test]
    fn test_purge_qname_round_trip() {
        let encoded = purge_qname("example.com.", RecordType::AAAA);
        let (qname, qtype) = parse_purge_qname(&encoded).unwrap();
        assert_eq!(qname, "example.com.");
        assert_eq!(qtype, RecordType::AAAA);
    }

    #[test]
    fn test_remaining_saturates() {
        let res = response("example.com.");
        let entry = CacheEntry::from_response(&res, 10, 0, 100).unwrap();
        assert_eq!(entry.remaining(100), 10);
        assert_eq!(entry.remaining(105), 5);
        assert_eq!(entry.remaining(200), 0);
        assert!(entry.is_expired(110));
    }
}
