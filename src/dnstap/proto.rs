//! The subset of the dnstap schema this service reads, plus extraction of
//! (domain, addresses) from a resolver response.

use crate::blocklist::normalize;
use crate::error::DecodeError;
use hickory_proto::op::{Message as DnsMessage, MessageType as DnsMessageType, ResponseCode};
use hickory_proto::rr::RData;
use prost::Message as _;
use std::net::IpAddr;

#[derive(Clone, PartialEq, prost::Message)]
pub struct Dnstap {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub identity: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub version: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub extra: Option<Vec<u8>>,
    #[prost(message, optional, tag = "14")]
    pub message: Option<Message>,
    #[prost(enumeration = "DnstapType", optional, tag = "15")]
    pub r#type: Option<i32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum DnstapType {
    Message = 1,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Message {
    #[prost(enumeration = "MessageType", optional, tag = "1")]
    pub r#type: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub query_address: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub response_address: Option<Vec<u8>>,
    #[prost(uint64, optional, tag = "8")]
    pub query_time_sec: Option<u64>,
    #[prost(bytes = "vec", optional, tag = "10")]
    pub query_message: Option<Vec<u8>>,
    #[prost(uint64, optional, tag = "12")]
    pub response_time_sec: Option<u64>,
    #[prost(fixed32, optional, tag = "13")]
    pub response_time_nsec: Option<u32>,
    #[prost(bytes = "vec", optional, tag = "14")]
    pub response_message: Option<Vec<u8>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    AuthQuery = 1,
    AuthResponse = 2,
    ResolverQuery = 3,
    ResolverResponse = 4,
    ClientQuery = 5,
    ClientResponse = 6,
    ForwarderQuery = 7,
    ForwarderResponse = 8,
    StubQuery = 9,
    StubResponse = 10,
    ToolQuery = 11,
    ToolResponse = 12,
    UpdateQuery = 13,
    UpdateResponse = 14,
}

impl MessageType {
    /// Whether the message carries an answer from a name server. Dynamic
    /// update responses carry no resolution data and are excluded.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            MessageType::AuthResponse
                | MessageType::ResolverResponse
                | MessageType::ClientResponse
                | MessageType::ForwarderResponse
                | MessageType::StubResponse
                | MessageType::ToolResponse
        )
    }
}

/// Addresses a response resolved a domain to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answers {
    pub domain: String,
    pub addresses: Vec<IpAddr>,
}

/// Decodes one dnstap payload. `AAAA` answers are only collected when
/// `ipv6` is set. Duplicate addresses are reported once.
pub fn decode_answers(payload: &[u8], ipv6: bool) -> Result<Answers, DecodeError> {
    let frame = Dnstap::decode(payload)?;
    let message = frame.message.ok_or(DecodeError::NoMessage)?;

    let kind = message.r#type;
    match kind.and_then(|t| MessageType::try_from(t).ok()) {
        Some(t) if t.is_response() => {}
        _ => return Err(DecodeError::NotResponse(kind)),
    }

    let wire = message
        .response_message
        .ok_or(DecodeError::NoResponseMessage)?;
    let dns = DnsMessage::from_vec(&wire)?;

    if dns.message_type() != DnsMessageType::Response {
        return Err(DecodeError::Query);
    }
    if dns.response_code() != ResponseCode::NoError {
        return Err(DecodeError::ResponseCode(dns.response_code()));
    }

    let query = dns.queries().first().ok_or(DecodeError::NoQuestion)?;
    let name = query.name().to_ascii();
    let domain = normalize(&name).ok_or(DecodeError::NoQuestion)?.into_owned();

    let mut addresses = Vec::new();
    for record in dns.answers() {
        let address = match record.data() {
            Some(RData::A(a)) => IpAddr::V4(a.0),
            Some(RData::AAAA(aaaa)) if ipv6 => IpAddr::V6(aaaa.0),
            _ => continue,
        };
        if !addresses.contains(&address) {
            addresses.push(address);
        }
    }

    Ok(Answers { domain, addresses })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Query, ResponseCode};
    use hickory_proto::rr::rdata::{A, AAAA, CNAME};
    use hickory_proto::rr::{Name, Record, RecordType};

    fn dns_response(qname: &str, answers: Vec<Record>, rcode: ResponseCode) -> Vec<u8> {
        let mut msg = DnsMessage::new();
        msg.set_id(42);
        msg.set_message_type(DnsMessageType::Response);
        msg.set_response_code(rcode);
        msg.add_query(Query::query(Name::from_ascii(qname).unwrap(), RecordType::A));
        for answer in answers {
            msg.add_answer(answer);
        }
        msg.to_vec().unwrap()
    }

    fn dnstap(kind: MessageType, response: Option<Vec<u8>>) -> Vec<u8> {
        Dnstap {
            identity: Some(b"resolver-1".to_vec()),
            version: None,
            extra: None,
            message: Some(Message {
                r#type: Some(kind as i32),
                query_address: None,
                response_address: None,
                query_time_sec: None,
                query_message: None,
                response_time_sec: Some(1_700_000_000),
                response_time_nsec: None,
                response_message: response,
            }),
            r#type: Some(DnstapType::Message as i32),
        }
        .encode_to_vec()
    }

    fn a(name: &str, ip: [u8; 4]) -> Record {
        Record::from_rdata(
            Name::from_ascii(name).unwrap(),
            60,
            RData::A(A::new(ip[0], ip[1], ip[2], ip[3])),
        )
    }

    fn aaaa(name: &str, ip: &str) -> Record {
        Record::from_rdata(
            Name::from_ascii(name).unwrap(),
            60,
            RData::AAAA(AAAA(ip.parse().unwrap())),
        )
    }

    #[test]
    fn test_extracts_a_records() {
        let response = dns_response(
            "WWW.Evil.com.",
            vec![
                Record::from_rdata(
                    Name::from_ascii("www.evil.com.").unwrap(),
                    60,
                    RData::CNAME(CNAME(Name::from_ascii("cdn.evil.net.").unwrap())),
                ),
                a("cdn.evil.net.", [1, 2, 3, 4]),
                a("cdn.evil.net.", [5, 6, 7, 8]),
                a("cdn.evil.net.", [1, 2, 3, 4]),
                aaaa("cdn.evil.net.", "2001:db8::1"),
            ],
            ResponseCode::NoError,
        );
        let payload = dnstap(MessageType::ClientResponse, Some(response));

        let answers = decode_answers(&payload, false).unwrap();
        assert_eq!(answers.domain, "www.evil.com");
        assert_eq!(
            answers.addresses,
            vec![
                "1.2.3.4".parse::<IpAddr>().unwrap(),
                "5.6.7.8".parse::<IpAddr>().unwrap()
            ]
        );

        let answers = decode_answers(&payload, true).unwrap();
        assert_eq!(answers.addresses.len(), 3);
        assert_eq!(answers.addresses[2], "2001:db8::1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_rejects_queries_and_failures() {
        let response = dns_response("evil.com.", vec![a("evil.com.", [1, 2, 3, 4])], ResponseCode::NoError);

        assert!(matches!(
            decode_answers(&dnstap(MessageType::ClientQuery, Some(response.clone())), false),
            Err(DecodeError::NotResponse(_))
        ));
        assert!(matches!(
            decode_answers(&dnstap(MessageType::ResolverResponse, None), false),
            Err(DecodeError::NoResponseMessage)
        ));

        let nxdomain = dns_response("evil.com.", vec![], ResponseCode::NXDomain);
        assert!(matches!(
            decode_answers(&dnstap(MessageType::ResolverResponse, Some(nxdomain)), false),
            Err(DecodeError::ResponseCode(ResponseCode::NXDomain))
        ));

        assert!(matches!(
            decode_answers(&dnstap(MessageType::ResolverResponse, Some(vec![1, 2, 3])), false),
            Err(DecodeError::Dns(_))
        ));

        assert!(matches!(
            decode_answers(&[0xff, 0xff, 0xff], false),
            Err(DecodeError::Protobuf(_))
        ));

        let empty = Dnstap {
            identity: None,
            version: None,
            extra: None,
            message: None,
            r#type: Some(DnstapType::Message as i32),
        }
        .encode_to_vec();
        assert!(matches!(decode_answers(&empty, false), Err(DecodeError::NoMessage)));
    }

    #[test]
    fn test_response_without_addresses() {
        let response = dns_response("evil.com.", vec![], ResponseCode::NoError);
        let answers =
            decode_answers(&dnstap(MessageType::ForwarderResponse, Some(response)), true).unwrap();
        assert_eq!(answers.domain, "evil.com");
        assert!(answers.addresses.is_empty());
    }
}
