//! Cached answer data in presentation form.
//!
//! DNS records keep the first upstream answer as text so the data file stays
//! readable: addresses as dotted or colon notation, names as FQDNs and MX as
//! `"preference exchange"`. A TXT record with one string is kept as that
//! string; several strings are kept as a JSON array so their boundaries
//! survive. Decoding picks a constructor by query type.

use std::net::{Ipv4Addr, Ipv6Addr};

use hickory_proto::rr::rdata::{A, AAAA, CNAME, MX, NS, PTR, TXT};
use hickory_proto::rr::{Name, RData, RecordType};

use crate::error::{Error, Result};

type Constructor = fn(&str) -> Result<RData>;

const CONSTRUCTORS: &[(RecordType, Constructor)] = &[
    (RecordType::A, decode_a),
    (RecordType::AAAA, decode_aaaa),
    (RecordType::CNAME, decode_cname),
    (RecordType::NS, decode_ns),
    (RecordType::PTR, decode_ptr),
    (RecordType::TXT, decode_txt),
    (RecordType::MX, decode_mx),
];

/// Longest character-string a TXT record can carry.
const TXT_SEGMENT_MAX: usize = 255;

/// Text form of `rdata`, or `None` for types the cache does not keep.
pub fn encode(rdata: &RData) -> Option<String> {
    match rdata {
        RData::A(a) => Some(a.0.to_string()),
        RData::AAAA(aaaa) => Some(aaaa.0.to_string()),
        RData::CNAME(name) => Some(name.0.to_string()),
        RData::NS(name) => Some(name.0.to_string()),
        RData::PTR(name) => Some(name.0.to_string()),
        RData::MX(mx) => Some(format!("{} {}", mx.preference(), mx.exchange())),
        RData::TXT(txt) => encode_txt(txt),
        _ => None,
    }
}

/// Rebuilds record data of type `rtype` from its cached text.
///
/// # Errors
///
/// Returns [`Error::Validation`] for unsupported types or malformed text and
/// [`Error::Dns`] for names hickory rejects.
pub fn decode(rtype: RecordType, text: &str) -> Result<RData> {
    let (_, constructor) = CONSTRUCTORS
        .iter()
        .find(|(known, _)| *known == rtype)
        .ok_or_else(|| Error::Validation(format!("{} answers are not cached", rtype)))?;
    constructor(text.trim())
}

fn encode_txt(txt: &TXT) -> Option<String> {
    let segments: Vec<String> = txt
        .txt_data()
        .iter()
        .map(|segment| String::from_utf8_lossy(segment).into_owned())
        .collect();
    match segments.as_slice() {
        [single] if !single.starts_with('[') => Some(single.clone()),
        _ => serde_json::to_string(&segments).ok(),
    }
}

fn fqdn(text: &str) -> Result<Name> {
    if text.ends_with('.') {
        Ok(Name::from_ascii(text)?)
    } else {
        Ok(Name::from_ascii(format!("{}.", text))?)
    }
}

fn malformed(rtype: RecordType, text: &str) -> Error {
    Error::Validation(format!("invalid {} data {:?}", rtype, text))
}

fn decode_a(text: &str) -> Result<RData> {
    let address: Ipv4Addr = text.parse().map_err(|_| malformed(RecordType::A, text))?;
    Ok(RData::A(A(address)))
}

fn decode_aaaa(text: &str) -> Result<RData> {
    let address: Ipv6Addr = text.parse().map_err(|_| malformed(RecordType::AAAA, text))?;
    Ok(RData::AAAA(AAAA(address)))
}

fn decode_cname(text: &str) -> Result<RData> {
    Ok(RData::CNAME(CNAME(fqdn(text)?)))
}

fn decode_ns(text: &str) -> Result<RData> {
    Ok(RData::NS(NS(fqdn(text)?)))
}

fn decode_ptr(text: &str) -> Result<RData> {
    Ok(RData::PTR(PTR(fqdn(text)?)))
}

fn decode_txt(text: &str) -> Result<RData> {
    let segments = match serde_json::from_str::<Vec<String>>(text) {
        Ok(segments) => segments,
        _ => vec![text.to_string()],
    };
    Ok(RData::TXT(TXT::new(
        segments.iter().flat_map(|segment| split_segment(segment)).collect(),
    )))
}

/// Splits `text` into pieces of at most 255 bytes on character boundaries.
fn split_segment(text: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut rest = text;
    while rest.len() > TXT_SEGMENT_MAX {
        let mut end = TXT_SEGMENT_MAX;
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        let (head, tail) = rest.split_at(end);
        pieces.push(head.to_string());
        rest = tail;
    }
    pieces.push(rest.to_string());
    pieces
}

fn decode_mx(text: &str) -> Result<RData> {
    let (preference, exchange) = text
        .split_once(char::is_whitespace)
        .ok_or_else(|| malformed(RecordType::MX, text))?;
    let preference: u16 = preference
        .parse()
        .map_err(|_| malformed(RecordType::MX, text))?;
    Ok(RData::MX(MX::new(preference, fqdn(exchange.trim())?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Message;
    use hickory_proto::rr::Record;
    use hickory_proto::rr::rdata::SOA;

    #[test]
    fn test_decode_addresses() {
        assert_eq!(
            decode(RecordType::A, "93.184.216.34").unwrap(),
            RData::A(A(Ipv4Addr::new(93, 184, 216, 34)))
        );
        assert_eq!(
            decode(RecordType::AAAA, "2001:db8::1").unwrap(),
            RData::AAAA(AAAA("2001:db8::1".parse().unwrap()))
        );
        assert!(decode(RecordType::A, "not-an-ip").is_err());
    }

    #[test]
    fn test_mx_preference_and_exchange() {
        let rdata = decode(RecordType::MX, "10 mail.example.com").unwrap();
        let RData::MX(mx) = &rdata else {
            panic!("expected MX, got {:?}", rdata);
        };
        assert_eq!(mx.preference(), 10);
        assert_eq!(mx.exchange().to_string(), "mail.example.com.");
        assert_eq!(encode(&rdata).unwrap(), "10 mail.example.com.");

        assert!(decode(RecordType::MX, "mail.example.com").is_err());
        assert!(decode(RecordType::MX, "high mail.example.com").is_err());
    }

    #[test]
    fn test_names_become_fqdn() {
        let rdata = decode(RecordType::CNAME, "www.example.com").unwrap();
        assert_eq!(encode(&rdata).unwrap(), "www.example.com.");

        let rdata = decode(RecordType::PTR, "host.lan.").unwrap();
        assert_eq!(encode(&rdata).unwrap(), "host.lan.");
    }

    #[test]
    fn test_txt_text() {
        let rdata = decode(RecordType::TXT, "v=spf1 -all").unwrap();
        assert_eq!(encode(&rdata).unwrap(), "v=spf1 -all");
    }

    #[test]
    fn test_txt_segments_keep_boundaries() {
        let original = RData::TXT(TXT::new(vec!["a".repeat(200), "b".repeat(200)]));
        let text = encode(&original).unwrap();
        let decoded = decode(RecordType::TXT, &text).unwrap();
        assert_eq!(decoded, original);

        let mut message = Message::new();
        message.add_answer(Record::from_rdata(
            Name::from_ascii("txt.example.").unwrap(),
            60,
            decoded,
        ));
        assert!(message.to_vec().is_ok());
    }

    #[test]
    fn test_long_txt_text_split() {
        let rdata = decode(RecordType::TXT, &"x".repeat(600)).unwrap();
        let RData::TXT(txt) = &rdata else {
            panic!("expected TXT, got {:?}", rdata);
        };
        let lengths: Vec<usize> = txt.txt_data().iter().map(|segment| segment.len()).collect();
        assert_eq!(lengths, vec![255, 255, 90]);

        let rdata = decode(RecordType::TXT, "[not json").unwrap();
        assert_eq!(encode(&rdata).unwrap(), "[\"[not json\"]");
    }

    #[test]
    fn test_unsupported_types() {
        assert!(encode(&RData::SOA(SOA::new(
            Name::root(),
            Name::root(),
            1,
            3600,
            600,
            86400,
            60,
        )))
        .is_none());
        assert!(matches!(
            decode(RecordType::SOA, "anything"),
            Err(Error::Validation(_))
        ));
    }
}
