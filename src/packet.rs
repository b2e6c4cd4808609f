//! DHCP wire format (RFC 2131).
//!
//! Requests are parsed into the fixed BOOTP header plus raw option TLVs;
//! only the handful of options the server acts on get typed accessors.
//! Replies are built from a [`ReplyOption`] list produced by the option
//! resolver and padded to the 300-byte BOOTP minimum.
//!
//! ```text
//! op htype hlen hops | xid | secs flags | ciaddr | yiaddr | siaddr | giaddr
//! chaddr (16) | sname (64) | file (128) | 99.130.83.99 | options ... 255
//! ```

use std::net::Ipv4Addr;

use crate::client::{MAX_HARDWARE_LEN, MacAddress};
use crate::error::{Error, Result};
use crate::options::{MessageType, OptionValue};
use crate::reply::ReplyOption;

const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const CHADDR_OFFSET: usize = 28;
const SNAME_OFFSET: usize = 44;
const COOKIE_OFFSET: usize = 236;
const HEADER_SIZE: usize = COOKIE_OFFSET + MAGIC_COOKIE.len();
const MIN_PACKET_SIZE: usize = 300;
const MAX_HOPS: u8 = 16;

const PAD: u8 = 0;
const END: u8 = 255;
const REQUESTED_ADDRESS: u8 = 50;
const MESSAGE_TYPE: u8 = 53;

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;
pub const HTYPE_ETHERNET: u8 = 1;
pub const HLEN_ETHERNET: u8 = 6;

/// One option as it appeared on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOption {
    pub code: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct DhcpPacket {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub options: Vec<RawOption>,
}

fn address_at(data: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(data[offset], data[offset + 1], data[offset + 2], data[offset + 3])
}

impl DhcpPacket {
    /// Parses a datagram.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] for short packets, a wrong magic
    /// cookie, too many relay hops, an `hlen` outside 1..=16, an Ethernet
    /// `hlen` other than 6 or truncated options.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::InvalidPacket(format!(
                "{} bytes is shorter than the {} byte header",
                data.len(),
                HEADER_SIZE
            )));
        }
        if data[COOKIE_OFFSET..HEADER_SIZE] != MAGIC_COOKIE {
            return Err(Error::InvalidPacket("missing DHCP magic cookie".to_string()));
        }

        let (op, htype, hlen, hops) = (data[0], data[1], data[2], data[3]);
        if hops > MAX_HOPS {
            return Err(Error::InvalidPacket(format!("too many relay hops ({})", hops)));
        }
        if hlen == 0 || hlen as usize > MAX_HARDWARE_LEN {
            return Err(Error::InvalidPacket(format!(
                "hardware length must be 1 to {}, got {}",
                MAX_HARDWARE_LEN, hlen
            )));
        }
        if htype == HTYPE_ETHERNET && hlen != HLEN_ETHERNET {
            return Err(Error::InvalidPacket(format!(
                "Ethernet hardware length must be 6, got {}",
                hlen
            )));
        }

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&data[CHADDR_OFFSET..SNAME_OFFSET]);

        Ok(Self {
            op,
            htype,
            hlen,
            hops,
            xid: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            secs: u16::from_be_bytes([data[8], data[9]]),
            flags: u16::from_be_bytes([data[10], data[11]]),
            ciaddr: address_at(data, 12),
            yiaddr: address_at(data, 16),
            siaddr: address_at(data, 20),
            giaddr: address_at(data, 24),
            chaddr,
            options: parse_options(&data[HEADER_SIZE..])?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(576);
        packet.extend_from_slice(&[self.op, self.htype, self.hlen, self.hops]);
        packet.extend_from_slice(&self.xid.to_be_bytes());
        packet.extend_from_slice(&self.secs.to_be_bytes());
        packet.extend_from_slice(&self.flags.to_be_bytes());
        for address in [self.ciaddr, self.yiaddr, self.siaddr, self.giaddr] {
            packet.extend_from_slice(&address.octets());
        }
        packet.extend_from_slice(&self.chaddr);
        packet.resize(COOKIE_OFFSET, 0);
        packet.extend_from_slice(&MAGIC_COOKIE);

        for option in &self.options {
            packet.push(option.code);
            packet.push(option.data.len() as u8);
            packet.extend_from_slice(&option.data);
        }
        packet.push(END);

        if packet.len() < MIN_PACKET_SIZE {
            packet.resize(MIN_PACKET_SIZE, PAD);
        }
        packet
    }

    fn option(&self, code: u8) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|option| option.code == code)
            .map(|option| option.data.as_slice())
    }

    /// Option 53. `None` for plain BOOTP or unknown types.
    pub fn message_type(&self) -> Option<MessageType> {
        match self.option(MESSAGE_TYPE) {
            Some([value]) => MessageType::try_from(*value).ok(),
            _ => None,
        }
    }

    /// Option 50.
    pub fn requested_address(&self) -> Option<Ipv4Addr> {
        match self.option(REQUESTED_ADDRESS) {
            Some(&[a, b, c, d]) => Some(Ipv4Addr::new(a, b, c, d)),
            _ => None,
        }
    }

    /// The first `hlen` bytes of `chaddr`.
    pub fn mac(&self) -> Result<MacAddress> {
        let len = (self.hlen as usize).min(self.chaddr.len());
        MacAddress::from_bytes(&self.chaddr[..len])
    }

    pub fn is_broadcast(&self) -> bool {
        self.flags & 0x8000 != 0
    }

    /// Builds a reply to `request` carrying `options` in order.
    pub fn reply(
        request: &DhcpPacket,
        yiaddr: Ipv4Addr,
        siaddr: Ipv4Addr,
        options: &[ReplyOption],
    ) -> Self {
        Self {
            op: BOOTREPLY,
            htype: request.htype,
            hlen: request.hlen,
            hops: 0,
            xid: request.xid,
            secs: 0,
            flags: request.flags,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr,
            siaddr,
            giaddr: request.giaddr,
            chaddr: request.chaddr,
            options: options.iter().filter_map(encode_option).collect(),
        }
    }
}

fn parse_options(data: &[u8]) -> Result<Vec<RawOption>> {
    let mut options = Vec::new();
    let mut rest = data;

    while let Some((&code, tail)) = rest.split_first() {
        match code {
            PAD => rest = tail,
            END => break,
            _ => {
                let Some((&len, tail)) = tail.split_first() else {
                    return Err(Error::InvalidPacket(format!("option {} has no length", code)));
                };
                let len = len as usize;
                if tail.len() < len {
                    return Err(Error::InvalidPacket(format!("option {} is truncated", code)));
                }
                options.push(RawOption {
                    code,
                    data: tail[..len].to_vec(),
                });
                rest = &tail[len..];
            }
        }
    }

    Ok(options)
}

/// Wire form of a resolved option; the end marker is added by `encode`.
fn encode_option(option: &ReplyOption) -> Option<RawOption> {
    let data = match option {
        ReplyOption::MessageType(message_type) => vec![*message_type as u8],
        ReplyOption::Value(_, value) => encode_value(value),
        ReplyOption::End => return None,
    };
    Some(RawOption {
        code: option.code(),
        data,
    })
}

fn encode_value(value: &OptionValue) -> Vec<u8> {
    let mut data = match value {
        OptionValue::Address(address) => address.octets().to_vec(),
        OptionValue::AddressList(addresses) => addresses
            .iter()
            .take(u8::MAX as usize / 4)
            .flat_map(|address| address.octets())
            .collect(),
        OptionValue::Unsigned(value) => value.to_be_bytes().to_vec(),
        OptionValue::Signed(value) => value.to_be_bytes().to_vec(),
        OptionValue::Text(text) => text.as_bytes().to_vec(),
    };
    data.truncate(u8::MAX as usize);
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::OptionCode;

    fn request(message_type: MessageType, requested: Option<[u8; 4]>) -> Vec<u8> {
        let mut packet = vec![0u8; HEADER_SIZE];
        packet[0] = BOOTREQUEST;
        packet[1] = HTYPE_ETHERNET;
        packet[2] = HLEN_ETHERNET;
        packet[4..8].copy_from_slice(&0xdeadbeefu32.to_be_bytes());
        packet[10..12].copy_from_slice(&0x8000u16.to_be_bytes());
        packet[28..34].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0x00, 0x11, 0x22]);
        packet[COOKIE_OFFSET..HEADER_SIZE].copy_from_slice(&MAGIC_COOKIE);
        packet.extend_from_slice(&[MESSAGE_TYPE, 1, message_type as u8]);
        if let Some(address) = requested {
            packet.extend_from_slice(&[REQUESTED_ADDRESS, 4]);
            packet.extend_from_slice(&address);
        }
        packet.push(END);
        packet
    }

    #[test]
    fn test_parse_request() {
        let packet = DhcpPacket::parse(&request(MessageType::Request, Some([10, 0, 0, 9]))).unwrap();
        assert_eq!(packet.op, BOOTREQUEST);
        assert_eq!(packet.xid, 0xdeadbeef);
        assert!(packet.is_broadcast());
        assert_eq!(packet.message_type(), Some(MessageType::Request));
        assert_eq!(packet.requested_address(), Some(Ipv4Addr::new(10, 0, 0, 9)));
        assert_eq!(packet.mac().unwrap().as_str(), "aa:bb:cc:00:11:22");
    }

    #[test]
    fn test_pad_options_skipped() {
        let mut data = request(MessageType::Discover, None);
        data.pop();
        data.extend_from_slice(&[PAD, PAD, 12, 2, b'p', b'c', END]);
        let packet = DhcpPacket::parse(&data).unwrap();
        assert_eq!(packet.options.len(), 2);
        assert_eq!(packet.options[1].data, b"pc");
    }

    #[test]
    fn test_invalid_packets() {
        assert!(DhcpPacket::parse(&[0u8; 100]).is_err());

        let mut data = request(MessageType::Discover, None);
        data[COOKIE_OFFSET] = 0;
        assert!(DhcpPacket::parse(&data).is_err());

        let mut data = request(MessageType::Discover, None);
        data[3] = MAX_HOPS + 1;
        assert!(DhcpPacket::parse(&data).is_err());

        let mut data = request(MessageType::Discover, None);
        data[2] = 7;
        assert!(DhcpPacket::parse(&data).is_err());

        let mut data = request(MessageType::Discover, None);
        data.pop();
        data.extend_from_slice(&[12, 9, b'x']);
        assert!(DhcpPacket::parse(&data).is_err());
    }

    #[test]
    fn test_hardware_length_bounds() {
        for hlen in [0, 17, 255] {
            let mut data = request(MessageType::Discover, None);
            data[1] = 6;
            data[2] = hlen;
            assert!(DhcpPacket::parse(&data).is_err(), "hlen {} accepted", hlen);
        }

        let mut data = request(MessageType::Discover, None);
        data[1] = 6;
        data[2] = 16;
        let packet = DhcpPacket::parse(&data).unwrap();
        assert_eq!(packet.mac().unwrap().as_str().split(':').count(), 16);

        let mut packet = packet;
        packet.hlen = 0;
        assert!(packet.mac().is_err());
    }

    #[test]
    fn test_reply_encoding() {
        let discover = DhcpPacket::parse(&request(MessageType::Discover, None)).unwrap();
        let options = vec![
            ReplyOption::MessageType(MessageType::Offer),
            ReplyOption::Value(
                OptionCode::SubnetMask,
                OptionValue::Address(Ipv4Addr::new(255, 255, 255, 0)),
            ),
            ReplyOption::Value(OptionCode::LeaseTime, OptionValue::Unsigned(43200)),
            ReplyOption::Value(
                OptionCode::Router,
                OptionValue::AddressList(vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]),
            ),
            ReplyOption::Value(OptionCode::Domain, OptionValue::Text("local".to_string())),
            ReplyOption::End,
        ];
        let offer = DhcpPacket::reply(
            &discover,
            Ipv4Addr::new(10, 0, 0, 5),
            Ipv4Addr::new(10, 0, 0, 1),
            &options,
        );
        let bytes = offer.encode();
        assert!(bytes.len() >= MIN_PACKET_SIZE);

        let parsed = DhcpPacket::parse(&bytes).unwrap();
        assert_eq!(parsed.op, BOOTREPLY);
        assert_eq!(parsed.xid, discover.xid);
        assert_eq!(parsed.yiaddr, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(parsed.message_type(), Some(MessageType::Offer));
        assert_eq!(
            parsed.options[2],
            RawOption {
                code: 51,
                data: 43200u32.to_be_bytes().to_vec()
            }
        );
        assert_eq!(parsed.options[3].data, vec![10, 0, 0, 1, 10, 0, 0, 2]);
        assert_eq!(parsed.options[4].data, b"local");
        assert_eq!(parsed.options.len(), 5);
    }

    #[test]
    fn test_negative_time_zone_encoding() {
        let data = encode_value(&OptionValue::Signed(-3600));
        assert_eq!(data, (-3600i32).to_be_bytes().to_vec());
    }
}
