// Copyright 2020 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Wire encode/decode for ICMP Echo and Timestamp requests/replies (RFC
//! 792, RFC 4443), including the embedded-original-datagram correlation
//! used by ICMP error messages.
//!
//! Packets are built and parsed as raw big-endian byte buffers rather than
//! through a packet-struct crate: the wire layout is small, fixed, and
//! fully pinned down by the RFCs quoted above, and hand-rolling it avoids
//! depending on packet-struct APIs that drift across versions.

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_DEST_UNREACHABLE: u8 = 3;
pub const ICMP_SOURCE_QUENCH: u8 = 4;
pub const ICMP_REDIRECT: u8 = 5;
pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMP_TIME_EXCEEDED: u8 = 11;
pub const ICMP_PARAM_PROBLEM: u8 = 12;
pub const ICMP_TIMESTAMP_REQUEST: u8 = 13;
pub const ICMP_TIMESTAMP_REPLY: u8 = 14;

pub const ICMP6_DEST_UNREACHABLE: u8 = 1;
pub const ICMP6_PACKET_TOO_BIG: u8 = 2;
pub const ICMP6_TIME_EXCEEDED: u8 = 3;
pub const ICMP6_PARAM_PROBLEM: u8 = 4;
pub const ICMP6_ECHO_REQUEST: u8 = 128;
pub const ICMP6_ECHO_REPLY: u8 = 129;

pub const ICMP_HEADER_LEN: usize = 8;
pub const TIMESTAMP_PAYLOAD_LEN: usize = 12;
pub const DEFAULT_PAYLOAD_LEN: usize = 56;
pub const MAX_PAYLOAD_LEN: usize = 65_507;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("packet too short for its classification")]
    TooShort,
    #[error("payload size {0} exceeds the maximum of {MAX_PAYLOAD_LEN}")]
    PayloadTooLarge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Echo,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpErrorKind {
    DestinationUnreachable,
    SourceQuench,
    Redirect,
    TimeExceeded,
    ParameterProblem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampFields {
    pub originate_ms: u32,
    pub receive_ms: u32,
    pub transmit_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    EchoReply {
        id: u16,
        seq: u16,
    },
    TimestampReply {
        id: u16,
        seq: u16,
        fields: TimestampFields,
    },
    /// An ICMP error quoting our original request's header.
    EmbeddedError {
        kind: IcmpErrorKind,
        id: u16,
        seq: u16,
    },
    /// Recognized but not actionable (not our echo/timestamp reply, not an
    /// error we can correlate).
    Other,
}

/// Builds and parses ICMP packets for one run: fixed identifier, fixed
/// payload shape.
pub struct IcmpCodec {
    pub ident: u16,
    pub payload_len: usize,
    pub random_payload: bool,
    pub timestamp_mode: bool,
}

impl IcmpCodec {
    pub fn new(ident: u16, payload_len: usize, random_payload: bool, timestamp_mode: bool) -> Result<Self, CodecError> {
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(CodecError::PayloadTooLarge(payload_len));
        }
        Ok(Self {
            ident,
            payload_len: if timestamp_mode { TIMESTAMP_PAYLOAD_LEN } else { payload_len },
            random_payload,
            timestamp_mode,
        })
    }

    pub fn request_kind(&self) -> RequestKind {
        if self.timestamp_mode {
            RequestKind::Timestamp
        } else {
            RequestKind::Echo
        }
    }

    /// Builds a request packet for `seq`, ready to hand to the transport.
    pub fn encode_request(&self, family: IpFamily, seq: u16) -> Vec<u8> {
        let mut buf = vec![0u8; ICMP_HEADER_LEN + self.payload_len];
        let request_type = match (family, self.request_kind()) {
            (IpFamily::V4, RequestKind::Echo) => ICMP_ECHO_REQUEST,
            (IpFamily::V6, RequestKind::Echo) => ICMP6_ECHO_REQUEST,
            (IpFamily::V4, RequestKind::Timestamp) => ICMP_TIMESTAMP_REQUEST,
            (IpFamily::V6, RequestKind::Timestamp) => ICMP6_ECHO_REQUEST, // timestamp is v4-only
        };
        buf[0] = request_type;
        buf[1] = 0;
        BigEndian::write_u16(&mut buf[4..6], self.ident);
        BigEndian::write_u16(&mut buf[6..8], seq);

        if self.random_payload && !self.timestamp_mode {
            let mut rng = rand::thread_rng();
            use rand::RngCore;
            rng.fill_bytes(&mut buf[ICMP_HEADER_LEN..]);
        }
        // Timestamp originate field defaults to zero; a real originate
        // clock is out of scope (the engine correlates via seq, not via
        // the timestamp payload).

        let sum = checksum(&buf);
        BigEndian::write_u16(&mut buf[2..4], sum);
        buf
    }

    /// Decodes a received IPv4 datagram (with its IP header still
    /// attached, as delivered by a raw `SOCK_RAW`/`IPPROTO_ICMP` socket).
    pub fn decode_v4(&self, datagram: &[u8]) -> Result<Decoded, CodecError> {
        let ihl_words = datagram.first().map(|b| (b & 0x0f) as usize).ok_or(CodecError::TooShort)?;
        let ip_header_len = ihl_words * 4;
        if datagram.len() < ip_header_len + 1 {
            return Err(CodecError::TooShort);
        }
        let icmp = &datagram[ip_header_len..];
        self.decode_icmp_payload(icmp, IpFamily::V4)
    }

    /// Decodes a received ICMPv6 payload (the OS strips the IPv6 header
    /// before delivery).
    pub fn decode_v6(&self, payload: &[u8]) -> Result<Decoded, CodecError> {
        self.decode_icmp_payload(payload, IpFamily::V6)
    }

    fn decode_icmp_payload(&self, icmp: &[u8], family: IpFamily) -> Result<Decoded, CodecError> {
        if icmp.len() < ICMP_HEADER_LEN {
            return Err(CodecError::TooShort);
        }
        let icmp_type = icmp[0];

        let expected_reply = match (family, self.request_kind()) {
            (IpFamily::V4, RequestKind::Echo) => ICMP_ECHO_REPLY,
            (IpFamily::V6, RequestKind::Echo) => ICMP6_ECHO_REPLY,
            (IpFamily::V4, RequestKind::Timestamp) => ICMP_TIMESTAMP_REPLY,
            (IpFamily::V6, RequestKind::Timestamp) => ICMP6_ECHO_REPLY,
        };

        if icmp_type == expected_reply {
            let id = BigEndian::read_u16(&icmp[4..6]);
            let seq = BigEndian::read_u16(&icmp[6..8]);
            if id != self.ident {
                return Ok(Decoded::Other);
            }
            return if self.timestamp_mode {
                if icmp.len() < ICMP_HEADER_LEN + TIMESTAMP_PAYLOAD_LEN {
                    return Err(CodecError::TooShort);
                }
                let fields = TimestampFields {
                    originate_ms: BigEndian::read_u32(&icmp[8..12]),
                    receive_ms: BigEndian::read_u32(&icmp[12..16]),
                    transmit_ms: BigEndian::read_u32(&icmp[16..20]),
                };
                Ok(Decoded::TimestampReply { id, seq, fields })
            } else {
                Ok(Decoded::EchoReply { id, seq })
            };
        }

        if let Some(kind) = error_kind_for(family, icmp_type) {
            return self.decode_embedded_error(icmp, family, kind);
        }

        Ok(Decoded::Other)
    }

    /// Error messages carry: 1B type, 1B code, 2B checksum, 4B
    /// type-specific field, then the embedded original IP+ICMP header.
    fn decode_embedded_error(&self, icmp: &[u8], family: IpFamily, kind: IcmpErrorKind) -> Result<Decoded, CodecError> {
        const ERROR_PREFIX_LEN: usize = 8;
        if icmp.len() < ERROR_PREFIX_LEN {
            return Err(CodecError::TooShort);
        }
        let embedded = &icmp[ERROR_PREFIX_LEN..];

        let original_icmp = match family {
            IpFamily::V4 => {
                let ihl_words = embedded.first().map(|b| (b & 0x0f) as usize).ok_or(CodecError::TooShort)?;
                let header_len = ihl_words * 4;
                if embedded.len() < header_len + ICMP_HEADER_LEN {
                    return Err(CodecError::TooShort);
                }
                &embedded[header_len..]
            }
            IpFamily::V6 => {
                const IPV6_HEADER_LEN: usize = 40;
                if embedded.len() < IPV6_HEADER_LEN + ICMP_HEADER_LEN {
                    return Err(CodecError::TooShort);
                }
                &embedded[IPV6_HEADER_LEN..]
            }
        };

        let id = BigEndian::read_u16(&original_icmp[4..6]);
        let seq = BigEndian::read_u16(&original_icmp[6..8]);

        // Per the design notes: the v6 embedded id is best-effort only and
        // must never gate acceptance; only v4 enforces the id match here.
        if family == IpFamily::V4 && id != self.ident {
            return Ok(Decoded::Other);
        }

        Ok(Decoded::EmbeddedError { kind, id, seq })
    }
}

fn error_kind_for(family: IpFamily, icmp_type: u8) -> Option<IcmpErrorKind> {
    match family {
        IpFamily::V4 => match icmp_type {
            ICMP_DEST_UNREACHABLE => Some(IcmpErrorKind::DestinationUnreachable),
            ICMP_SOURCE_QUENCH => Some(IcmpErrorKind::SourceQuench),
            ICMP_REDIRECT => Some(IcmpErrorKind::Redirect),
            ICMP_TIME_EXCEEDED => Some(IcmpErrorKind::TimeExceeded),
            ICMP_PARAM_PROBLEM => Some(IcmpErrorKind::ParameterProblem),
            _ => None,
        },
        IpFamily::V6 => match icmp_type {
            ICMP6_DEST_UNREACHABLE => Some(IcmpErrorKind::DestinationUnreachable),
            ICMP6_PACKET_TOO_BIG => Some(IcmpErrorKind::SourceQuench), // closest analogue; surfaced distinctly by caller if needed
            ICMP6_TIME_EXCEEDED => Some(IcmpErrorKind::TimeExceeded),
            ICMP6_PARAM_PROBLEM => Some(IcmpErrorKind::ParameterProblem),
            _ => None,
        },
    }
}

/// RFC 1071 one's-complement checksum over a buffer whose checksum field
/// (bytes 2..4) is still zero.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(BigEndian::read_u16(chunk));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_roundtrip_recovers_id_and_seq() {
        let codec = IcmpCodec::new(0xBEEF, DEFAULT_PAYLOAD_LEN, false, false).unwrap();
        let mut pkt = codec.encode_request(IpFamily::V4, 42);
        // Flip the outgoing request into a reply in place, as a loopback
        // stack effectively does.
        pkt[0] = ICMP_ECHO_REPLY;
        BigEndian::write_u16(&mut pkt[2..4], 0);
        let sum = checksum(&pkt);
        BigEndian::write_u16(&mut pkt[2..4], sum);

        // For v4 the decoder expects an IP header prefix; prepend a
        // minimal 20-byte one (IHL=5).
        let mut datagram = vec![0x45u8, 0, 0, 0, 0, 0, 0, 0, 64, 1, 0, 0, 127, 0, 0, 1, 127, 0, 0, 1];
        datagram.extend_from_slice(&pkt);
        match codec.decode_v4(&datagram).unwrap() {
            Decoded::EchoReply { id, seq } => {
                assert_eq!(id, 0xBEEF);
                assert_eq!(seq, 42);
            }
            other => panic!("unexpected decode result: {:?}", other),
        }
    }

    #[test]
    fn echo_v6_roundtrip() {
        let codec = IcmpCodec::new(7, DEFAULT_PAYLOAD_LEN, false, false).unwrap();
        let mut pkt = codec.encode_request(IpFamily::V6, 99);
        pkt[0] = ICMP6_ECHO_REPLY;
        BigEndian::write_u16(&mut pkt[2..4], 0);
        let sum = checksum(&pkt);
        BigEndian::write_u16(&mut pkt[2..4], sum);

        match codec.decode_v6(&pkt).unwrap() {
            Decoded::EchoReply { id, seq } => {
                assert_eq!(id, 7);
                assert_eq!(seq, 99);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn mismatched_id_is_discarded() {
        let codec = IcmpCodec::new(1, DEFAULT_PAYLOAD_LEN, false, false).unwrap();
        let mut pkt = codec.encode_request(IpFamily::V6, 1);
        pkt[0] = ICMP6_ECHO_REPLY;
        BigEndian::write_u16(&mut pkt[4..6], 2); // someone else's id
        BigEndian::write_u16(&mut pkt[2..4], 0);
        let sum = checksum(&pkt);
        BigEndian::write_u16(&mut pkt[2..4], sum);

        assert_eq!(codec.decode_v6(&pkt).unwrap(), Decoded::Other);
    }

    #[test]
    fn too_short_packet_is_rejected() {
        let codec = IcmpCodec::new(1, DEFAULT_PAYLOAD_LEN, false, false).unwrap();
        assert_eq!(codec.decode_v6(&[8, 0, 0]), Err(CodecError::TooShort));
    }

    #[test]
    fn timestamp_roundtrip_extracts_three_fields() {
        let codec = IcmpCodec::new(5, 0, false, true).unwrap();
        let mut pkt = codec.encode_request(IpFamily::V4, 1);
        pkt[0] = ICMP_TIMESTAMP_REPLY;
        BigEndian::write_u32(&mut pkt[8..12], 1_000);
        BigEndian::write_u32(&mut pkt[12..16], 2_000);
        BigEndian::write_u32(&mut pkt[16..20], 3_000);
        BigEndian::write_u16(&mut pkt[2..4], 0);
        let sum = checksum(&pkt);
        BigEndian::write_u16(&mut pkt[2..4], sum);

        let mut datagram = vec![0x45u8, 0, 0, 0, 0, 0, 0, 0, 64, 1, 0, 0, 127, 0, 0, 1, 127, 0, 0, 1];
        datagram.extend_from_slice(&pkt);

        match codec.decode_v4(&datagram).unwrap() {
            Decoded::TimestampReply { id, seq, fields } => {
                assert_eq!(id, 5);
                assert_eq!(seq, 1);
                assert_eq!(fields.originate_ms, 1_000);
                assert_eq!(fields.receive_ms, 2_000);
                assert_eq!(fields.transmit_ms, 3_000);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn embedded_time_exceeded_recovers_original_id_and_seq() {
        let codec = IcmpCodec::new(0xAAAA, DEFAULT_PAYLOAD_LEN, false, false).unwrap();
        let original_request = codec.encode_request(IpFamily::V4, 17);

        // Build a synthetic Time Exceeded message: 8-byte error header,
        // then an embedded IPv4 header, then the first 8 bytes of our
        // original request.
        let mut msg = vec![0u8; 8];
        msg[0] = ICMP_TIME_EXCEEDED;
        let mut embedded_ip = vec![0x45u8, 0, 0, 0, 0, 0, 0, 0, 1, 1, 0, 0, 10, 0, 0, 1, 127, 0, 0, 1];
        embedded_ip.extend_from_slice(&original_request[..ICMP_HEADER_LEN]);
        msg.extend_from_slice(&embedded_ip);

        let mut datagram = vec![0x45u8, 0, 0, 0, 0, 0, 0, 0, 64, 1, 0, 0, 9, 9, 9, 9, 127, 0, 0, 1];
        datagram.extend_from_slice(&msg);

        match codec.decode_v4(&datagram).unwrap() {
            Decoded::EmbeddedError { kind, id, seq } => {
                assert_eq!(kind, IcmpErrorKind::TimeExceeded);
                assert_eq!(id, 0xAAAA);
                assert_eq!(seq, 17);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn checksum_of_known_packet_matches_zero_when_verified() {
        let codec = IcmpCodec::new(1, 0, false, false).unwrap();
        let pkt = codec.encode_request(IpFamily::V4, 0);
        // A packet with a correctly-computed checksum checksums to zero
        // when verified as a whole (standard RFC 1071 property).
        assert_eq!(checksum(&pkt), 0);
    }

    #[test]
    fn payload_too_large_is_rejected() {
        assert_eq!(
            IcmpCodec::new(1, MAX_PAYLOAD_LEN + 1, false, false).unwrap_err(),
            CodecError::PayloadTooLarge(MAX_PAYLOAD_LEN + 1)
        );
    }
}
