//! IPv4 codec tests.

use std::net::Ipv4Addr;

use super::datagram::{header_checksum, Datagram, INIT_TTL, IPV4_HEADER_LEN, MAX_IP_PAYLOAD};
use crate::types::IpProtocol;

fn addrs() -> (Ipv4Addr, Ipv4Addr) {
    (Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 1, 0, 2))
}

#[test]
fn test_build_parse_build_is_identity() {
    let (src, dst) = addrs();
    let datagram = Datagram::new(src, dst, IpProtocol::Test, b"hello".to_vec()).unwrap();
    let wire = datagram.encode();

    let parsed = Datagram::decode(&wire).unwrap();
    assert_eq!(parsed.src(), src);
    assert_eq!(parsed.dst(), dst);
    assert_eq!(parsed.ttl(), INIT_TTL);
    assert_eq!(parsed.protocol(), Some(IpProtocol::Test));
    assert_eq!(parsed.payload, b"hello");
    assert!(parsed.checksum_ok());

    // Round trip must reproduce identical bytes.
    assert_eq!(parsed.encode(), wire);
}

#[test]
fn test_checksum_covers_header_with_zeroed_field() {
    let (src, dst) = addrs();
    let datagram = Datagram::new(src, dst, IpProtocol::Tcp, vec![1, 2, 3]).unwrap();
    let wire = datagram.encode();

    // Summing the header as transmitted (checksum included) folds to zero.
    assert_eq!(header_checksum(&wire[..IPV4_HEADER_LEN]), 0);
}

#[test]
fn test_corrupt_header_fails_checksum() {
    let (src, dst) = addrs();
    let datagram = Datagram::new(src, dst, IpProtocol::Test, vec![0xAB; 64]).unwrap();
    let mut wire = datagram.encode();
    wire[8] ^= 0xFF; // mangle the TTL

    let parsed = Datagram::decode(&wire).unwrap();
    assert!(!parsed.checksum_ok());
}

#[test]
fn test_ttl_decrement_then_update_checksum() {
    let (src, dst) = addrs();
    let mut datagram = Datagram::new(src, dst, IpProtocol::Test, vec![]).unwrap();
    datagram.header.ttl -= 1;
    assert!(!datagram.checksum_ok());
    datagram.update_checksum();
    assert!(datagram.checksum_ok());
    assert_eq!(datagram.ttl(), INIT_TTL - 1);
}

#[test]
fn test_rejects_oversized_payload() {
    let (src, dst) = addrs();
    assert!(Datagram::new(src, dst, IpProtocol::Test, vec![0; MAX_IP_PAYLOAD]).is_ok());
    assert!(Datagram::new(src, dst, IpProtocol::Test, vec![0; MAX_IP_PAYLOAD + 1]).is_err());
}

#[test]
fn test_rejects_bad_version_and_options() {
    let (src, dst) = addrs();
    let wire = Datagram::new(src, dst, IpProtocol::Test, vec![])
        .unwrap()
        .encode();

    let mut v6 = wire.clone();
    v6[0] = 0x65; // version 6
    assert!(Datagram::decode(&v6).is_err());

    let mut options = wire.clone();
    options[0] = 0x46; // ihl 6: one option word
    assert!(Datagram::decode(&options).is_err());

    assert!(Datagram::decode(&wire[..10]).is_err());
}

#[test]
fn test_rejects_total_length_beyond_read() {
    let (src, dst) = addrs();
    let mut wire = Datagram::new(src, dst, IpProtocol::Test, vec![1, 2, 3, 4])
        .unwrap()
        .encode();
    wire.truncate(IPV4_HEADER_LEN + 2); // read shorter than tot_len
    assert!(Datagram::decode(&wire).is_err());
}
