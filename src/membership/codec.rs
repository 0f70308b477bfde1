//! Membership list and record encoding
//!
//! All integers are big-endian. A membership list is a fixed header followed by
//! one variable-length entry per site:
//!
//! ```text
//! header: format_version:u32 generation:u32 change_counter:u32
//! entry:  host_len:u16 host:[u8; host_len] port:u16 status_flags:u32
//! ```
//!
//! Persisted table records reuse the same field widths. The metadata record is
//! stored under the key of an empty host with port 0.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::types::{MembershipList, MembershipStatus, SiteAddr, SiteStatus};
use crate::error::CodecError;

/// Current membership format version
pub const FORMAT_VERSION: u32 = 1;

const HEADER_LEN: usize = 12;

fn need(buf: &impl Buf, n: usize) -> Result<(), CodecError> {
    if buf.remaining() < n {
        return Err(CodecError::Truncated {
            needed: n - buf.remaining(),
        });
    }
    Ok(())
}

fn put_addr(out: &mut BytesMut, addr: &SiteAddr) -> Result<(), CodecError> {
    let host = addr.host.as_bytes();
    let len = u16::try_from(host.len()).map_err(|_| CodecError::HostTooLong(host.len()))?;
    out.put_u16(len);
    out.put_slice(host);
    out.put_u16(addr.port);
    Ok(())
}

fn get_addr(buf: &mut impl Buf) -> Result<SiteAddr, CodecError> {
    need(buf, 2)?;
    let len = buf.get_u16() as usize;
    need(buf, len + 2)?;
    let mut host = vec![0u8; len];
    buf.copy_to_slice(&mut host);
    let host = String::from_utf8(host).map_err(|_| CodecError::InvalidHost)?;
    let port = buf.get_u16();
    Ok(SiteAddr { host, port })
}

fn get_status(buf: &mut impl Buf) -> Result<MembershipStatus, CodecError> {
    need(buf, 4)?;
    let flags = buf.get_u32();
    MembershipStatus::from_flags(flags).ok_or(CodecError::UnknownStatus(flags))
}

/// Marshal a membership list for transmission or persistence
pub fn encode_list(list: &MembershipList) -> Result<Bytes, CodecError> {
    let body: usize = list.sites.iter().map(|s| s.host.len() + 8).sum();
    let mut out = BytesMut::with_capacity(HEADER_LEN + body);
    out.put_u32(list.format_version);
    out.put_u32(list.generation);
    out.put_u32(list.change_counter);
    for site in &list.sites {
        put_addr(&mut out, &site.addr())?;
        out.put_u32(site.status.flags());
    }
    Ok(out.freeze())
}

/// Unmarshal a membership list. Unknown format versions are rejected.
pub fn decode_list(mut buf: &[u8]) -> Result<MembershipList, CodecError> {
    need(&buf, HEADER_LEN)?;
    let format_version = buf.get_u32();
    if format_version != FORMAT_VERSION {
        return Err(CodecError::UnsupportedFormat(format_version));
    }
    let generation = buf.get_u32();
    let change_counter = buf.get_u32();

    let mut sites = Vec::new();
    while buf.has_remaining() {
        let addr = get_addr(&mut buf)?;
        let status = get_status(&mut buf)?;
        sites.push(SiteStatus {
            host: addr.host,
            port: addr.port,
            status,
        });
    }

    Ok(MembershipList {
        format_version,
        generation,
        change_counter,
        sites,
    })
}

/// Table key of a site record
pub fn encode_site_key(addr: &SiteAddr) -> Result<Bytes, CodecError> {
    let mut out = BytesMut::with_capacity(addr.host.len() + 4);
    put_addr(&mut out, addr)?;
    Ok(out.freeze())
}

pub fn decode_site_key(mut buf: &[u8]) -> Result<SiteAddr, CodecError> {
    get_addr(&mut buf)
}

/// Key of the distinguished metadata record
pub fn metadata_key() -> Bytes {
    let mut out = BytesMut::with_capacity(4);
    out.put_u16(0);
    out.put_u16(0);
    out.freeze()
}

pub fn is_metadata_key(key: &[u8]) -> bool {
    key == [0u8, 0, 0, 0]
}

pub fn encode_status(status: MembershipStatus) -> Bytes {
    let mut out = BytesMut::with_capacity(4);
    out.put_u32(status.flags());
    out.freeze()
}

pub fn decode_status(mut buf: &[u8]) -> Result<MembershipStatus, CodecError> {
    get_status(&mut buf)
}

/// Metadata record value: format version and change counter
pub fn encode_metadata(format_version: u32, change_counter: u32) -> Bytes {
    let mut out = BytesMut::with_capacity(8);
    out.put_u32(format_version);
    out.put_u32(change_counter);
    out.freeze()
}

pub fn decode_metadata(mut buf: &[u8]) -> Result<(u32, u32), CodecError> {
    need(&buf, 8)?;
    let format_version = buf.get_u32();
    if format_version != FORMAT_VERSION {
        return Err(CodecError::UnsupportedFormat(format_version));
    }
    Ok((format_version, buf.get_u32()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> MembershipList {
        MembershipList {
            format_version: FORMAT_VERSION,
            generation: 7,
            change_counter: 3,
            sites: vec![
                SiteStatus {
                    host: "alpha".into(),
                    port: 6000,
                    status: MembershipStatus::Present,
                },
                SiteStatus {
                    host: "beta.example.com".into(),
                    port: 6001,
                    status: MembershipStatus::Adding,
                },
            ],
        }
    }

    #[test]
    fn test_list_layout() {
        let bytes = encode_list(&sample()).unwrap();
        // header + (2 + 5 + 2 + 4) + (2 + 16 + 2 + 4)
        assert_eq!(bytes.len(), 12 + 13 + 24);
        assert_eq!(&bytes[0..4], &[0, 0, 0, 1]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 7]);
        assert_eq!(&bytes[12..14], &[0, 5]);
        assert_eq!(&bytes[14..19], b"alpha");
        assert_eq!(&bytes[19..21], &6000u16.to_be_bytes());
        assert_eq!(&bytes[21..25], &[0, 0, 0, 4]);
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        let bytes = encode_list(&sample()).unwrap();
        assert!(matches!(
            decode_list(&bytes[..bytes.len() - 1]),
            Err(CodecError::Truncated { .. })
        ));
        assert!(matches!(decode_list(&bytes[..5]), Err(CodecError::Truncated { .. })));

        let mut bad_version = bytes.to_vec();
        bad_version[3] = 9;
        assert_eq!(decode_list(&bad_version), Err(CodecError::UnsupportedFormat(9)));

        let mut bad_status = bytes.to_vec();
        bad_status[24] = 0x10;
        assert_eq!(decode_list(&bad_status), Err(CodecError::UnknownStatus(0x10)));
    }

    #[test]
    fn test_record_codecs() {
        let addr = SiteAddr::new("gamma", 7000);
        let key = encode_site_key(&addr).unwrap();
        assert_eq!(decode_site_key(&key).unwrap(), addr);
        assert!(!is_metadata_key(&key));
        assert!(is_metadata_key(&metadata_key()));

        assert_eq!(
            decode_status(&encode_status(MembershipStatus::Deleting)).unwrap(),
            MembershipStatus::Deleting
        );
        assert_eq!(decode_metadata(&encode_metadata(FORMAT_VERSION, 42)).unwrap(), (1, 42));
    }

    #[test]
    fn test_host_too_long() {
        let addr = SiteAddr::new("h".repeat(70_000), 1);
        assert_eq!(encode_site_key(&addr), Err(CodecError::HostTooLong(70_000)));
    }

    fn status_strategy() -> impl Strategy<Value = MembershipStatus> {
        prop_oneof![
            Just(MembershipStatus::Absent),
            Just(MembershipStatus::Adding),
            Just(MembershipStatus::Present),
            Just(MembershipStatus::Deleting),
        ]
    }

    proptest! {
        #[test]
        fn prop_list_round_trip(
            generation in any::<u32>(),
            counter in any::<u32>(),
            sites in prop::collection::vec(("[a-z0-9.-]{1,40}", any::<u16>(), status_strategy()), 0..20),
        ) {
            let list = MembershipList {
                format_version: FORMAT_VERSION,
                generation,
                change_counter: counter,
                sites: sites
                    .into_iter()
                    .map(|(host, port, status)| SiteStatus { host, port, status })
                    .collect(),
            };
            let decoded = decode_list(&encode_list(&list).unwrap()).unwrap();
            prop_assert_eq!(decoded, list);
        }
    }
}
