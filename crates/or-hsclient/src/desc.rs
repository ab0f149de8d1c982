//! Hidden-service descriptors: working out where they live, fetching
//! them, and the contract for parsing them.

use crate::hsid::{HsId, HSID_LEN};
use crate::{Error, Result};
use data_encoding::BASE32_NOPAD;
use digest::Digest;
use futures::io::{AsyncReadExt, AsyncWriteExt};
use or_llcrypto::d::Sha1;
use or_proto::circuit::OwnedCircTarget;
use or_proto::stream::DataStream;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// The number of replicas of each descriptor on the hash ring.
pub(crate) const N_REPLICAS: u8 = 2;

/// How many consecutive directories are responsible for each replica.
pub(crate) const DIRS_PER_REPLICA: usize = 3;

/// Length of one time period for descriptor rotation: one day.
const TIME_PERIOD: u64 = 86_400;

/// A single introduction point, as listed in a service descriptor.
#[derive(Clone, Debug)]
pub struct IntroPoint {
    /// The relay serving as the introduction point.
    target: OwnedCircTarget,
    /// The DER-encoded service key to which introduction requests
    /// must be encrypted.
    service_key_der: Vec<u8>,
}

impl IntroPoint {
    /// Construct a new IntroPoint.
    pub fn new(target: OwnedCircTarget, service_key_der: Vec<u8>) -> Self {
        IntroPoint {
            target,
            service_key_der,
        }
    }
    /// Return the relay serving as this introduction point.
    pub fn target(&self) -> &OwnedCircTarget {
        &self.target
    }
    /// Return the service key for this introduction point.
    pub fn service_key_der(&self) -> &[u8] {
        &self.service_key_der
    }
}

/// A parsed hidden-service descriptor: the parts a client needs.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct HsDesc {
    /// The introduction points for the service.
    pub intro_points: Vec<IntroPoint>,
}

/// An object that can parse (and verify the signature of) a
/// hidden-service descriptor document.
///
/// Directory-document parsing is deliberately outside this workspace;
/// the embedding application supplies an implementation of this
/// trait, just as it supplies the consensus through `DirProvider`.
pub trait HsDescParser: Send + Sync + 'static {
    /// Parse the body of a descriptor document, returning its
    /// introduction points.
    ///
    /// Implementations must verify that the document is correctly
    /// signed with the service key for `hsid`.
    fn parse(&self, hsid: &HsId, body: &[u8]) -> std::result::Result<HsDesc, String>;
}

impl<T: HsDescParser + ?Sized> HsDescParser for Arc<T> {
    fn parse(&self, hsid: &HsId, body: &[u8]) -> std::result::Result<HsDesc, String> {
        (**self).parse(hsid, body)
    }
}

/// Compute the descriptor ID for `hsid` at time `when`, for a given
/// replica.
///
/// The descriptor ID determines where on the directory hash ring the
/// descriptor is stored; it rotates daily, at a time offset derived
/// from the identifier so that not every service rotates at once.
/// Clients with authorization include their descriptor cookie in the
/// computation.
pub(crate) fn descriptor_id(
    hsid: &HsId,
    replica: u8,
    descriptor_cookie: Option<&[u8]>,
    when: SystemTime,
) -> [u8; 20] {
    let unix_time = when
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    let id = hsid.as_bytes();
    // Services rotate at an offset proportional to their first
    // identifier byte, to spread directory load over the day.
    let time_period = (unix_time + u64::from(id[0]) * TIME_PERIOD / 256) / TIME_PERIOD;

    // secret-id-part = H(time-period | descriptor-cookie | replica)
    let mut d = Sha1::new();
    d.update((time_period as u32).to_be_bytes());
    if let Some(cookie) = descriptor_cookie {
        d.update(cookie);
    }
    d.update([replica]);
    let secret_id_part = d.finalize();

    // descriptor-id = H(permanent-id | secret-id-part)
    let mut d = Sha1::new();
    d.update(&id[..]);
    d.update(secret_id_part);
    d.finalize().into()
}

/// Encode a descriptor ID the way the directory protocol spells it.
pub(crate) fn descriptor_id_encoded(desc_id: &[u8; 20]) -> String {
    BASE32_NOPAD.encode(desc_id).to_ascii_lowercase()
}

/// Fetch a descriptor document over an (already-open) directory
/// stream.
///
/// This is a minimal HTTP/1.0 GET; the direct response body is
/// returned without interpretation.
pub(crate) async fn fetch_desc_document(
    mut stream: DataStream,
    desc_id: &[u8; 20],
) -> Result<Vec<u8>> {
    let request = format!(
        "GET /tor/rendezvous2/{} HTTP/1.0\r\n\r\n",
        descriptor_id_encoded(desc_id)
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|_| Error::DescriptorFetchFailed)?;
    stream
        .flush()
        .await
        .map_err(|_| Error::DescriptorFetchFailed)?;

    let mut response = Vec::new();
    stream
        .read_to_end(&mut response)
        .await
        .map_err(|_| Error::DescriptorFetchFailed)?;

    parse_http_response(&response)
}

/// Split a minimal HTTP response into status and body, returning the
/// body on a 200.
fn parse_http_response(response: &[u8]) -> Result<Vec<u8>> {
    let header_end = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or(Error::DescriptorFetchFailed)?;
    let headers = &response[..header_end];
    let status_line = headers.split(|b| *b == b'\r').next().unwrap_or(&[]);
    // "HTTP/1.0 200 OK"
    let ok = status_line
        .split(|b| *b == b' ')
        .nth(1)
        .map(|s| s == b"200")
        .unwrap_or(false);
    if !ok {
        return Err(Error::DescriptorFetchFailed);
    }
    Ok(response[header_end + 4..].to_vec())
}

/// Compute the directory-ring descriptor IDs for every replica of a
/// service's descriptor.
pub(crate) fn all_descriptor_ids(
    hsid: &HsId,
    descriptor_cookie: Option<&[u8]>,
    when: SystemTime,
) -> Vec<[u8; 20]> {
    (0..N_REPLICAS)
        .map(|replica| descriptor_id(hsid, replica, descriptor_cookie, when))
        .collect()
}

/// Helper so the identifier length is visibly consistent with the
/// digest math above.
const _: () = assert!(HSID_LEN == 10);

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn test_hsid() -> HsId {
        "duskgytldkxiuqc6.onion".parse().unwrap()
    }

    #[test]
    fn descriptor_ids_differ_by_replica() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        let id0 = descriptor_id(&test_hsid(), 0, None, now);
        let id1 = descriptor_id(&test_hsid(), 1, None, now);
        assert_ne!(id0, id1);
        assert_eq!(all_descriptor_ids(&test_hsid(), None, now), vec![id0, id1]);
    }

    #[test]
    fn descriptor_ids_rotate_daily() {
        let t1 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        let t2 = t1 + Duration::from_secs(2 * TIME_PERIOD);
        let id1 = descriptor_id(&test_hsid(), 0, None, t1);
        let id2 = descriptor_id(&test_hsid(), 0, None, t2);
        assert_ne!(id1, id2);

        // Within a few seconds, the ID is stable.
        let id3 = descriptor_id(&test_hsid(), 0, None, t1 + Duration::from_secs(5));
        assert_eq!(id1, id3);
    }

    #[test]
    fn cookie_changes_location() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        let without = descriptor_id(&test_hsid(), 0, None, now);
        let with = descriptor_id(&test_hsid(), 0, Some(b"cookie!"), now);
        assert_ne!(without, with);
    }

    #[test]
    fn http_responses() {
        let ok = b"HTTP/1.0 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        assert_eq!(parse_http_response(ok).unwrap(), b"hello");

        let not_found = b"HTTP/1.0 404 Not found\r\n\r\n";
        assert!(parse_http_response(not_found).is_err());

        let garbage = b"not http at all";
        assert!(parse_http_response(garbage).is_err());
    }

    #[test]
    fn encoded_ids_are_lowercase_base32() {
        let id = [0xff; 20];
        let s = descriptor_id_encoded(&id);
        assert_eq!(s.len(), 32);
        assert!(s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
