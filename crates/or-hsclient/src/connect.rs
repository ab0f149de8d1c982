//! The introduction/rendezvous dance itself.

use crate::desc::{self, HsDesc, IntroPoint};
use crate::hsid::HsId;
use crate::state;
use crate::{Error, HsClientConnector, Result};

use or_cell::relaycell::hs::{AuthType, IntroPayload, RendCookie};
use or_llcrypto::pk::dh;
use or_llcrypto::pk::rsa::{PublicKey, RsaIdentity};
use or_netdir::{NetDir, RelayDesc, RelayFlags};
use or_proto::circuit::{CircParameters, ClientCirc, OwnedCircTarget};
use or_rtcompat::{Runtime, SleepProvider, SleepProviderExt};

use or_bytes::{SecretBuf, Writer};
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

/// How long we wait for the service to show up at the rendezvous
/// point after a successful introduction.
const RENDEZVOUS2_TIMEOUT: Duration = Duration::from_secs(30);

/// How many times we will (re)build a rendezvous circuit before
/// giving up on the whole connection attempt.
const RENDEZVOUS_ATTEMPTS: usize = 2;

/// Connect to the hidden service identified by `hsid`, returning a
/// circuit whose final (virtual) hop is the service itself.
pub(crate) async fn connect<R: Runtime>(
    conn: &HsClientConnector<R>,
    hsid: HsId,
    auth_cookie: Option<Vec<u8>>,
) -> Result<ClientCirc> {
    let netdir = conn.dir.netdir().ok_or(Error::NeedConsensus)?;

    // 1. Get the service's descriptor from a responsible directory.
    let desc = fetch_descriptor(conn, &hsid, auth_cookie.as_deref(), &netdir).await?;
    if desc.intro_points.is_empty() {
        return Err(Error::BadDescriptor("no introduction points".into()));
    }
    debug!(
        "{}: descriptor has {} introduction points",
        hsid,
        desc.intro_points.len()
    );

    // 2+3+4. Set up a rendezvous point, introduce ourselves, and wait
    // for the service to arrive.  On rendezvous-point failure we
    // rebuild once; on introduction-point failure we move down the
    // descriptor's list.
    let mut last_err = Error::RendezvousFailed;
    for _ in 0..RENDEZVOUS_ATTEMPTS {
        let (rend_circ, rend_relay, cookie) = match establish_rendezvous(conn, &netdir).await {
            Ok(v) => v,
            Err(e) => {
                last_err = e;
                continue;
            }
        };

        match introduce_and_join(conn, &hsid, &desc, &netdir, rend_circ, &rend_relay, cookie, auth_cookie.as_deref())
            .await
        {
            Ok(circ) => {
                info!("{}: rendezvous complete", hsid);
                return Ok(circ);
            }
            Err(e @ Error::IntroductionFailed) => {
                // No introduction point worked; a new rendezvous
                // point won't fix that.
                return Err(e);
            }
            Err(e) => {
                last_err = e;
            }
        }
    }
    Err(last_err)
}

/// Fetch and parse the service's current descriptor, trying each
/// responsible directory in turn.
async fn fetch_descriptor<R: Runtime>(
    conn: &HsClientConnector<R>,
    hsid: &HsId,
    auth_cookie: Option<&[u8]>,
    netdir: &Arc<NetDir>,
) -> Result<HsDesc> {
    let now = conn.runtime.wallclock();
    for desc_id in desc::all_descriptor_ids(hsid, auth_cookie, now) {
        let hsdirs: Vec<OwnedCircTarget> = netdir
            .hsdirs_for(&desc_id, desc::DIRS_PER_REPLICA)
            .into_iter()
            .map(circ_target)
            .collect();
        for hsdir in hsdirs {
            let fetched = async {
                let circ = conn.circmgr.launch_hs_circuit(hsdir.clone()).await?;
                let stream = circ.begin_dir_stream().await.map_err(Error::Protocol)?;
                desc::fetch_desc_document(stream, &desc_id).await
            }
            .await;
            match fetched {
                Ok(body) => match conn.parser.parse(hsid, &body) {
                    Ok(desc) => return Ok(desc),
                    Err(e) => return Err(Error::BadDescriptor(e)),
                },
                Err(e) => {
                    debug!(
                        "{}: descriptor fetch from {} failed: {}",
                        hsid,
                        hsdir.rsa_identity(),
                        e
                    );
                }
            }
        }
    }
    Err(Error::DescriptorFetchFailed)
}

/// Build a circuit to a random rendezvous point and establish a
/// rendezvous there with a fresh cookie.
async fn establish_rendezvous<R: Runtime>(
    conn: &HsClientConnector<R>,
    netdir: &Arc<NetDir>,
) -> Result<(ClientCirc, RelayDesc, RendCookie)> {
    let rend_relay = {
        let mut rng = rand::rng();
        netdir
            .pick_relay(&mut rng, |r| r.has_flags(RelayFlags::FAST))
            .ok_or(Error::RendezvousFailed)?
            .clone()
    };
    let cookie: RendCookie = {
        let mut rng = rand::rng();
        rng.random()
    };
    let circ = conn
        .circmgr
        .launch_hs_circuit(circ_target(&rend_relay))
        .await?;
    circ.establish_rendezvous(cookie)
        .await
        .map_err(Error::Protocol)?;
    debug!("Rendezvous point established at {}", rend_relay.id());
    Ok((circ, rend_relay, cookie))
}

/// Introduce ourselves through one of the descriptor's introduction
/// points, and wait at the rendezvous circuit for the service.
#[allow(clippy::too_many_arguments)]
async fn introduce_and_join<R: Runtime>(
    conn: &HsClientConnector<R>,
    hsid: &HsId,
    desc: &HsDesc,
    netdir: &Arc<NetDir>,
    rend_circ: ClientCirc,
    rend_relay: &RelayDesc,
    cookie: RendCookie,
    auth_cookie: Option<&[u8]>,
) -> Result<ClientCirc> {
    // Start listening for the RENDEZVOUS2 *before* we introduce: the
    // service may be fast.  (The expectation survives across failed
    // introduction attempts on other circuits.)
    let mut rendezvous2 = Some(rend_circ.await_rendezvous2());

    for intro in &desc.intro_points {
        let intro_id = *intro.target().rsa_identity();
        {
            let services = conn.services.lock().expect("services poisoned");
            if !services.intro_point_usable(hsid, &intro_id, conn.runtime.now()) {
                continue;
            }
        }

        match try_introduction(conn, intro, rend_relay, cookie, auth_cookie).await {
            Ok(dh_keypair) => {
                note_intro_outcome(&conn.services, hsid, intro_id, true, conn.runtime.now());
                // 4. The service connects to the rendezvous point and
                // sends its half of the handshake down our circuit.
                let listener = rendezvous2
                    .take()
                    .ok_or_else(|| or_error::internal!("rendezvous listener used twice"))?;
                let hs_body = conn
                    .runtime
                    .timeout(RENDEZVOUS2_TIMEOUT, listener)
                    .await
                    .map_err(|_| Error::RendezvousFailed)?
                    .map_err(Error::Protocol)?;
                return join_circuit(rend_circ, netdir, dh_keypair, &hs_body).await;
            }
            Err(e) => {
                debug!("{}: introduction via {} failed: {}", hsid, intro_id, e);
                note_intro_outcome(&conn.services, hsid, intro_id, false, conn.runtime.now());
            }
        }
    }
    Err(Error::IntroductionFailed)
}

/// Build an introduction circuit and deliver our INTRODUCE1 request.
///
/// On success, returns the DH keypair whose public half we sent.
async fn try_introduction<R: Runtime>(
    conn: &HsClientConnector<R>,
    intro: &IntroPoint,
    rend_relay: &RelayDesc,
    cookie: RendCookie,
    auth_cookie: Option<&[u8]>,
) -> Result<dh::KeyPair> {
    let intro_circ = conn
        .circmgr
        .launch_hs_circuit(intro.target().clone())
        .await?;

    let service_key = PublicKey::from_der(intro.service_key_der())
        .ok_or_else(|| Error::BadDescriptor("unparsable service key".into()))?;
    let pk_id = service_key.to_rsa_identity();

    let timestamp = conn
        .runtime
        .wallclock()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32;

    let (keypair, encrypted) = {
        let mut rng = rand::rng();
        let keypair = dh::KeyPair::generate(&mut rng);
        let payload = IntroPayload::new(
            auth_cookie.map(|c| (AuthType::BASIC, c.to_vec())),
            timestamp,
            rend_relay.addr(),
            rend_relay.or_port(),
            *rend_relay.id(),
            rend_relay.onion_key_der().to_vec(),
            cookie,
            keypair.public_key().to_vec(),
        );
        let mut body = Vec::new();
        body.write(&payload)
            .map_err(|e| Error::Bug(or_error::Bug::from(e)))?;
        let encrypted = hybrid_encrypt(&mut rng, &service_key, &body)?;
        (keypair, encrypted)
    };

    intro_circ
        .send_introduce1(pk_id, encrypted)
        .await
        .map_err(Error::Protocol)?;
    // The introduction circuit has served its purpose.
    intro_circ.terminate();
    Ok(keypair)
}

/// Process the service's RENDEZVOUS2 handshake and extend the
/// rendezvous circuit by the final virtual hop.
async fn join_circuit(
    rend_circ: ClientCirc,
    netdir: &Arc<NetDir>,
    keypair: dh::KeyPair,
    hs_body: &[u8],
) -> Result<ClientCirc> {
    if hs_body.len() != dh::DH_LEN + 20 {
        return Err(Error::Protocol(or_proto::Error::HandshakeProto(
            "Bad RENDEZVOUS2 length".into(),
        )));
    }
    let gy = &hs_body[..dh::DH_LEN];
    let kh: [u8; 20] = hs_body[dh::DH_LEN..]
        .try_into()
        .map_err(|_| or_error::internal!("20-byte slice was not 20 bytes"))?;

    let secret = keypair
        .compute_secret(gy)
        .map_err(|_| Error::Protocol(or_proto::Error::BadCircHandshakeAuth))?;
    let mut seed = SecretBuf::with_capacity(secret.len());
    seed.extend_from_slice(&secret[..]);

    let mut params = CircParameters::default();
    params.initial_send_window = netdir.params().circuit_window;
    rend_circ
        .extend_virtual(seed, kh, &params)
        .await
        .map_err(Error::Protocol)?;
    Ok(rend_circ)
}

/// Record an introduction-point outcome in the per-service state.
fn note_intro_outcome(
    services: &std::sync::Mutex<state::Services>,
    hsid: &HsId,
    intro: RsaIdentity,
    success: bool,
    now: std::time::Instant,
) {
    let mut services = services.lock().expect("services poisoned");
    if success {
        services.note_intro_point_success(hsid, &intro);
    } else {
        services.note_intro_point_failure(*hsid, intro, now);
    }
}

/// Encrypt `body` to the service's RSA key with the protocol's hybrid
/// scheme: the leading bytes ride inside the RSA-OAEP block alongside
/// a fresh AES key, and the remainder is encrypted with that key.
///
/// (This is the same layout as a TAP onionskin, and it has the same
/// constants: an RSA-1024 OAEP block holds 86 bytes, 16 of which are
/// the symmetric key.)
fn hybrid_encrypt<R: Rng + rand::CryptoRng>(
    rng: &mut R,
    key: &PublicKey,
    body: &[u8],
) -> Result<Vec<u8>> {
    use cipher::{KeyIvInit, StreamCipher};
    use or_llcrypto::cipher::aes::Aes128Ctr;

    /// Number of plaintext bytes an OAEP-SHA1 block can hold for a
    /// 1024-bit key.
    const OAEP_CAPACITY: usize = 86;
    /// Length of the symmetric key in the hybrid scheme.
    const SYM_KEY_LEN: usize = 16;

    if body.len() <= OAEP_CAPACITY {
        // Short enough for plain RSA.
        return key
            .encrypt_oaep(rng, body)
            .map_err(|_| Error::Bug(or_error::internal!("hybrid encryption failed")));
    }

    let symkey: [u8; SYM_KEY_LEN] = rng.random();
    let split = OAEP_CAPACITY - SYM_KEY_LEN;

    let mut m = Vec::with_capacity(OAEP_CAPACITY);
    m.extend_from_slice(&symkey);
    m.extend_from_slice(&body[..split]);
    let mut out = key
        .encrypt_oaep(rng, &m)
        .map_err(|_| Error::Bug(or_error::internal!("hybrid encryption failed")))?;

    let mut rest = body[split..].to_vec();
    let mut cipher = Aes128Ctr::new(&symkey.into(), &Default::default());
    cipher.apply_keystream(&mut rest);
    out.extend_from_slice(&rest);
    Ok(out)
}

/// Helper: convert a relay descriptor into a circuit target.
fn circ_target(r: &RelayDesc) -> OwnedCircTarget {
    OwnedCircTarget::new(r.addr(), r.or_port(), *r.id(), r.onion_key_der().to_vec())
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use or_basic_utils::test_rng::testing_rng;
    use or_llcrypto::pk::rsa::PrivateKey;

    #[test]
    fn hybrid_roundtrip() {
        let mut rng = testing_rng();
        let sk = PrivateKey::generate(&mut rng, 1024).unwrap();
        let pk = sk.to_public_key();

        // A short message is plain RSA.
        let short = vec![7_u8; 50];
        let enc = hybrid_encrypt(&mut rng, &pk, &short).unwrap();
        assert_eq!(enc.len(), 128);
        assert_eq!(sk.decrypt_oaep(&enc).unwrap(), short);

        // A long message (like an introduction payload) takes the
        // hybrid path.
        let long: Vec<u8> = (0..=255).cycle().take(250).map(|b| b as u8).collect();
        let enc = hybrid_encrypt(&mut rng, &pk, &long).unwrap();
        assert_eq!(enc.len(), 128 + (250 - 70));

        // Decrypt it by hand, the way a service would.
        let m = sk.decrypt_oaep(&enc[..128]).unwrap();
        let symkey: [u8; 16] = m[..16].try_into().unwrap();
        let mut plain = m[16..].to_vec();
        let mut rest = enc[128..].to_vec();
        use cipher::{KeyIvInit, StreamCipher};
        use or_llcrypto::cipher::aes::Aes128Ctr;
        let mut cipher = Aes128Ctr::new(&symkey.into(), &Default::default());
        cipher.apply_keystream(&mut rest);
        plain.extend_from_slice(&rest);
        assert_eq!(plain, long);
    }
}
