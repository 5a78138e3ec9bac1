//! rustls glue: certified keys, a resolver-backed server config, and a
//! generated self-signed certificate for use as the default entry.

use std::sync::Arc;

use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{self, EcdsaKeyPair, KeyPair};
use rustls::server::ResolvesServerCert;
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::debug;

use crate::error::{TlsError, TlsResult};

/// Pair a certificate chain with its private key.
pub fn certified_key(
    chain: Vec<CertificateDer<'static>>,
    key: &PrivateKeyDer<'_>,
) -> TlsResult<Arc<CertifiedKey>> {
    let signing_key = rustls::crypto::ring::sign::any_supported_type(key).map_err(|e| {
        TlsError::InvalidKey {
            message: e.to_string(),
        }
    })?;
    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

/// Server config that asks `resolver` for a certificate on every handshake.
///
/// Uses the ring provider explicitly so no process-wide default is needed.
pub fn server_config(resolver: Arc<dyn ResolvesServerCert>) -> TlsResult<Arc<ServerConfig>> {
    let config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_cert_resolver(resolver);
    Ok(Arc::new(config))
}

/// Generate an ECDSA P-256 self-signed certificate for `common_name`.
///
/// The name also goes into a subjectAltName dNSName entry unless it is empty.
/// Validity runs from 2020-01-01 to 2099-12-31; the serial is random.
pub fn generate_self_signed(
    common_name: &str,
) -> TlsResult<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let rng = SystemRandom::new();

    let pkcs8 = EcdsaKeyPair::generate_pkcs8(&signature::ECDSA_P256_SHA256_ASN1_SIGNING, &rng)
        .map_err(|e| generation("key generation", e))?;
    let key_pair = EcdsaKeyPair::from_pkcs8(
        &signature::ECDSA_P256_SHA256_ASN1_SIGNING,
        pkcs8.as_ref(),
        &rng,
    )
    .map_err(|e| generation("key parsing", e))?;

    let mut serial = [0u8; 16];
    rng.fill(&mut serial)
        .map_err(|e| generation("serial generation", e))?;
    // Positive and minimally encoded.
    serial[0] = (serial[0] & 0x7F) | 0x40;

    let tbs = build_tbs_certificate(common_name.as_bytes(), &serial, key_pair.public_key().as_ref());
    let sig = key_pair
        .sign(&rng, &tbs)
        .map_err(|e| generation("signing", e))?;
    let cert = wrap_signed_certificate(&tbs, sig.as_ref());

    debug!(common_name, "generated self-signed certificate");
    Ok((
        CertificateDer::from(cert),
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(pkcs8.as_ref().to_vec())),
    ))
}

fn generation(step: &str, e: impl std::fmt::Display) -> TlsError {
    TlsError::Generation {
        message: format!("{step}: {e}"),
    }
}

// OID 1.2.840.10045.4.3.2
const OID_ECDSA_SHA256: &[u8] = &[0x06, 0x08, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x04, 0x03, 0x02];
// OID 1.2.840.10045.2.1
const OID_EC_PUBLIC_KEY: &[u8] = &[0x06, 0x07, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x02, 0x01];
// OID 1.2.840.10045.3.1.7 (secp256r1)
const OID_SECP256R1: &[u8] = &[0x06, 0x08, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x03, 0x01, 0x07];
// OID 2.5.4.3
const OID_COMMON_NAME: &[u8] = &[0x06, 0x03, 0x55, 0x04, 0x03];
// OID 2.5.29.17
const OID_SUBJECT_ALT_NAME: &[u8] = &[0x06, 0x03, 0x55, 0x1D, 0x11];

/// X.509 v3 TBSCertificate: issuer = subject = CN, ECDSA P-256 key.
fn build_tbs_certificate(common_name: &[u8], serial: &[u8], public_key: &[u8]) -> Vec<u8> {
    // version [0] EXPLICIT INTEGER v3
    let version: &[u8] = &[0xA0, 0x03, 0x02, 0x01, 0x02];
    let serial = der_tagged(0x02, serial);
    let sig_alg = der_sequence(&[OID_ECDSA_SHA256]);
    let name = build_dn(common_name);
    let validity = der_sequence(&[
        &der_tagged(0x17, b"200101000000Z"),
        &der_tagged(0x17, b"991231235959Z"),
    ]);
    let spki = der_sequence(&[
        &der_sequence(&[OID_EC_PUBLIC_KEY, OID_SECP256R1]),
        &der_bit_string(public_key),
    ]);

    let extensions = (!common_name.is_empty()).then(|| build_san_extensions(common_name));

    let mut fields: Vec<&[u8]> = vec![
        version,
        serial.as_slice(),
        sig_alg.as_slice(),
        name.as_slice(),
        validity.as_slice(),
        name.as_slice(),
        spki.as_slice(),
    ];
    if let Some(extensions) = &extensions {
        fields.push(extensions);
    }
    der_sequence(&fields)
}

/// `[3] EXPLICIT Extensions` holding one subjectAltName dNSName.
fn build_san_extensions(dns_name: &[u8]) -> Vec<u8> {
    let general_names = der_sequence(&[&der_tagged(0x82, dns_name)]);
    let extension = der_sequence(&[OID_SUBJECT_ALT_NAME, &der_tagged(0x04, &general_names)]);
    der_tagged(0xA3, &der_sequence(&[&extension]))
}

fn wrap_signed_certificate(tbs: &[u8], signature: &[u8]) -> Vec<u8> {
    der_sequence(&[tbs, &der_sequence(&[OID_ECDSA_SHA256]), &der_bit_string(signature)])
}

/// SEQUENCE { SET { SEQUENCE { OID(CN), UTF8String(name) } } }
fn build_dn(cn: &[u8]) -> Vec<u8> {
    let attr = der_sequence(&[OID_COMMON_NAME, &der_tagged(0x0C, cn)]);
    der_sequence(&[&der_tagged(0x31, &attr)])
}

fn der_sequence(elements: &[&[u8]]) -> Vec<u8> {
    der_tagged(0x30, &elements.concat())
}

/// BIT STRING with zero unused bits.
fn der_bit_string(data: &[u8]) -> Vec<u8> {
    let mut contents = Vec::with_capacity(data.len() + 1);
    contents.push(0x00);
    contents.extend_from_slice(data);
    der_tagged(0x03, &contents)
}

fn der_tagged(tag: u8, contents: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(contents.len() + 4);
    out.push(tag);
    der_push_length(&mut out, contents.len());
    out.extend_from_slice(contents);
    out
}

/// Short form below 128, else long form with one or two length bytes.
fn der_push_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
    } else if len < 0x100 {
        out.push(0x81);
        out.push(len as u8);
    } else {
        out.push(0x82);
        out.push((len >> 8) as u8);
        out.push(len as u8);
    }
}
