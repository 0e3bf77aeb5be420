//! X.509 chain checks against the pinned AWS Nitro Enclaves root.
//!
//! The attestation document carries `cabundle` ordered root → intermediate
//! and a leaf `certificate`. The root must be byte-identical to the pinned
//! DER below; every link must be an ECDSA P-384 / SHA-384 signature.

use p384::ecdsa::signature::Verifier;
use p384::ecdsa::{Signature, VerifyingKey};
use x509_parser::certificate::X509Certificate;
use x509_parser::parse_x509_certificate;

use super::AttestationError;

/// `ecdsa-with-SHA384`
const OID_ECDSA_WITH_SHA384: &str = "1.2.840.10045.4.3.3";

/// AWS Nitro Enclaves Root-G1 (DER, 533 bytes), valid 2019-10-28 to 2049-10-28.
const NITRO_ROOT_CERT_HEX: &str = concat!(
    "3082021130820196a003020102021100f93175681b90afe11d46ccb4e4e7f856",
    "300a06082a8648ce3d0403033049310b3009060355040613025553310f300d06",
    "0355040a0c06416d617a6f6e310c300a060355040b0c03415753311b30190603",
    "5504030c126177732e6e6974726f2d656e636c61766573301e170d3139313032",
    "383133323830355a170d3439313032383134323830355a3049310b3009060355",
    "040613025553310f300d060355040a0c06416d617a6f6e310c300a060355040b",
    "0c03415753311b301906035504030c126177732e6e6974726f2d656e636c6176",
    "65733076301006072a8648ce3d020106052b8104002203620004fc0254eba608",
    "c1f36870e29ada90be46383292736e894bfff672d989444b5051e534a4b1f6db",
    "e3c0bc581a32b7b176070ede12d69a3fea211b66e752cf7dd1dd095f6f1370f4",
    "170843d9dc100121e4cf63012809664487c9796284304dc53ff4a3423040300f",
    "0603551d130101ff040530030101ff301d0603551d0e041604149025b50dd905",
    "47e796c396fa729dcf99a9df4b96300e0603551d0f0101ff040403020186300a",
    "06082a8648ce3d0403030369003066023100a37f2f91a1c9bd5ee7b8627c1698",
    "d255038e1f0343f95b63a9628c3d39809545a11ebcbf2e3b55d8aeee71b4c3d6",
    "adf3023100a2f39b1605b27028a5dd4ba069b5016e65b4fbde8fe0061d6a5319",
    "7f9cdaf5d943bc61fc2beb03cb6fee8d2302f3dff6",
);

/// Pinned root certificate bytes.
pub fn nitro_root_der() -> Result<Vec<u8>, AttestationError> {
    hex::decode(NITRO_ROOT_CERT_HEX)
        .map_err(|_| AttestationError::Chain("pinned root is not valid hex".into()))
}

fn parse<'a>(der: &'a [u8], position: &str) -> Result<X509Certificate<'a>, AttestationError> {
    let (_, cert) = parse_x509_certificate(der)
        .map_err(|e| AttestationError::Chain(format!("{position}: unparseable certificate: {e}")))?;
    Ok(cert)
}

/// SEC1 public key bytes of a certificate, as a P-384 verifying key.
pub fn p384_public_key(cert: &X509Certificate<'_>) -> Result<VerifyingKey, AttestationError> {
    let spki = cert.public_key();
    VerifyingKey::from_sec1_bytes(&spki.subject_public_key.data)
        .map_err(|_| AttestationError::Chain("certificate key is not P-384".into()))
}

/// Verifies that `issuer` signed `child`.
fn verify_link(
    child: &X509Certificate<'_>,
    issuer: &X509Certificate<'_>,
    position: &str,
) -> Result<(), AttestationError> {
    let algorithm = child.signature_algorithm.algorithm.to_id_string();
    if algorithm != OID_ECDSA_WITH_SHA384 {
        return Err(AttestationError::Chain(format!(
            "{position}: unsupported signature algorithm {algorithm}"
        )));
    }

    let key = p384_public_key(issuer)?;
    let signature = Signature::from_der(&child.signature_value.data)
        .map_err(|_| AttestationError::Chain(format!("{position}: malformed signature")))?;
    key.verify(child.tbs_certificate.as_ref(), &signature)
        .map_err(|_| AttestationError::Chain(format!("{position}: signature does not verify")))
}

/// Checks the leaf's validity window against `now_unix`.
pub fn check_leaf_validity(leaf_der: &[u8], now_unix: i64) -> Result<(), AttestationError> {
    let leaf = parse(leaf_der, "leaf")?;
    let validity = leaf.validity();
    let not_before = validity.not_before.timestamp();
    let not_after = validity.not_after.timestamp();
    if now_unix < not_before {
        return Err(AttestationError::CertificateValidity(format!(
            "certificate not yet valid (starts at {not_before})"
        )));
    }
    if now_unix > not_after {
        return Err(AttestationError::CertificateValidity(format!(
            "certificate expired at {not_after}"
        )));
    }
    Ok(())
}

/// Walks `pinned_root → cabundle[1..] → leaf`.
pub fn verify_certificate_chain(
    pinned_root: &[u8],
    cabundle: &[Vec<u8>],
    leaf_der: &[u8],
) -> Result<(), AttestationError> {
    let Some(first) = cabundle.first() else {
        return Err(AttestationError::Chain("empty CA bundle".into()));
    };
    if first.as_slice() != pinned_root {
        return Err(AttestationError::Chain(
            "cabundle[0] does not match the pinned Nitro root".into(),
        ));
    }

    let certs = cabundle
        .iter()
        .enumerate()
        .map(|(i, der)| parse(der, &format!("cabundle[{i}]")))
        .collect::<Result<Vec<_>, _>>()?;

    verify_link(&certs[0], &certs[0], "root")?;
    for i in 1..certs.len() {
        verify_link(&certs[i], &certs[i - 1], &format!("cabundle[{i}]"))?;
    }

    let leaf = parse(leaf_der, "leaf")?;
    let last = &certs[certs.len() - 1];
    verify_link(&leaf, last, "leaf")
}

/// Verifies the COSE signature (raw `r ‖ s`) with the leaf's P-384 key.
pub fn verify_cose_signature(
    leaf_der: &[u8],
    sig_structure: &[u8],
    raw_signature: &[u8],
) -> Result<(), AttestationError> {
    let leaf = parse(leaf_der, "leaf")?;
    let key = p384_public_key(&leaf)?;
    verify_raw_p384(&key, sig_structure, raw_signature)
}

pub(crate) fn verify_raw_p384(
    key: &VerifyingKey,
    message: &[u8],
    raw_signature: &[u8],
) -> Result<(), AttestationError> {
    let signature = Signature::from_slice(raw_signature)
        .map_err(|_| AttestationError::Signature("signature is not 96 raw bytes".into()))?;
    key.verify(message, &signature)
        .map_err(|_| AttestationError::Signature("COSE signature does not verify".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use p384::ecdsa::SigningKey;
    use p384::ecdsa::signature::Signer;
    use rand::rngs::OsRng;

    #[test]
    fn pinned_root_parses_and_is_self_signed() {
        let root = nitro_root_der().unwrap();
        assert_eq!(root.len(), 533);
        let cert = parse(&root, "root").unwrap();
        verify_link(&cert, &cert, "root").unwrap();
    }

    #[test]
    fn pinned_root_validity_window() {
        let root = nitro_root_der().unwrap();
        // 2030-01-01
        assert!(check_leaf_validity(&root, 1_893_456_000).is_ok());
        // 2019-01-01, before issuance
        assert!(matches!(
            check_leaf_validity(&root, 1_546_300_800),
            Err(AttestationError::CertificateValidity(_))
        ));
        // 2050-01-01
        assert!(check_leaf_validity(&root, 2_524_608_000).is_err());
    }

    #[test]
    fn chain_rejects_unpinned_root() {
        let root = nitro_root_der().unwrap();
        let mut forged = root.clone();
        let last = forged.len() - 1;
        forged[last] ^= 0xff;
        assert!(matches!(
            verify_certificate_chain(&root, &[forged], &root),
            Err(AttestationError::Chain(_))
        ));
        assert!(verify_certificate_chain(&root, &[], &root).is_err());
    }

    #[test]
    fn chain_of_root_alone_verifies() {
        let root = nitro_root_der().unwrap();
        assert!(verify_certificate_chain(&root, &[root.clone()], &root).is_ok());
    }

    #[test]
    fn raw_signature_verification() {
        let signing = SigningKey::random(&mut OsRng);
        let key = VerifyingKey::from(&signing);
        let message = b"Sig_structure bytes";
        let signature: Signature = signing.sign(message);
        let raw = signature.to_bytes();

        assert!(verify_raw_p384(&key, message, &raw).is_ok());
        assert!(verify_raw_p384(&key, b"other message", &raw).is_err());
        assert!(verify_raw_p384(&key, message, &raw[..95]).is_err());
    }
}
