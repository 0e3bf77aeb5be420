//! COSE_Sign1 envelope and Nitro attestation document (CBOR).

use std::collections::BTreeMap;

use ciborium::value::Value;

use super::AttestationError;

/// CBOR tag for COSE_Sign1.
const COSE_SIGN1_TAG: u64 = 18;

/// A parsed COSE_Sign1 structure: `[protected, unprotected, payload, signature]`.
#[derive(Clone, Debug, PartialEq)]
pub struct CoseSign1 {
    pub protected: Vec<u8>,
    pub unprotected: Value,
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

impl CoseSign1 {
    /// Parses a tagged or untagged COSE_Sign1 array.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AttestationError> {
        let value: Value = ciborium::de::from_reader(bytes)
            .map_err(|e| AttestationError::Cose(format!("invalid CBOR: {e}")))?;

        let value = match value {
            Value::Tag(COSE_SIGN1_TAG, inner) => *inner,
            Value::Tag(tag, _) => {
                return Err(AttestationError::Cose(format!("unexpected CBOR tag {tag}")));
            }
            other => other,
        };

        let Value::Array(items) = value else {
            return Err(AttestationError::Cose("COSE_Sign1 is not an array".into()));
        };
        let [protected, unprotected, payload, signature]: [Value; 4] =
            items.try_into().map_err(|items: Vec<Value>| {
                AttestationError::Cose(format!("expected 4 elements, got {}", items.len()))
            })?;

        Ok(Self {
            protected: expect_bytes(protected, "protected header")?,
            unprotected,
            payload: expect_bytes(payload, "payload")?,
            signature: expect_bytes(signature, "signature")?,
        })
    }

    /// Encodes as a tagged COSE_Sign1.
    pub fn to_bytes(&self) -> Result<Vec<u8>, AttestationError> {
        let value = Value::Tag(
            COSE_SIGN1_TAG,
            Box::new(Value::Array(vec![
                Value::Bytes(self.protected.clone()),
                self.unprotected.clone(),
                Value::Bytes(self.payload.clone()),
                Value::Bytes(self.signature.clone()),
            ])),
        );
        encode(&value)
    }

    /// `Sig_structure = ["Signature1", protected, h'', payload]`, CBOR encoded.
    pub fn sig_structure(&self) -> Result<Vec<u8>, AttestationError> {
        let value = Value::Array(vec![
            Value::Text("Signature1".to_string()),
            Value::Bytes(self.protected.clone()),
            Value::Bytes(Vec::new()),
            Value::Bytes(self.payload.clone()),
        ]);
        encode(&value)
    }
}

/// Fields of a Nitro attestation document used by the verifier.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AttestationDocument {
    pub module_id: String,
    pub timestamp: u64,
    pub digest: String,
    pub pcrs: BTreeMap<u64, Vec<u8>>,
    pub certificate: Vec<u8>,
    pub cabundle: Vec<Vec<u8>>,
    pub public_key: Option<Vec<u8>>,
    pub user_data: Option<Vec<u8>>,
    pub nonce: Option<Vec<u8>>,
}

impl AttestationDocument {
    pub fn from_cbor(payload: &[u8]) -> Result<Self, AttestationError> {
        let value: Value = ciborium::de::from_reader(payload)
            .map_err(|e| AttestationError::Document(format!("invalid CBOR payload: {e}")))?;
        let Value::Map(entries) = value else {
            return Err(AttestationError::Document("payload is not a map".into()));
        };

        let mut doc = AttestationDocument::default();
        for (key, val) in entries {
            let Value::Text(key) = key else { continue };
            match key.as_str() {
                "module_id" => doc.module_id = expect_text(val, "module_id")?,
                "timestamp" => doc.timestamp = expect_u64(val, "timestamp")?,
                "digest" => doc.digest = expect_text(val, "digest")?,
                "certificate" => doc.certificate = expect_doc_bytes(val, "certificate")?,
                "cabundle" => {
                    let Value::Array(certs) = val else {
                        return Err(AttestationError::Document("cabundle is not an array".into()));
                    };
                    doc.cabundle = certs
                        .into_iter()
                        .map(|c| expect_doc_bytes(c, "cabundle entry"))
                        .collect::<Result<_, _>>()?;
                }
                "pcrs" => {
                    let Value::Map(pcrs) = val else {
                        return Err(AttestationError::Document("pcrs is not a map".into()));
                    };
                    for (index, digest) in pcrs {
                        let index = expect_u64(index, "pcr index")?;
                        doc.pcrs.insert(index, expect_doc_bytes(digest, "pcr value")?);
                    }
                }
                "public_key" => doc.public_key = optional_bytes(val, "public_key")?,
                "user_data" => doc.user_data = optional_bytes(val, "user_data")?,
                "nonce" => doc.nonce = optional_bytes(val, "nonce")?,
                _ => {}
            }
        }

        if doc.certificate.is_empty() {
            return Err(AttestationError::Document("no certificate in document".into()));
        }
        Ok(doc)
    }

    pub fn to_cbor(&self) -> Result<Vec<u8>, AttestationError> {
        let text = |s: &str| Value::Text(s.to_string());
        let opt_bytes = |b: &Option<Vec<u8>>| match b {
            Some(b) => Value::Bytes(b.clone()),
            None => Value::Null,
        };

        let pcrs = self
            .pcrs
            .iter()
            .map(|(k, v)| (Value::Integer((*k).into()), Value::Bytes(v.clone())))
            .collect();

        let value = Value::Map(vec![
            (text("module_id"), text(&self.module_id)),
            (text("digest"), text(&self.digest)),
            (text("timestamp"), Value::Integer(self.timestamp.into())),
            (text("pcrs"), Value::Map(pcrs)),
            (text("certificate"), Value::Bytes(self.certificate.clone())),
            (
                text("cabundle"),
                Value::Array(self.cabundle.iter().cloned().map(Value::Bytes).collect()),
            ),
            (text("public_key"), opt_bytes(&self.public_key)),
            (text("user_data"), opt_bytes(&self.user_data)),
            (text("nonce"), opt_bytes(&self.nonce)),
        ]);
        encode(&value)
    }

    /// PCR0 as lowercase hex.
    pub fn pcr0_hex(&self) -> Option<String> {
        self.pcrs.get(&0).map(hex::encode)
    }
}

fn encode(value: &Value) -> Result<Vec<u8>, AttestationError> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|e| AttestationError::Cose(format!("CBOR encoding failed: {e}")))?;
    Ok(buf)
}

fn expect_bytes(value: Value, what: &str) -> Result<Vec<u8>, AttestationError> {
    match value {
        Value::Bytes(b) => Ok(b),
        _ => Err(AttestationError::Cose(format!("{what} is not a byte string"))),
    }
}

fn expect_doc_bytes(value: Value, what: &str) -> Result<Vec<u8>, AttestationError> {
    match value {
        Value::Bytes(b) => Ok(b),
        _ => Err(AttestationError::Document(format!("{what} is not a byte string"))),
    }
}

fn optional_bytes(value: Value, what: &str) -> Result<Option<Vec<u8>>, AttestationError> {
    match value {
        Value::Null => Ok(None),
        other => expect_doc_bytes(other, what).map(Some),
    }
}

fn expect_text(value: Value, what: &str) -> Result<String, AttestationError> {
    match value {
        Value::Text(s) => Ok(s),
        _ => Err(AttestationError::Document(format!("{what} is not text"))),
    }
}

fn expect_u64(value: Value, what: &str) -> Result<u64, AttestationError> {
    match value {
        Value::Integer(i) => u64::try_from(i128::from(i))
            .map_err(|_| AttestationError::Document(format!("{what} out of range"))),
        _ => Err(AttestationError::Document(format!("{what} is not an integer"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_doc() -> AttestationDocument {
        let mut pcrs = BTreeMap::new();
        pcrs.insert(0, vec![0xab; 48]);
        pcrs.insert(1, vec![0x01; 48]);
        AttestationDocument {
            module_id: "i-0abc-enc0123".into(),
            timestamp: 1_700_000_000_000,
            digest: "SHA384".into(),
            pcrs,
            certificate: vec![0x30, 0x82, 0x01],
            cabundle: vec![vec![0x30, 0x01]],
            public_key: None,
            user_data: Some(br#"{"purpose":"validator_weights"}"#.to_vec()),
            nonce: None,
        }
    }

    #[test]
    fn document_survives_cbor_encoding() {
        let doc = sample_doc();
        let bytes = doc.to_cbor().unwrap();
        let parsed = AttestationDocument::from_cbor(&bytes).unwrap();
        assert_eq!(parsed, doc);
        assert_eq!(parsed.pcr0_hex().unwrap(), "ab".repeat(48));
    }

    #[test]
    fn cose_accepts_tagged_and_untagged() {
        let cose = CoseSign1 {
            protected: vec![0xa1, 0x01, 0x38, 0x22],
            unprotected: Value::Map(vec![]),
            payload: sample_doc().to_cbor().unwrap(),
            signature: vec![7; 96],
        };
        let tagged = cose.to_bytes().unwrap();
        assert_eq!(CoseSign1::from_bytes(&tagged).unwrap(), cose);

        let mut untagged = Vec::new();
        ciborium::ser::into_writer(
            &Value::Array(vec![
                Value::Bytes(cose.protected.clone()),
                Value::Map(vec![]),
                Value::Bytes(cose.payload.clone()),
                Value::Bytes(cose.signature.clone()),
            ]),
            &mut untagged,
        )
        .unwrap();
        assert_eq!(CoseSign1::from_bytes(&untagged).unwrap(), cose);
    }

    #[test]
    fn malformed_envelopes_are_rejected() {
        assert!(CoseSign1::from_bytes(b"not cbor at all").is_err());

        let mut three = Vec::new();
        ciborium::ser::into_writer(
            &Value::Array(vec![Value::Bytes(vec![]), Value::Null, Value::Bytes(vec![])]),
            &mut three,
        )
        .unwrap();
        assert!(matches!(
            CoseSign1::from_bytes(&three),
            Err(AttestationError::Cose(_))
        ));
    }

    #[test]
    fn document_without_certificate_is_rejected() {
        let mut doc = sample_doc();
        doc.certificate.clear();
        let bytes = doc.to_cbor().unwrap();
        assert!(matches!(
            AttestationDocument::from_cbor(&bytes),
            Err(AttestationError::Document(_))
        ));
    }
}
