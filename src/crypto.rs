// This file is part of Astarte.
//
// Copyright 2021 - 2025 SECO Mind Srl
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Client keypair and CSR generation for the pairing handshake.
//!
//! The device generates a fresh ECDSA secp256r1 key pair and a certificate signing request with
//! `CN=temporary` and the `nsCertType` SSL-client extension on every pairing attempt; the real
//! common name is assigned by the server when it issues the certificate.

use rcgen::{CertificateParams, CustomExtension, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};

/// OID for the legacy Netscape certificate type extension.
const NS_CERT_TYPE_OID: &[u64] = &[2, 16, 840, 1, 113730, 1, 1];

/// BER encoding of a `BIT STRING` with a single set bit (bit 6, "SSL Client").
const NS_CERT_TYPE_SSL_CLIENT: &[u8] = &[0x03, 0x02, 0x06, 0x80];

/// Error generating the client key pair or CSR.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("failed to generate key pair")]
    KeyGeneration(#[source] rcgen::Error),
    #[error("failed to build certificate signing request")]
    CsrBuild(#[source] rcgen::Error),
}

/// A freshly generated client key pair and the PEM-encoded CSR built from it.
pub struct ClientCredentialRequest {
    pub key_pair_pem: String,
    pub csr_pem: String,
}

/// Generates an ECDSA secp256r1 key pair and a `CN=temporary` SSL-client CSR.
pub fn generate_csr() -> Result<ClientCredentialRequest, CryptoError> {
    let key_pair =
        KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(CryptoError::KeyGeneration)?;

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, "temporary");

    let mut params =
        CertificateParams::new(Vec::new()).map_err(CryptoError::CsrBuild)?;
    params.distinguished_name = distinguished_name;
    params.custom_extensions = vec![CustomExtension::from_oid_content(
        NS_CERT_TYPE_OID,
        NS_CERT_TYPE_SSL_CLIENT.to_vec(),
    )];

    let csr = params
        .serialize_request(&key_pair)
        .map_err(CryptoError::CsrBuild)?;

    Ok(ClientCredentialRequest {
        key_pair_pem: key_pair.serialize_pem(),
        csr_pem: csr.pem().map_err(CryptoError::CsrBuild)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_a_pem_key_pair_and_csr() {
        let request = generate_csr().unwrap();

        assert!(request.key_pair_pem.contains("PRIVATE KEY"));
        assert!(request.csr_pem.contains("CERTIFICATE REQUEST"));
    }
}
