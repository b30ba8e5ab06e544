// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reads the workload identity out of X.509 SVIDs.

use x509_parser::extensions::{GeneralName, ParsedExtension};

use crate::error::{Error, Result};

/// Extracts the first `spiffe://` URI SAN from a DER-encoded certificate.
///
/// # Errors
///
/// Returns [`Error::Identity`] when the certificate cannot be parsed or carries
/// no `spiffe://` URI SAN.
pub fn spiffe_id_from_der(der: &[u8]) -> Result<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| Error::identity(format!("failed to parse X.509 certificate: {e}")))?;

    for ext in cert.extensions() {
        if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
            for name in &san.general_names {
                match name {
                    GeneralName::URI(uri) if uri.starts_with("spiffe://") => return Ok((*uri).to_string()),
                    _ => {}
                }
            }
        }
    }

    Err(Error::identity("no spiffe:// URI SAN found in certificate"))
}
