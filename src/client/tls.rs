//! TLS client configuration.

use std::{sync::Arc, time::SystemTime};

use tokio_rustls::{
    rustls::{
        self,
        client::{ServerCertVerified, ServerCertVerifier},
        Certificate, ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName,
    },
    TlsConnector,
};

use crate::{errors::Error, settings::SslSettings};

pub(crate) fn connector(ssl: &SslSettings) -> TlsConnector {
    let builder = ClientConfig::builder().with_safe_defaults();
    let config = if ssl.validate_server_cert {
        let mut roots = RootCertStore::empty();
        roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        builder
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
            .with_no_client_auth()
    };
    TlsConnector::from(Arc::new(config))
}

/// Name presented for certificate validation; `expected_common_name`
/// overrides the dialed host.
pub(crate) fn server_name(ssl: &SslSettings, hostname: &str) -> Result<ServerName, Error> {
    let name = ssl.expected_common_name.as_deref().unwrap_or(hostname);
    ServerName::try_from(name)
        .map_err(|_| Error::InvalidArgument(format!("invalid TLS server name '{name}'")))
}

struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
