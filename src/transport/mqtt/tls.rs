//! rustls glue for the MQTT channel. Compiled only with the `tls` feature.

use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;

use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};

use super::TlsOptions;
use crate::error::{PubSubError, Result};

pub(super) type TlsStream = StreamOwned<ClientConnection, TcpStream>;

fn security(context: &str, err: impl std::fmt::Display) -> PubSubError {
    PubSubError::SecurityChecks(format!("{context}: {err}"))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    CertificateDer::pem_file_iter(path)
        .map_err(|e| security("cannot read certificate file", e))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| security("bad certificate in file", e))
}

/// Wrap an open TCP stream in a verified client TLS session. The handshake
/// completes before this returns, so the first MQTT byte travels encrypted.
pub(super) fn wrap(tcp: TcpStream, host: &str, opts: &TlsOptions) -> Result<TlsStream> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(&opts.ca_file)? {
        roots
            .add(cert)
            .map_err(|e| security("rejected CA certificate", e))?;
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let config = match (&opts.cert_file, &opts.key_file) {
        (Some(cert), Some(key)) => {
            let certs = load_certs(cert)?;
            let key = PrivateKeyDer::from_pem_file(key)
                .map_err(|e| security("cannot read client key", e))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| security("client certificate rejected", e))?
        }
        (None, None) => builder.with_no_client_auth(),
        // Pairing is validated before the socket opens; this is a backstop.
        _ => {
            return Err(PubSubError::InvalidArgument(
                "client certificate and key must be configured together".into(),
            ))
        }
    };

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| PubSubError::InvalidArgument(format!("invalid TLS server name: {host}")))?;
    let conn = ClientConnection::new(Arc::new(config), server_name)
        .map_err(|e| security("TLS session setup failed", e))?;
    let mut stream = StreamOwned::new(conn, tcp);

    while stream.conn.is_handshaking() {
        stream
            .conn
            .complete_io(&mut stream.sock)
            .map_err(|e| security("TLS handshake failed", e))?;
    }

    Ok(stream)
}
