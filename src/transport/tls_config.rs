//! PEM loading for the TLS transport: certificate chains, private keys, and
//! the rustls client/server configs built from them.

use crate::error::Error;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use tracing::debug;

// Reads every certificate in a PEM file; `role` names the file's purpose in
// parse errors ("server certificate", "trust root").
fn read_pem_certs(path: &str, role: &str) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path).map_err(|e| Error::TlsCertificateLoad {
        path: path.to_string(),
        source: e,
    })?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<_, _>>()
        .map_err(|e| Error::TlsInvalidCertificate(format!("{role} {path}: {e}")))?;
    if certs.is_empty() {
        return Err(Error::TlsInvalidCertificate(format!(
            "{role} {path} contains no certificates"
        )));
    }
    debug!(path, role, count = certs.len(), "Loaded PEM certificates");
    Ok(certs)
}

fn read_pem_key(path: &str) -> Result<PrivateKeyDer<'static>, Error> {
    let file = File::open(path).map_err(|e| Error::TlsKeyLoad {
        path: path.to_string(),
        source: e,
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::TlsInvalidKey(format!("{path}: {e}")))?
        .ok_or_else(|| Error::TlsInvalidKey(format!("{path} contains no private key")))
}

pub(crate) fn load_tls_server_config(
    cert_path: &str,
    key_path: &str,
) -> Result<ServerConfig, Error> {
    let cert_chain = read_pem_certs(cert_path, "server certificate")?;
    let key = read_pem_key(key_path)?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| Error::TlsServerConfigBuild(e.to_string()))?;
    debug!(cert = cert_path, key = key_path, "Built TLS server config");
    Ok(config)
}

pub(crate) fn load_tls_client_config(ca_cert_path: &str) -> Result<ClientConfig, Error> {
    let mut roots = RootCertStore::empty();
    for cert in read_pem_certs(ca_cert_path, "trust root")? {
        roots
            .add(cert)
            .map_err(|e| Error::TlsInvalidCertificate(e.to_string()))?;
    }
    debug!(path = ca_cert_path, roots = roots.len(), "Built TLS client config");
    Ok(ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}
