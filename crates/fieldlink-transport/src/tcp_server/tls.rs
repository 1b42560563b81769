//! 服务端 TLS 配置加载（rustls + ring）

use crate::{TlsFiles, TransportError};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

fn open(path: &Path) -> Result<BufReader<File>, TransportError> {
    File::open(path).map(BufReader::new).map_err(|e| {
        TransportError::Config(format!("cannot read {}: {}", path.display(), e))
    })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Config(format!("bad PEM in {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(TransportError::Config(format!(
            "no certificate found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::Config(format!("bad PEM in {}: {}", path.display(), e)))?
        .ok_or_else(|| {
            TransportError::Config(format!("no private key found in {}", path.display()))
        })
}

/// 加载服务端 TLS 配置
///
/// 配置了 `ca_file` 时要求并校验客户端证书。
/// 任何文件缺失/格式错误都是配置错误。
pub(crate) fn load_server_config(files: &TlsFiles) -> Result<Arc<ServerConfig>, TransportError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let certs = load_certs(&files.cert_file)?;
    let key = load_key(&files.key_file)?;

    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    let builder = match &files.ca_file {
        Some(ca_file) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_file)? {
                roots
                    .add(cert)
                    .map_err(|e| TransportError::Config(format!("bad CA certificate: {}", e)))?;
            }
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .build()
                .map_err(|e| TransportError::Tls(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        },
        None => builder.with_no_client_auth(),
    };

    let config = builder
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Config(format!("certificate/key mismatch: {}", e)))?;
    Ok(Arc::new(config))
}
