//! Secure-channel material: a persisted self-signed server certificate and
//! a trust-on-first-use client verifier.
//!
//! There is no CA on a LAN, so the server generates a self-signed cert on
//! first start and clients pin its fingerprint the first time they connect.
//! A later fingerprint mismatch aborts the handshake, which the transport
//! layer then surfaces as a fallen-back plain connection.

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tracing::warn;

/// Directory for the persisted certificate and pinned fingerprints.
/// `FLICK_CONFIG_DIR` overrides it, which tests rely on for isolation.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FLICK_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("Flick");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("flick");
    }
    PathBuf::from(".flick")
}

fn default_server_cert_paths() -> (PathBuf, PathBuf) {
    let dir = config_dir();
    (dir.join("server-cert.pem"), dir.join("server-key.pem"))
}

/// Load the persisted server certificate, generating and writing a
/// self-signed one when none exists yet. Pass explicit paths to use
/// externally provisioned material.
pub fn load_or_generate_server_config(
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
) -> Result<rustls::ServerConfig> {
    let (cert_path, key_path) = match (cert, key) {
        (Some(c), Some(k)) => (c, k),
        (None, None) => default_server_cert_paths(),
        _ => return Err(anyhow!("a certificate path requires a key path")),
    };

    if !cert_path.exists() || !key_path.exists() {
        generate_material(&cert_path, &key_path)?;
    }

    let certs = read_cert_chain(&cert_path)?;
    let key = read_private_key(&key_path)?;

    let cfg = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build server tls config")?;
    Ok(cfg)
}

fn generate_material(cert_path: &Path, key_path: &Path) -> Result<()> {
    let dir = cert_path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(dir).ok();
    let cert = rcgen::generate_simple_self_signed(vec!["flick.local".to_string()])
        .context("generate self-signed cert")?;
    fs::write(cert_path, cert.serialize_pem().context("serialize cert")?)
        .context("write cert pem")?;
    fs::write(key_path, cert.serialize_private_key_pem()).context("write key pem")?;
    Ok(())
}

fn read_cert_chain(cert_path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut rd = BufReader::new(fs::File::open(cert_path).context("open cert")?);
    let mut out = Vec::new();
    for c in rustls_pemfile::certs(&mut rd) {
        out.push(c.context("read cert")?);
    }
    // A present-but-junk file must fail here, not at the first handshake.
    if out.is_empty() {
        return Err(anyhow!("no certificates in {}", cert_path.display()));
    }
    Ok(out)
}

fn read_private_key(key_path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut rd = BufReader::new(fs::File::open(key_path).context("open key")?);
    if let Some(k) = rustls_pemfile::pkcs8_private_keys(&mut rd).next() {
        return Ok(PrivateKeyDer::from(k.context("pkcs8 key")?));
    }
    // Externally provisioned keys are sometimes PKCS#1.
    let mut rd = BufReader::new(fs::File::open(key_path).context("reopen key")?);
    let k = rustls_pemfile::rsa_private_keys(&mut rd)
        .next()
        .context("no private key found")??;
    Ok(PrivateKeyDer::from(k))
}

pub fn known_hosts_path() -> PathBuf {
    config_dir().join("known_hosts")
}

fn read_known_hosts(path: &Path) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Ok(f) = fs::File::open(path) {
        for line in BufReader::new(f).lines().flatten() {
            if let Some((k, v)) = line.split_once('=') {
                map.insert(k.trim().to_string(), v.trim().to_string());
            }
        }
    }
    map
}

/// Rewrites the whole pin file through a temp file and rename, so a
/// crash mid-write cannot leave a torn line that later reads as a
/// different fingerprint.
fn write_known_hosts(path: &Path, map: &HashMap<String, String>) -> Result<()> {
    if let Some(p) = path.parent() {
        fs::create_dir_all(p).context("create known_hosts parent dir")?;
    }

    let temp_path = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&temp_path).context("create temp known_hosts")?;
        // Pins gate what we will talk to; keep them owner-only.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = f.metadata()?.permissions();
            perms.set_mode(0o600);
            f.set_permissions(perms)?;
        }
        writeln!(f, "# flick pinned peer certificates - format version 1")?;
        for (k, v) in map.iter() {
            writeln!(f, "{}={}", k, v)?;
        }
        f.flush()?;
        f.sync_all()?;
    }
    fs::rename(&temp_path, path).context("replace known_hosts")?;
    Ok(())
}

fn fp_sha256_hex(cert: &CertificateDer<'_>) -> String {
    let mut h = Sha256::new();
    h.update(cert.as_ref());
    h.finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>()
}

/// Pins the first certificate seen per host:port and rejects any change.
#[derive(Debug)]
struct TofuVerifier {
    hostport: String,
    known_path: PathBuf,
}

impl ServerCertVerifier for TofuVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _dns_name: &ServerName,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let fp = fp_sha256_hex(end_entity);
        let mut map = read_known_hosts(&self.known_path);
        match map.get(&self.hostport) {
            Some(saved) if saved == &fp => Ok(ServerCertVerified::assertion()),
            Some(_) => {
                warn!(peer = %self.hostport, "pinned certificate changed, refusing secure session");
                Err(rustls::Error::General(
                    "server certificate changed; refusing connection".into(),
                ))
            }
            None => {
                map.insert(self.hostport.clone(), fp);
                let _ = write_known_hosts(&self.known_path, &map);
                Ok(ServerCertVerified::assertion())
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PKCS1_SHA256,
        ]
    }
}

pub fn build_client_config_tofu(host: &str, port: u16) -> rustls::ClientConfig {
    let verifier = TofuVerifier {
        hostport: format!("{}:{}", host, port),
        known_path: known_hosts_path(),
    };
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(std::sync::Arc::new(verifier))
        .with_no_client_auth()
}

/// LAN peers are usually reached by raw IP, which needs the IpAddress
/// form of ServerName rather than a DNS name.
pub fn server_name_for(host: &str) -> ServerName<'static> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        ServerName::IpAddress(ip.into())
    } else {
        ServerName::try_from(host.to_string())
            .unwrap_or_else(|_| ServerName::IpAddress(IpAddr::from([127, 0, 0, 1]).into()))
    }
}
