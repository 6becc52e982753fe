//! Broker security for the MQTT sink.
//!
//! Without a CA file the platform roots are trusted. A client certificate
//! needs its key and an explicit CA.

use std::path::Path;

use anyhow::{bail, Context, Result};
use rumqttc::Transport;

/// Certificate and key presented to the broker, both PEM.
#[derive(Clone, Debug)]
pub struct ClientIdentity {
    pub certificate: Vec<u8>,
    pub key: Vec<u8>,
}

/// PEM files for the broker connection, read once at startup.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    pub ca: Option<Vec<u8>>,
    pub identity: Option<ClientIdentity>,
}

fn read_pem(what: &str, path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("read MQTT {} from '{}'", what, path.display()))
}

impl TlsMaterials {
    pub fn load(
        ca_path: Option<&Path>,
        client_cert_path: Option<&Path>,
        client_key_path: Option<&Path>,
    ) -> Result<Self> {
        let ca = ca_path.map(|path| read_pem("CA bundle", path)).transpose()?;
        let identity = match (client_cert_path, client_key_path) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(ClientIdentity {
                certificate: read_pem("client certificate", cert)?,
                key: read_pem("client key", key)?,
            }),
            (Some(_), None) | (None, Some(_)) => {
                bail!("client_cert_path and client_key_path go together, set both or neither")
            }
        };
        Ok(Self { ca, identity })
    }

    pub fn is_empty(&self) -> bool {
        self.ca.is_none() && self.identity.is_none()
    }

    /// Transport for a broker connection with or without TLS.
    pub fn transport(&self, use_tls: bool) -> Result<Transport> {
        match (use_tls, &self.ca, &self.identity) {
            (false, None, None) => Ok(Transport::tcp()),
            (false, _, _) => bail!("MQTT certificate files are set but use_tls is off"),
            (true, None, None) => Ok(Transport::tls_with_default_config()),
            (true, None, Some(_)) => bail!("an MQTT client certificate needs ca_path as well"),
            (true, Some(ca), identity) => Ok(Transport::tls(
                ca.clone(),
                identity
                    .as_ref()
                    .map(|id| (id.certificate.clone(), id.key.clone())),
                None,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn pem(contents: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file
    }

    #[test]
    fn cert_without_key_is_rejected() {
        let cert = pem(b"cert");
        let err = TlsMaterials::load(None, Some(cert.path()), None).unwrap_err();
        assert!(err.to_string().contains("together"));
    }

    #[test]
    fn missing_ca_file_is_reported() {
        let err = TlsMaterials::load(Some(Path::new("/nonexistent/ca.pem")), None, None)
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/ca.pem"));
    }

    #[test]
    fn files_are_read_into_memory() {
        let (ca, cert, key) = (pem(b"ca"), pem(b"cert"), pem(b"key"));
        let materials =
            TlsMaterials::load(Some(ca.path()), Some(cert.path()), Some(key.path())).unwrap();
        assert_eq!(materials.ca.as_deref(), Some(&b"ca"[..]));
        let identity = materials.identity.unwrap();
        assert_eq!(identity.certificate, b"cert");
        assert_eq!(identity.key, b"key");
    }

    #[test]
    fn plain_transport_refuses_tls_materials() {
        let materials = TlsMaterials {
            ca: Some(b"ca".to_vec()),
            identity: None,
        };
        assert!(materials.transport(false).is_err());
        assert!(TlsMaterials::default().transport(false).is_ok());
    }

    #[test]
    fn client_identity_requires_ca() {
        let materials = TlsMaterials {
            ca: None,
            identity: Some(ClientIdentity {
                certificate: b"cert".to_vec(),
                key: b"key".to_vec(),
            }),
        };
        assert!(materials.transport(true).is_err());
    }
}
