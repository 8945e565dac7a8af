//! Certificate authority and per-node certificate installation
//!
//! Key material is derived from seeds, so one machine always produces the
//! same root CA, the same intermediate CA for a cluster id and the same
//! server certificate for a node id.

use std::net::IpAddr;
use std::sync::Arc;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::admin::{AdminApi, AdminConnector};
use crate::errors::{Context, OrchestratorError, Result};
use crate::models::cluster::ProvisionedNode;
use crate::runtime::{require, Capability, RuntimeBackend};
use crate::storage::layout::StorageLayout;
use crate::utils::sha256_digest;

const INBOX_DIR: &str = "/opt/couchbase/var/lib/couchbase/inbox";
const ISSUED_MARKER: &str = "/opt/couchbase/var/lib/couchbase/.ephemera-cert-issued";

// PKCS#8 v1 header of a raw 32-byte Ed25519 private key
const ED25519_PKCS8_PREFIX: [u8; 16] = [
    0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22, 0x04, 0x20,
];

/// A leaf certificate with its key and issuing chain
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    /// Leaf followed by every issuer below the root
    pub chain_pem: String,
}

pub trait CertificateAuthority: Send + Sync {
    fn cert_pem(&self) -> &str;

    /// PEM of the root this CA chains to
    fn root_pem(&self) -> &str;

    /// Derive a subordinate CA; the same seed yields the same CA
    fn make_intermediary_ca(&self, seed: &str) -> Result<Arc<dyn CertificateAuthority>>;

    fn make_server_certificate(
        &self,
        seed: &str,
        ips: &[IpAddr],
        dns_names: &[String],
    ) -> Result<IssuedCertificate>;
}

fn cert_err(e: rcgen::Error) -> OrchestratorError {
    OrchestratorError::CertificateError(e.to_string())
}

fn derive_seed(parent: &[u8; 32], label: &str) -> [u8; 32] {
    let mut data = parent.to_vec();
    data.extend_from_slice(label.as_bytes());
    sha256_digest(&data)
}

fn key_from_seed(seed: &[u8; 32]) -> Result<KeyPair> {
    let mut der = ED25519_PKCS8_PREFIX.to_vec();
    der.extend_from_slice(seed);
    KeyPair::try_from(der.as_slice()).map_err(cert_err)
}

fn base_params(seed: &[u8; 32], common_name: &str, sans: Vec<String>) -> Result<CertificateParams> {
    let mut params = CertificateParams::new(sans).map_err(cert_err)?;
    params.distinguished_name.push(DnType::CommonName, common_name);
    params.distinguished_name.push(DnType::OrganizationName, "Ephemera");
    params.not_before = rcgen::date_time_ymd(2020, 1, 1);
    params.not_after = rcgen::date_time_ymd(2049, 12, 31);

    let mut serial = seed[..16].to_vec();
    serial[0] &= 0x7f;
    params.serial_number = Some(SerialNumber::from_slice(&serial));
    Ok(params)
}

fn ca_params(seed: &[u8; 32], common_name: &str) -> Result<CertificateParams> {
    let mut params = base_params(seed, common_name, Vec::new())?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    Ok(params)
}

/// Seed-derived CA backed by rcgen
pub struct RcgenCa {
    seed: [u8; 32],
    key: KeyPair,
    cert: Certificate,
    cert_pem: String,
    /// PEMs of the issuers between this CA and the root, nearest first
    issuers_pem: Vec<String>,
    root_pem: String,
}

impl RcgenCa {
    /// Self-signed root for a machine identity
    pub fn root(machine_id: &str) -> Result<Self> {
        let seed = sha256_digest(format!("ephemera-root-ca:{}", machine_id).as_bytes());
        let key = key_from_seed(&seed)?;
        let cert = ca_params(&seed, "Ephemera Root CA")?
            .self_signed(&key)
            .map_err(cert_err)?;
        let cert_pem = cert.pem();

        Ok(Self {
            seed,
            key,
            cert,
            root_pem: cert_pem.clone(),
            cert_pem,
            issuers_pem: Vec::new(),
        })
    }

    fn chain_of(&self, leaf_pem: &str) -> String {
        let mut chain = leaf_pem.to_string();
        if self.cert_pem != self.root_pem {
            chain.push_str(&self.cert_pem);
        }
        for issuer in &self.issuers_pem {
            chain.push_str(issuer);
        }
        chain
    }
}

impl CertificateAuthority for RcgenCa {
    fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    fn root_pem(&self) -> &str {
        &self.root_pem
    }

    fn make_intermediary_ca(&self, seed: &str) -> Result<Arc<dyn CertificateAuthority>> {
        let child_seed = derive_seed(&self.seed, &format!("ca:{}", seed));
        let key = key_from_seed(&child_seed)?;
        let cert = ca_params(&child_seed, &format!("Ephemera CA {}", seed))?
            .signed_by(&key, &self.cert, &self.key)
            .map_err(cert_err)?;

        let mut issuers_pem = Vec::new();
        if self.cert_pem != self.root_pem {
            issuers_pem.push(self.cert_pem.clone());
        }
        issuers_pem.extend(self.issuers_pem.iter().cloned());

        Ok(Arc::new(RcgenCa {
            seed: child_seed,
            key,
            cert_pem: cert.pem(),
            cert,
            issuers_pem,
            root_pem: self.root_pem.clone(),
        }))
    }

    fn make_server_certificate(
        &self,
        seed: &str,
        ips: &[IpAddr],
        dns_names: &[String],
    ) -> Result<IssuedCertificate> {
        let leaf_seed = derive_seed(&self.seed, &format!("server:{}", seed));
        let key = key_from_seed(&leaf_seed)?;

        let common_name = dns_names
            .first()
            .cloned()
            .or_else(|| ips.first().map(|ip| ip.to_string()))
            .unwrap_or_else(|| seed.to_string());
        let mut params = base_params(&leaf_seed, &common_name, dns_names.to_vec())?;
        params
            .subject_alt_names
            .extend(ips.iter().map(|ip| SanType::IpAddress(*ip)));
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let cert = params
            .signed_by(&key, &self.cert, &self.key)
            .map_err(cert_err)?;
        let cert_pem = cert.pem();

        Ok(IssuedCertificate {
            chain_pem: self.chain_of(&cert_pem),
            cert_pem,
            key_pem: key.serialize_pem(),
        })
    }
}

static ROOT_CA: OnceCell<Arc<RcgenCa>> = OnceCell::const_new();

/// Process-wide root CA
pub struct RootCa;

impl RootCa {
    /// Initialized at most once per process from the machine identity
    pub async fn get_or_init(layout: &StorageLayout) -> Result<Arc<RcgenCa>> {
        ROOT_CA
            .get_or_try_init(|| async {
                let machine_id = layout.machine_identity().await?;
                info!("Initializing root CA");
                Ok::<_, OrchestratorError>(Arc::new(RcgenCa::root(&machine_id)?))
            })
            .await
            .cloned()
    }
}

/// Installation steps, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateStep {
    UploadChain,
    UploadKey,
    UploadCa,
    LoadTrustedCas,
    ReloadCertificate,
    RemoveDefaultCa,
    WriteMarker,
}

impl CertificateStep {
    fn failure(&self) -> &'static str {
        match self {
            CertificateStep::UploadChain => "failed to upload the certificate chain",
            CertificateStep::UploadKey => "failed to upload the private key",
            CertificateStep::UploadCa => "failed to upload the CA certificate",
            CertificateStep::LoadTrustedCas => "failed to load trusted CAs",
            CertificateStep::ReloadCertificate => "failed to reload the node certificate",
            CertificateStep::RemoveDefaultCa => "failed to remove the default trust anchor",
            CertificateStep::WriteMarker => "failed to mark the certificate as issued",
        }
    }
}

/// Issues and installs per-node certificates
pub struct CertificateInstaller {
    runtime: Arc<dyn RuntimeBackend>,
}

impl CertificateInstaller {
    pub fn new(runtime: Arc<dyn RuntimeBackend>) -> Self {
        Self { runtime }
    }

    /// Whether the node already carries its issued certificate
    pub async fn is_installed(&self, node: &ProvisionedNode) -> Result<bool> {
        require(self.runtime.as_ref(), Capability::CopyFiles)?;
        Ok(self
            .runtime
            .copy_from_node(&node.resource_id, ISSUED_MARKER)
            .await?
            .is_some())
    }

    /// Issue a certificate for `node` from `ca` and install it.
    ///
    /// Certificates are never rotated: callers only install on nodes that
    /// are not marked yet.
    pub async fn install(
        &self,
        ca: &dyn CertificateAuthority,
        admin: &dyn AdminApi,
        node: &ProvisionedNode,
    ) -> Result<()> {
        require(self.runtime.as_ref(), Capability::CopyFiles)?;
        info!("Installing certificate on node {}", node.node_id);

        let ips: Vec<IpAddr> = node.ip_address.parse().into_iter().collect();
        let dns_names: Vec<String> = node.dns_name.iter().cloned().collect();
        let issued = ca.make_server_certificate(&node.node_id, &ips, &dns_names)?;

        let resource = node.resource_id.as_str();
        self.runtime
            .copy_to_node(resource, &format!("{}/chain.pem", INBOX_DIR), issued.chain_pem.as_bytes())
            .await
            .context(CertificateStep::UploadChain.failure())?;
        self.runtime
            .copy_to_node(resource, &format!("{}/pkey.key", INBOX_DIR), issued.key_pem.as_bytes())
            .await
            .context(CertificateStep::UploadKey.failure())?;
        self.runtime
            .copy_to_node(resource, &format!("{}/CA/ca.pem", INBOX_DIR), ca.root_pem().as_bytes())
            .await
            .context(CertificateStep::UploadCa.failure())?;

        admin
            .load_trusted_cas()
            .await
            .context(CertificateStep::LoadTrustedCas.failure())?;
        admin
            .reload_certificate()
            .await
            .context(CertificateStep::ReloadCertificate.failure())?;
        self.remove_default_ca(admin)
            .await
            .context(CertificateStep::RemoveDefaultCa.failure())?;

        self.runtime
            .copy_to_node(resource, ISSUED_MARKER, node.node_id.as_bytes())
            .await
            .context(CertificateStep::WriteMarker.failure())?;

        debug!("Certificate installed on node {}", node.node_id);
        Ok(())
    }

    /// Install a certificate chained to `ca` on every member not carrying one yet
    pub async fn install_missing(
        &self,
        ca: &dyn CertificateAuthority,
        connector: &dyn AdminConnector,
        members: &[&ProvisionedNode],
    ) -> Result<()> {
        for member in members {
            if self.is_installed(member).await? {
                debug!("Node {} already carries its certificate", member.node_id);
                continue;
            }
            let admin = connector.connect(&member.ip_address)?;
            self.install(ca, admin.as_ref(), member)
                .await
                .with_context(|| format!("failed to install the certificate of node {}", member.node_id))?;
        }
        Ok(())
    }

    async fn remove_default_ca(&self, admin: &dyn AdminApi) -> Result<()> {
        for ca in admin.trusted_cas().await? {
            if ca.ca_type == "generated" {
                debug!("Removing generated trust anchor {}", ca.id);
                admin.delete_trusted_ca(ca.id).await?;
            }
        }
        Ok(())
    }
}
