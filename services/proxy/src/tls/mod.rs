//! Self-signed TLS certificate management.
//!
//! ```text
//! CertificateManager ──> CertificateCache (<dir>/<identity>.{crt,key})
//!        │          └──> generate_self_signed (RSA 2048, rcgen)
//!        └── ResolvesServerCert (rustls lookup callback)
//! ```

mod cache;
mod entry;
mod generate;
mod manager;

pub use cache::CertificateCache;
pub use entry::{CertificateEntry, CertificateInfo};
pub use generate::{generate_self_signed, GenerationParams, KEY_BITS, SUBJECT_COMMON_NAME};
pub use manager::{
    CertificateConfig, CertificateManager, CertificateSource, ManagerState,
    DEFAULT_IDENTITY, DEFAULT_ROTATION_INTERVAL, EXPIRY_THRESHOLD,
};
