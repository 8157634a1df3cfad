//! Crate-wide error type. The per-subsystem errors convert into [`Error`], so `?` works
//! across module boundaries; low-level codec errors bubble up unwrapped.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("CBOR error: {0}")]
    Cbor(#[from] crate::utils::serialization::CborError),
    #[error("COSE error: {0}")]
    Cose(#[from] crate::utils::cose::CoseError),
    #[error("cryptographic error: {0}")]
    Crypto(#[from] crate::utils::crypto::CryptoError),
    #[error("certificate error: {0}")]
    Certificate(#[from] crate::utils::x509::CertificateError),
    #[error("key error: {0}")]
    Key(#[from] crate::utils::keys::KeyError),
    #[error("engagement error: {0}")]
    Engagement(#[from] crate::iso::engagement::EngagementError),
    #[error("reader authentication error: {0}")]
    ReaderAuth(#[from] crate::iso::device_retrieval::ReaderAuthError),
    #[error("verification error: {0}")]
    Verification(#[from] crate::verifier::VerificationError),
    #[error("issuance error: {0}")]
    Issuer(#[from] crate::issuer::IssuerError),
    #[error("holder error: {0}")]
    Holder(#[from] crate::holder::HolderError),
    #[error("session error: {0}")]
    Session(#[from] crate::session::SessionError),
    #[error("status list error: {0}")]
    Status(#[from] crate::status::StatusError),
}
