pub mod cose;
pub mod crypto;
pub mod keys;
pub mod serialization;
pub mod time;
pub mod x509;
