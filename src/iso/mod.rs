//! The data structures of ISO 18013-5, with their exact serialization.

pub mod device_retrieval;
pub mod disclosure;
pub mod engagement;
pub mod mdl;
pub mod mdocs;
pub mod unsigned;

pub use device_retrieval::*;
pub use disclosure::*;
pub use engagement::*;
pub use mdl::*;
pub use mdocs::*;
pub use unsigned::*;
