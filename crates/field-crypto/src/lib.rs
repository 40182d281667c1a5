pub mod error;
pub mod logic;
pub mod repository;
pub mod settings;
pub mod sql;

pub use error::{FieldCryptoError, FieldCryptoErrorKind};
pub use logic::field_crypto::{FieldCrypto, ProtectedValue};
pub use settings::FieldCryptoSettings;
