//! Who is calling, and may they touch SPI resources.

pub mod access;
pub mod identity;

pub use access::AccessGate;
pub use identity::{CallerRequest, IdentityExtractor, SessionIdentityExtractor};
