//! Shared helpers

pub mod token;
pub mod url;

pub use token::generate_invitation_token;
pub use url::normalize_url;
