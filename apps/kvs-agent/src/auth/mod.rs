pub mod credentials;
pub mod sigv4;

pub use credentials::{
    Credentials, CredentialsError, CredentialsProvider, DefaultCredentialsChain,
    StaticCredentials,
};
pub use sigv4::{SIGNED_URL_LIFETIME_SECS, SignedChannelUrl, SigningError, UrlSigner};
