//! External surfaces: adc/adcs/magnet URL parsing and (TLS) dialing.

mod error;
mod tls;
mod url;

pub use error::NetError;
pub use tls::dial;
pub use url::{url_decode, url_encode, HubUrl, MagnetLink, Scheme};

#[cfg(test)]
mod tests;
