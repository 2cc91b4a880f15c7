mod options;
mod publisher;
mod tls;

pub use options::*;
pub use publisher::*;
pub use tls::insecure_tls_client_config;
