//! Runs in its own process so no other test has installed a rustls
//! crypto provider beforehand.

use jabber_gateway::session::transport::create_tls_connector;

#[test]
fn test_connector_builds_without_preinstalled_provider() {
    assert!(rustls::crypto::CryptoProvider::get_default().is_none());
    assert!(create_tls_connector(false).is_ok());
    assert!(rustls::crypto::CryptoProvider::get_default().is_some());
}
