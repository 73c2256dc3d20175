pub mod forwarder;
pub mod server;
pub mod tls_acceptor;
