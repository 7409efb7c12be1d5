#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod config;
mod traffic;

pub use self::config::{
    DynamicConfiguration, HttpConfiguration, HttpLoadBalancer, HttpRouter, HttpServer, HttpService,
    TcpConfiguration, TcpLoadBalancer, TcpRouter, TcpServer, TcpService,
};
pub use self::traffic::TrafficType;

/// Identifies one exposed port of a user service.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServiceWithPort {
    pub namespace: String,
    pub name: String,
    pub port: i32,
}

/// Translates the current cluster state into a dynamic routing configuration.
///
/// Implementations read from in-process caches only; the reconciler compares
/// the returned value by deep equality and serializes it for transport.
pub trait ConfigurationProvider {
    fn build_config(&self) -> anyhow::Result<DynamicConfiguration>;
}
