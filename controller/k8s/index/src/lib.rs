#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod controller;
mod deploy_log;
mod ignored;
mod index;
mod ports;
mod retry;
mod shadow;

pub use self::{
    controller::{Controller, DeployError},
    deploy_log::{DeployLog, DeployRecord},
    ignored::Ignored,
    index::{Event, Index, MeshPod, ServiceRef, SharedIndex},
    ports::{ConfigMapStore, PortError, PortStateStore, TcpPortTable},
    shadow::{shadow_service_name, ShadowServiceManager},
};

/// Label carried by every shadow service.
pub const APP_LABEL: &str = "app";
pub const APP_VALUE: &str = "maesh";

/// Label selecting the data-plane proxy pods.
pub const COMPONENT_LABEL: &str = "component";
pub const COMPONENT_VALUE: &str = "maesh-mesh";
