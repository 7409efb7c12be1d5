#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod access;

pub use k8s_openapi::{
    api::{
        self,
        core::v1::{
            ConfigMap, Container, ContainerPort, ContainerStatus, EndpointAddress, EndpointPort,
            Endpoints, EndpointSubset, Pod, PodSpec, PodStatus, Service, ServicePort, ServiceSpec,
        },
    },
    apimachinery::{self, pkg::util::intstr::IntOrString},
    NamespaceResourceScope,
};
pub use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams, Resource,
        ResourceExt},
    error::ErrorResponse,
    Client, Error,
};
