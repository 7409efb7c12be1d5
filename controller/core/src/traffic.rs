use anyhow::{anyhow, Error, Result};
use std::collections::BTreeMap;

/// The routing discipline declared for a user service.
///
/// Determines whether a shadow service's target ports are positional
/// (`5000 + id`) or assigned from the durable TCP port table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TrafficType {
    Http,
    Tcp,
}

// === impl TrafficType ===

impl TrafficType {
    pub const ANNOTATION: &'static str = "maesh.containo.us/traffic-type";

    /// Reads the traffic-type annotation, falling back to `default` when the
    /// annotation is absent, empty, or unparseable.
    pub fn from_annotations(
        annotations: Option<&BTreeMap<String, String>>,
        default: TrafficType,
    ) -> TrafficType {
        let value = match annotations.and_then(|a| a.get(Self::ANNOTATION)) {
            Some(v) if !v.is_empty() => v,
            _ => return default,
        };

        value.parse().unwrap_or_else(|error| {
            tracing::warn!(%value, %error, "Invalid traffic-type annotation");
            default
        })
    }
}

impl std::str::FromStr for TrafficType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "http" => Ok(Self::Http),
            "tcp" => Ok(Self::Tcp),
            s => Err(anyhow!("invalid traffic type: {:?}", s)),
        }
    }
}

impl std::fmt::Display for TrafficType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http => "http".fmt(f),
            Self::Tcp => "tcp".fmt(f),
        }
    }
}
