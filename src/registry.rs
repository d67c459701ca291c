//! Compiled-in service descriptor table
//!
//! Every service the control plane can manage is described here: which
//! child resource kind it materializes as, which services must be enabled
//! before it, and which cross-cutting defaults apply to its spec. The
//! table is immutable at runtime; the sequencer derives its step order
//! from it via [`crate::graph`].

use kube::discovery::ApiResource;

use crate::SERVICES_API_GROUP;

/// Identity of a managed service
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[non_exhaustive]
pub enum ServiceId {
    /// Message broker backing inter-service RPC
    Broker,
    /// Relational database cluster
    Database,
    /// Key-value cache
    Cache,
    /// Software-defined networking control plane
    Network,
    /// Identity and authentication service
    Identity,
    /// Image registry service
    Image,
    /// Block storage service
    Volume,
    /// Compute scheduling service
    Compute,
    /// Web dashboard
    Dashboard,
}

impl ServiceId {
    /// Stable lowercase name used as the key in specs, status maps, and
    /// configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Broker => "broker",
            Self::Database => "database",
            Self::Cache => "cache",
            Self::Network => "network",
            Self::Identity => "identity",
            Self::Image => "image",
            Self::Volume => "volume",
            Self::Compute => "compute",
            Self::Dashboard => "dashboard",
        }
    }

    /// Condition type on the control plane tracking this service's
    /// readiness (e.g. `BrokerReady`)
    pub fn condition_type(&self) -> &'static str {
        match self {
            Self::Broker => "BrokerReady",
            Self::Database => "DatabaseReady",
            Self::Cache => "CacheReady",
            Self::Network => "NetworkReady",
            Self::Identity => "IdentityReady",
            Self::Image => "ImageReady",
            Self::Volume => "VolumeReady",
            Self::Compute => "ComputeReady",
            Self::Dashboard => "DashboardReady",
        }
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ServiceId {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SERVICES
            .iter()
            .map(|d| d.id)
            .find(|id| id.as_str() == s)
            .ok_or_else(|| crate::Error::validation(format!("unknown service: {s}")))
    }
}

/// Identity of a child custom resource kind
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChildKind {
    /// API version within [`SERVICES_API_GROUP`]
    pub version: &'static str,
    /// Kind name
    pub kind: &'static str,
    /// Lowercase plural used in API paths
    pub plural: &'static str,
}

impl ChildKind {
    /// Full apiVersion string (`group/version`)
    pub fn api_version(&self) -> String {
        format!("{}/{}", SERVICES_API_GROUP, self.version)
    }

    /// Build the kube `ApiResource` for dynamic access to this kind
    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: SERVICES_API_GROUP.to_string(),
            version: self.version.to_string(),
            api_version: self.api_version(),
            kind: self.kind.to_string(),
            plural: self.plural.to_string(),
        }
    }
}

/// Static description of one managed service
#[derive(Clone, Copy, Debug)]
pub struct ServiceDescriptor {
    /// Service identity
    pub id: ServiceId,
    /// Child resource kind the service materializes as
    pub child: ChildKind,
    /// Services that must be enabled before this one; enforced by the
    /// admission layer, used here only to derive the step order
    pub depends_on: &'static [ServiceId],
    /// Whether the child spec gets the shared database instance default
    pub needs_database: bool,
    /// Whether the child spec gets the shared storage class default
    pub needs_storage: bool,
    /// Whether the service exposes HTTP endpoints whose underlying
    /// Services gate endpoint configuration
    pub exposes_endpoints: bool,
}

/// The full service table, in declaration order.
///
/// Declaration order is a valid topological order of the dependency
/// graph; [`crate::graph::sequence`] validates that invariant at startup
/// rather than trusting it.
pub const SERVICES: &[ServiceDescriptor] = &[
    ServiceDescriptor {
        id: ServiceId::Broker,
        child: ChildKind {
            version: "v1alpha1",
            kind: "Broker",
            plural: "brokers",
        },
        depends_on: &[],
        needs_database: false,
        needs_storage: true,
        exposes_endpoints: false,
    },
    ServiceDescriptor {
        id: ServiceId::Database,
        child: ChildKind {
            version: "v1alpha1",
            kind: "Database",
            plural: "databases",
        },
        depends_on: &[],
        needs_database: false,
        needs_storage: true,
        exposes_endpoints: false,
    },
    ServiceDescriptor {
        id: ServiceId::Cache,
        child: ChildKind {
            version: "v1alpha1",
            kind: "Cache",
            plural: "caches",
        },
        depends_on: &[],
        needs_database: false,
        needs_storage: false,
        exposes_endpoints: false,
    },
    ServiceDescriptor {
        id: ServiceId::Network,
        child: ChildKind {
            version: "v1alpha1",
            kind: "NetworkService",
            plural: "networkservices",
        },
        depends_on: &[],
        needs_database: false,
        needs_storage: false,
        exposes_endpoints: false,
    },
    ServiceDescriptor {
        id: ServiceId::Identity,
        child: ChildKind {
            version: "v1alpha1",
            kind: "IdentityService",
            plural: "identityservices",
        },
        depends_on: &[ServiceId::Broker, ServiceId::Database, ServiceId::Cache],
        needs_database: true,
        needs_storage: false,
        exposes_endpoints: true,
    },
    ServiceDescriptor {
        id: ServiceId::Image,
        child: ChildKind {
            version: "v1alpha1",
            kind: "ImageService",
            plural: "imageservices",
        },
        depends_on: &[ServiceId::Identity, ServiceId::Database],
        needs_database: true,
        needs_storage: true,
        exposes_endpoints: true,
    },
    ServiceDescriptor {
        id: ServiceId::Volume,
        child: ChildKind {
            version: "v1alpha1",
            kind: "VolumeService",
            plural: "volumeservices",
        },
        depends_on: &[ServiceId::Identity, ServiceId::Database, ServiceId::Broker],
        needs_database: true,
        needs_storage: true,
        exposes_endpoints: true,
    },
    ServiceDescriptor {
        id: ServiceId::Compute,
        child: ChildKind {
            version: "v1alpha1",
            kind: "ComputeService",
            plural: "computeservices",
        },
        depends_on: &[
            ServiceId::Identity,
            ServiceId::Database,
            ServiceId::Broker,
            ServiceId::Network,
        ],
        needs_database: true,
        needs_storage: false,
        exposes_endpoints: true,
    },
    ServiceDescriptor {
        id: ServiceId::Dashboard,
        child: ChildKind {
            version: "v1alpha1",
            kind: "DashboardService",
            plural: "dashboardservices",
        },
        depends_on: &[ServiceId::Identity, ServiceId::Cache],
        needs_database: false,
        needs_storage: false,
        exposes_endpoints: true,
    },
];

/// Look up the descriptor for a service
pub fn descriptor(id: ServiceId) -> &'static ServiceDescriptor {
    let index = match id {
        ServiceId::Broker => 0,
        ServiceId::Database => 1,
        ServiceId::Cache => 2,
        ServiceId::Network => 3,
        ServiceId::Identity => 4,
        ServiceId::Image => 5,
        ServiceId::Volume => 6,
        ServiceId::Compute => 7,
        ServiceId::Dashboard => 8,
    };
    &SERVICES[index]
}
