//! Server provisioning engine: container-runtime seam, port allocation,
//! resource sizing, the provisioning state machine and the readiness prober.

pub mod netinfo;
pub mod ports;
pub mod probe;
pub mod runtime;
pub mod server;
pub mod sizing;

// Re-export dependencies potentially needed by consumers
pub use bollard;
pub use datalab_common as common;

pub use probe::{ProbeConfig, ReadinessProber, ReadinessState};
pub use runtime::{ContainerRuntime, ContainerSpec, DockerRuntime, RuntimeClientError};
pub use server::{CreateOptions, ImageKind, ServerManager, StartedServer};
