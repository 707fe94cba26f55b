pub mod benign;
pub mod docker;
pub mod mock;
pub mod types;

pub use benign::{Benign, Outcome, tolerate};
pub use docker::DockerClient;
pub use mock::MockRuntime;
pub use types::{ContainerRuntime, ContainerSpec, ContainerState, RuntimeError, RuntimeResult};
