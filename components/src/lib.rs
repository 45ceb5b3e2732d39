//! Runs untrusted component containers against typed inputs and harvests
//! their typed outputs.
//!
//! A job flows through one [`Connection`]: images are provisioned, fresh
//! input and output volumes are created and filled, the component runs with
//! no network and bounded resources, and its outputs are validated and
//! stored in one transaction. Everything the job created is labeled with
//! the job and removed afterwards.

pub mod archive;
pub mod connection;
pub mod decompress;
pub mod error;
pub mod executor;
pub mod host;
pub mod images;
pub mod import;
pub mod inputs;
pub mod interface;
pub mod job;
pub mod json;
pub mod logs;
pub mod outputs;
pub mod paths;
pub mod retry;
pub mod service;
pub mod store;
pub mod values;

pub use connection::{Cleaner, Connection, DEFAULT_STOP_TIMEOUT};
pub use error::{ComponentFailure, ExecutionError, InfrastructureError};
pub use executor::{ExecutionResult, Executor, Outcome};
pub use host::{DockerHost, HostError, InMemoryHost, RuntimeHost};
pub use images::ImageReference;
pub use interface::{ComponentInterface, InterfaceKind};
pub use job::{JobClass, JobRef};
pub use service::{Service, ServiceError};
pub use values::{CivValue, ComponentInterfaceValue};
