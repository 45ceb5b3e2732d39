use crate::host::HostError;
use crate::store::StoreError;
use thiserror::Error;

/// Failures caused by the component itself. The message is shown to the
/// submitter verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComponentFailure {
    #[error("The container was killed as it exceeded the memory limit of {limit_gb}g.")]
    MemoryLimitExceeded { limit_gb: u64 },

    #[error("{message}")]
    NonZeroExit { exit_code: i64, message: String },

    #[error("Error listing {dir}")]
    OutputListing { dir: String },

    #[error("{dir} is empty")]
    OutputDirEmpty { dir: String },

    #[error("No images imported from {dir}")]
    NoImagesImported { dir: String },

    #[error("Only 1 image should be produced in {dir}, we found {found}")]
    TooManyImages { dir: String, found: usize },

    #[error("The image produced in {dir} is not valid")]
    InvalidImage { dir: String },

    #[error("File {path} was not produced.")]
    OutputNotProduced { path: String },

    #[error("The file produced at {path} is not valid json")]
    InvalidJson { path: String },

    #[error("The file produced at {path} is not valid")]
    InvalidOutput { path: String },

    #[error("Prefix {prefix} is not a full path")]
    InvalidPrefix { prefix: String },

    #[error("{archive} is not a valid zip file")]
    InvalidArchive { archive: String },

    #[error("Archive entry {entry} would be extracted outside of {prefix}")]
    UnsafeArchiveEntry { entry: String, prefix: String },

    #[error("Path {path} escapes {root}")]
    PathEscape { path: String, root: String },
}

impl ComponentFailure {
    pub fn code(&self) -> &'static str {
        match self {
            ComponentFailure::MemoryLimitExceeded { .. } => "COMPONENT_MEMORY_LIMIT_EXCEEDED",
            ComponentFailure::NonZeroExit { .. } => "COMPONENT_NON_ZERO_EXIT",
            ComponentFailure::OutputListing { .. } => "COMPONENT_OUTPUT_LISTING",
            ComponentFailure::OutputDirEmpty { .. } => "COMPONENT_OUTPUT_EMPTY",
            ComponentFailure::NoImagesImported { .. } => "COMPONENT_NO_IMAGES",
            ComponentFailure::TooManyImages { .. } => "COMPONENT_TOO_MANY_IMAGES",
            ComponentFailure::InvalidImage { .. } => "COMPONENT_INVALID_IMAGE",
            ComponentFailure::OutputNotProduced { .. } => "COMPONENT_OUTPUT_MISSING",
            ComponentFailure::InvalidJson { .. } => "COMPONENT_INVALID_JSON",
            ComponentFailure::InvalidOutput { .. } => "COMPONENT_INVALID_OUTPUT",
            ComponentFailure::InvalidPrefix { .. } => "COMPONENT_INVALID_PREFIX",
            ComponentFailure::InvalidArchive { .. } => "COMPONENT_INVALID_ARCHIVE",
            ComponentFailure::UnsafeArchiveEntry { .. } => "COMPONENT_UNSAFE_ARCHIVE_ENTRY",
            ComponentFailure::PathEscape { .. } => "COMPONENT_PATH_ESCAPE",
        }
    }
}

/// Failures of the platform rather than the component. Operators see these;
/// submitters only see that the job errored.
#[derive(Error, Debug)]
pub enum InfrastructureError {
    #[error("{operation} failed: {source}")]
    Host {
        operation: String,
        #[source]
        source: HostError,
    },

    #[error("Image archive {key} could not be read: {source}")]
    MissingImageBlob {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("Failed to pull image {image}: {source}")]
    ImagePull {
        image: String,
        #[source]
        source: HostError,
    },

    #[error("Failed to load image {digest}: {source}")]
    ImageLoad {
        digest: String,
        #[source]
        source: HostError,
    },

    #[error("Image {expected} was not present on the host after loading its archive")]
    ImageDigestMismatch { expected: String },

    #[error("Pruning {resource} for {label} failed after {attempts} attempts: {source}")]
    PruneExhausted {
        resource: &'static str,
        label: String,
        attempts: u32,
        #[source]
        source: HostError,
    },

    #[error("Archive of {path} exceeds {limit} bytes")]
    ArchiveTooLarge { path: String, limit: u64 },

    #[error("Archive I/O for {path}: {source}")]
    ArchiveIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Helper container {name} exited with status {exit_code}")]
    HelperFailed { name: String, exit_code: i64 },

    #[error("Image import failed: {message}")]
    Import { message: String },

    #[error("Input {id} cannot be provisioned: {message}")]
    InvalidInput { id: String, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl InfrastructureError {
    pub(crate) fn host(operation: impl Into<String>) -> impl FnOnce(HostError) -> Self {
        let operation = operation.into();
        move |source| InfrastructureError::Host { operation, source }
    }

    pub fn code(&self) -> &'static str {
        match self {
            InfrastructureError::Host { .. } => "INFRA_HOST_ERROR",
            InfrastructureError::MissingImageBlob { .. } => "INFRA_IMAGE_BLOB_MISSING",
            InfrastructureError::ImagePull { .. } => "INFRA_IMAGE_PULL",
            InfrastructureError::ImageLoad { .. } => "INFRA_IMAGE_LOAD",
            InfrastructureError::ImageDigestMismatch { .. } => "INFRA_IMAGE_DIGEST_MISMATCH",
            InfrastructureError::PruneExhausted { .. } => "INFRA_PRUNE_EXHAUSTED",
            InfrastructureError::ArchiveTooLarge { .. } => "INFRA_ARCHIVE_TOO_LARGE",
            InfrastructureError::ArchiveIo { .. } => "INFRA_ARCHIVE_IO",
            InfrastructureError::HelperFailed { .. } => "INFRA_HELPER_FAILED",
            InfrastructureError::Import { .. } => "INFRA_IMAGE_IMPORT",
            InfrastructureError::InvalidInput { .. } => "INFRA_INVALID_INPUT",
            InfrastructureError::Store(_) => "INFRA_STORE",
        }
    }
}

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error(transparent)]
    Component(#[from] ComponentFailure),

    #[error(transparent)]
    Infrastructure(#[from] InfrastructureError),
}

impl ExecutionError {
    pub fn is_user_facing(&self) -> bool {
        matches!(self, ExecutionError::Component(_))
    }

    /// Text that may be shown to the submitter of the job.
    pub fn user_message(&self) -> Option<String> {
        match self {
            ExecutionError::Component(failure) => Some(failure.to_string()),
            ExecutionError::Infrastructure(_) => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ExecutionError::Component(failure) => failure.code(),
            ExecutionError::Infrastructure(error) => error.code(),
        }
    }
}

impl From<StoreError> for ExecutionError {
    fn from(error: StoreError) -> Self {
        ExecutionError::Infrastructure(InfrastructureError::Store(error))
    }
}
