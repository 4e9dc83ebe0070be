use thiserror::Error;

/// Errors surfaced by the IPAM datastore client.
#[derive(Debug, Error)]
pub enum IpamError {
    /// The referenced resource is gone. Treated as success by callers that
    /// release resources, since the desired end state is already reached.
    #[error("resource does not exist: {0}")]
    ResourceDoesNotExist(String),

    /// A compare-and-swap update lost a race with a concurrent writer.
    #[error("update conflict on resource {0}")]
    ResourceUpdateConflict(String),

    #[error("block {0} is not empty")]
    BlockNotEmpty(String),

    #[error("malformed datastore resource: {0}")]
    Malformed(String),

    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
}

impl IpamError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, IpamError::ResourceDoesNotExist(_))
    }
}

/// Maps a kube API error onto the IPAM error space, folding 404s and 409s
/// into their dedicated variants.
pub fn from_kube(resource: &str, err: kube::Error) -> IpamError {
    match err {
        kube::Error::Api(ref ae) if ae.code == 404 => {
            IpamError::ResourceDoesNotExist(resource.to_string())
        }
        kube::Error::Api(ref ae) if ae.code == 409 => {
            IpamError::ResourceUpdateConflict(resource.to_string())
        }
        other => IpamError::Kube(other),
    }
}
