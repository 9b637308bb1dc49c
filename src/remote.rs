//! Parsing of `project@bucket:object` remote paths

/// Errors for remote paths that lack the fields an operation needs
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RemotePathError {
    #[error("remote path '{0}' not fully specified (project@bucket:object)")]
    ObjectNotSpecified(String),
    #[error("remote bucket '{0}' not fully specified (project@bucket)")]
    BucketNotSpecified(String),
}

/// Splits a remote path on `@` and `:`, dropping empty fields
pub fn split_remote(remote: &str) -> Vec<&str> {
    remote
        .split(|c| c == '@' || c == ':')
        .filter(|field| !field.is_empty())
        .collect()
}

/// Whether a command line argument names a remote location rather than a
/// local file or a bare project
#[inline]
pub fn is_remote(arg: &str) -> bool {
    arg.contains('@')
}

/// A parsed remote path, any of whose fields may be missing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePath<'a> {
    raw: &'a str,
    pub project: Option<&'a str>,
    pub bucket: Option<&'a str>,
    pub object: Option<&'a str>,
}

impl<'a> RemotePath<'a> {
    pub fn parse(raw: &'a str) -> Self {
        let mut fields = split_remote(raw).into_iter();

        Self {
            raw,
            project: fields.next(),
            bucket: fields.next(),
            object: fields.next(),
        }
    }

    /// Returns `(project, bucket, object)`, for single object operations
    pub fn object(&self) -> Result<(&'a str, &'a str, &'a str), RemotePathError> {
        match (self.project, self.bucket, self.object) {
            (Some(p), Some(b), Some(o)) => Ok((p, b, o)),
            _ => Err(RemotePathError::ObjectNotSpecified(self.raw.to_owned())),
        }
    }

    /// Returns `(project, bucket)`, for bucket level operations
    pub fn bucket(&self) -> Result<(&'a str, &'a str), RemotePathError> {
        match (self.project, self.bucket) {
            (Some(p), Some(b)) => Ok((p, b)),
            _ => Err(RemotePathError::BucketNotSpecified(self.raw.to_owned())),
        }
    }
}
