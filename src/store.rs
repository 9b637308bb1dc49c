//! The operations `gscp` performs, on top of any [`Storage`]

use crate::{config::PathBuf, remote::RemotePath};
use anyhow::Context as _;
use camino::Utf8Path;
use std::io::Read;
use tracing::{debug, info};

/// The entity that represents anyone on the internet
pub const ALL_USERS: &str = "allUsers";
pub const READER: &str = "READER";

/// The body of an object being downloaded
pub struct Media {
    pub body: Box<dyn Read>,
    /// The length of the body, if the server declared it
    pub len: Option<u64>,
}

/// The remote calls needed to implement the [`Store`] operations. Errors are
/// reported unchanged to the caller, there are no retries
pub trait Storage {
    /// Ensures requests can be authorized, so that failures of later requests
    /// are not caused by missing credentials
    fn authenticate(&mut self) -> anyhow::Result<()>;
    /// Succeeds if the bucket exists and is accessible
    fn get_bucket(&mut self, bucket: &str) -> anyhow::Result<()>;
    fn insert_bucket(&mut self, project: &str, bucket: &str) -> anyhow::Result<()>;
    fn insert_object(
        &mut self,
        bucket: &str,
        object: &str,
        content: std::fs::File,
        len: u64,
    ) -> anyhow::Result<()>;
    /// Retrieves the direct download link of the object, and its size
    fn object_media_link(
        &mut self,
        bucket: &str,
        object: &str,
    ) -> anyhow::Result<(String, Option<u64>)>;
    fn open_media(&mut self, link: &str) -> anyhow::Result<Media>;
    fn list_buckets(&mut self, project: &str) -> anyhow::Result<Vec<String>>;
    fn list_objects(&mut self, bucket: &str) -> anyhow::Result<Vec<String>>;
    fn insert_object_acl(
        &mut self,
        bucket: &str,
        object: &str,
        entity: &str,
        role: &str,
    ) -> anyhow::Result<()>;
}

pub struct Store<S> {
    storage: S,
}

impl<S: Storage> Store<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn into_inner(self) -> S {
        self.storage
    }

    /// Uploads a local file, creating the bucket if it doesn't exist.
    ///
    /// Returns the number of bytes uploaded
    pub fn put(&mut self, local: &Utf8Path, remote: &str) -> anyhow::Result<u64> {
        let (project, bucket, object) = RemotePath::parse(remote).object()?;

        // Any failure of the lookup is taken to mean the bucket is missing
        self.storage.authenticate()?;
        if let Err(err) = self.storage.get_bucket(bucket) {
            debug!("bucket lookup failed: {err:#}");
            info!("creating bucket '{bucket}' in '{project}'");
            self.storage.insert_bucket(project, bucket)?;
        }

        let file = std::fs::File::open(local).with_context(|| format!("failed to open {local}"))?;
        let len = file
            .metadata()
            .with_context(|| format!("failed to read metadata for {local}"))?
            .len();

        self.storage.insert_object(bucket, object, file, len)?;
        Ok(len)
    }

    /// Downloads an object into a local file, creating any missing parent
    /// directories. A local path of `.` downloads to the object's name.
    ///
    /// Returns the path written to and the number of bytes written
    pub fn get(&mut self, remote: &str, local: &Utf8Path) -> anyhow::Result<(PathBuf, u64)> {
        let (_project, bucket, object) = RemotePath::parse(remote).object()?;

        let local = if local.as_str() == "." {
            PathBuf::from(object)
        } else {
            local.to_owned()
        };

        let (link, size) = self.storage.object_media_link(bucket, object)?;
        let media = self.storage.open_media(&link)?;

        if let Some(parent) = local.parent().filter(|p| !p.as_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {parent}"))?;
        }

        let mut out =
            std::fs::File::create(&local).with_context(|| format!("failed to create {local}"))?;

        match copy_media(media.body, &mut out, media.len.or(size)) {
            Ok(written) => Ok((local, written)),
            Err(err) => {
                drop(out);
                if let Err(rm) = std::fs::remove_file(&local) {
                    debug!("failed to remove partial download {local}: {rm}");
                }
                Err(err.context(format!("failed to download '{object}' to {local}")))
            }
        }
    }

    /// Lists the ids of every bucket in the project
    pub fn buckets(&mut self, project: &str) -> anyhow::Result<Vec<String>> {
        self.storage.list_buckets(project)
    }

    /// Lists the names of every object in the bucket
    pub fn ls(&mut self, remote: &str) -> anyhow::Result<Vec<String>> {
        let (_project, bucket) = RemotePath::parse(remote).bucket()?;
        self.storage.list_objects(bucket)
    }

    /// Grants the role to the entity on an object
    pub fn chmod(&mut self, remote: &str, entity: &str, role: &str) -> anyhow::Result<()> {
        let (_project, bucket, object) = RemotePath::parse(remote).object()?;
        self.storage.insert_object_acl(bucket, object, entity, role)
    }
}

/// Copies the body until the declared number of bytes have been written, or
/// until the end of the body if no length was declared
fn copy_media(
    mut body: Box<dyn Read>,
    out: &mut impl std::io::Write,
    declared: Option<u64>,
) -> anyhow::Result<u64> {
    let Some(expected) = declared else {
        return Ok(std::io::copy(&mut body, out)?);
    };

    let mut written = 0;
    while written < expected {
        let copied = std::io::copy(&mut body, out)?;
        anyhow::ensure!(copied > 0, "body ended after {written} of {expected} bytes");
        written += copied;
    }

    Ok(written)
}
