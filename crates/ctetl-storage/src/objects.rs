//! Bucket/name object storage with a content-free completion marker.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Tag, Tagging};
use aws_sdk_s3::Client;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

/// Tag written once an object's downstream work has completed.
pub const PROCESSED_TAG_KEY: &str = "processed";
pub const PROCESSED_TAG_VALUE: &str = "true";

const TAGS_DIR: &str = ".tags";

pub type Tags = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bucket: String,
    pub name: String,
    pub content_hash: String,
    pub byte_size: usize,
}

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("cannot find bucket `{0}`")]
    MissingBucket(String),
    #[error("object `{bucket}/{name}` not found")]
    NotFound { bucket: String, name: String },
    #[error("invalid object name `{0}`")]
    InvalidName(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("object store backend: {0}")]
    Backend(String),
}

fn io_err(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> ObjectStoreError {
    let context = context.into();
    move |source| ObjectStoreError::Io { context, source }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, ObjectStoreError>;

    async fn put_text(
        &self,
        bucket: &str,
        name: &str,
        body: &[u8],
    ) -> Result<StoredObject, ObjectStoreError>;

    async fn get(&self, bucket: &str, name: &str) -> Result<Vec<u8>, ObjectStoreError>;

    /// Object names in ascending lexicographic order.
    async fn list(&self, bucket: &str, prefix: Option<&str>)
        -> Result<Vec<String>, ObjectStoreError>;

    async fn tags(&self, bucket: &str, name: &str) -> Result<Tags, ObjectStoreError>;

    async fn set_tags(&self, bucket: &str, name: &str, tags: &Tags)
        -> Result<(), ObjectStoreError>;
}

/// The "processed" flag as a capability, independent of where it is kept.
#[async_trait]
pub trait CompletionMarker: Send + Sync {
    /// True when the object carries any tag at all.
    async fn is_done(&self, bucket: &str, name: &str) -> Result<bool, ObjectStoreError>;

    async fn mark_done(&self, bucket: &str, name: &str) -> Result<(), ObjectStoreError>;
}

#[async_trait]
impl<S: ObjectStore + ?Sized> CompletionMarker for S {
    async fn is_done(&self, bucket: &str, name: &str) -> Result<bool, ObjectStoreError> {
        Ok(!self.tags(bucket, name).await?.is_empty())
    }

    async fn mark_done(&self, bucket: &str, name: &str) -> Result<(), ObjectStoreError> {
        let tags = Tags::from([(PROCESSED_TAG_KEY.to_string(), PROCESSED_TAG_VALUE.to_string())]);
        self.set_tags(bucket, name, &tags).await
    }
}

/// Fail with [`ObjectStoreError::MissingBucket`] unless every bucket exists.
pub async fn ensure_buckets<S: ObjectStore + ?Sized>(
    store: &S,
    buckets: &[&str],
) -> Result<(), ObjectStoreError> {
    for bucket in buckets {
        if !store.bucket_exists(bucket).await? {
            return Err(ObjectStoreError::MissingBucket((*bucket).to_string()));
        }
    }
    Ok(())
}

fn validate_segment(segment: &str) -> Result<(), ObjectStoreError> {
    if segment.is_empty()
        || segment.starts_with('.')
        || segment.contains('/')
        || segment.contains('\\')
    {
        return Err(ObjectStoreError::InvalidName(segment.to_string()));
    }
    Ok(())
}

/// Buckets are directories under `root`; tags live in `<bucket>/.tags/<name>.json`.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn create_bucket(&self, bucket: &str) -> Result<(), ObjectStoreError> {
        validate_segment(bucket)?;
        let dir = self.root.join(bucket);
        fs::create_dir_all(dir.join(TAGS_DIR))
            .await
            .map_err(io_err(format!("creating bucket {}", dir.display())))
    }

    fn object_path(&self, bucket: &str, name: &str) -> Result<PathBuf, ObjectStoreError> {
        validate_segment(bucket)?;
        validate_segment(name)?;
        Ok(self.root.join(bucket).join(name))
    }

    fn tags_path(&self, bucket: &str, name: &str) -> Result<PathBuf, ObjectStoreError> {
        validate_segment(bucket)?;
        validate_segment(name)?;
        Ok(self
            .root
            .join(bucket)
            .join(TAGS_DIR)
            .join(format!("{name}.json")))
    }

    async fn require_bucket(&self, bucket: &str) -> Result<(), ObjectStoreError> {
        if self.bucket_exists(bucket).await? {
            Ok(())
        } else {
            Err(ObjectStoreError::MissingBucket(bucket.to_string()))
        }
    }

    async fn require_object(&self, bucket: &str, name: &str) -> Result<PathBuf, ObjectStoreError> {
        let path = self.object_path(bucket, name)?;
        let exists = fs::try_exists(&path)
            .await
            .map_err(io_err(format!("checking {}", path.display())))?;
        if exists {
            Ok(path)
        } else {
            Err(ObjectStoreError::NotFound {
                bucket: bucket.to_string(),
                name: name.to_string(),
            })
        }
    }

    /// Write via a temp file in the same directory, then rename into place.
    async fn write_atomically(&self, target: &Path, bytes: &[u8]) -> Result<(), ObjectStoreError> {
        let parent = target
            .parent()
            .ok_or_else(|| ObjectStoreError::InvalidName(target.display().to_string()))?;
        fs::create_dir_all(parent)
            .await
            .map_err(io_err(format!("creating directory {}", parent.display())))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err(format!("opening temp file {}", temp_path.display())))?;
        file.write_all(bytes)
            .await
            .map_err(io_err(format!("writing temp file {}", temp_path.display())))?;
        file.flush()
            .await
            .map_err(io_err(format!("flushing temp file {}", temp_path.display())))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, target).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(format!(
                "renaming {} -> {}",
                temp_path.display(),
                target.display()
            ))(err));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, ObjectStoreError> {
        validate_segment(bucket)?;
        let dir = self.root.join(bucket);
        match fs::metadata(&dir).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(io_err(format!("checking bucket {}", dir.display()))(err)),
        }
    }

    async fn put_text(
        &self,
        bucket: &str,
        name: &str,
        body: &[u8],
    ) -> Result<StoredObject, ObjectStoreError> {
        self.require_bucket(bucket).await?;
        let path = self.object_path(bucket, name)?;
        self.write_atomically(&path, body).await?;
        debug!(bucket, name, bytes = body.len(), "stored object");
        Ok(StoredObject {
            bucket: bucket.to_string(),
            name: name.to_string(),
            content_hash: sha256_hex(body),
            byte_size: body.len(),
        })
    }

    async fn get(&self, bucket: &str, name: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let path = self.require_object(bucket, name).await?;
        fs::read(&path)
            .await
            .map_err(io_err(format!("reading {}", path.display())))
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<String>, ObjectStoreError> {
        self.require_bucket(bucket).await?;
        let dir = self.root.join(bucket);
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(io_err(format!("listing {}", dir.display())))?;

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(io_err(format!("listing {}", dir.display())))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(io_err(format!("inspecting {}", entry.path().display())))?;
            if !file_type.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            if prefix.map_or(true, |p| name.starts_with(p)) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn tags(&self, bucket: &str, name: &str) -> Result<Tags, ObjectStoreError> {
        self.require_object(bucket, name).await?;
        let path = self.tags_path(bucket, name)?;
        match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|err| {
                ObjectStoreError::Backend(format!("parsing tags {}: {err}", path.display()))
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Tags::new()),
            Err(err) => Err(io_err(format!("reading tags {}", path.display()))(err)),
        }
    }

    async fn set_tags(&self, bucket: &str, name: &str, tags: &Tags) -> Result<(), ObjectStoreError> {
        self.require_object(bucket, name).await?;
        let path = self.tags_path(bucket, name)?;
        let bytes = serde_json::to_vec(tags)
            .map_err(|err| ObjectStoreError::Backend(format!("serializing tags: {err}")))?;
        self.write_atomically(&path, &bytes).await
    }
}

/// Connection settings for an S3-compatible endpoint such as MinIO.
#[derive(Debug, Clone)]
pub struct S3ObjectStoreConfig {
    /// `host:port`, without a scheme.
    pub host: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub secure: bool,
}

impl S3ObjectStoreConfig {
    pub fn endpoint_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}", self.host.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: Client,
}

fn backend<E: std::error::Error>(what: &'static str) -> impl FnOnce(E) -> ObjectStoreError {
    move |err| ObjectStoreError::Backend(format!("{what}: {}", DisplayErrorContext(&err)))
}

impl S3ObjectStore {
    pub async fn connect(config: &S3ObjectStoreConfig) -> Self {
        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "ctetl-env",
        );
        let shared_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .endpoint_url(config.endpoint_url())
            .credentials_provider(credentials)
            .load()
            .await;
        let s3_config = aws_sdk_s3::config::Builder::from(&shared_config)
            .force_path_style(true)
            .build();
        Self {
            client: Client::from_conf(s3_config),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, ObjectStoreError> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(false),
            Err(err) => Err(backend("head bucket")(err)),
        }
    }

    async fn put_text(
        &self,
        bucket: &str,
        name: &str,
        body: &[u8],
    ) -> Result<StoredObject, ObjectStoreError> {
        let content_hash = sha256_hex(body);
        self.client
            .put_object()
            .bucket(bucket)
            .key(name)
            .body(ByteStream::from(body.to_vec()))
            .content_type("text/plain")
            .metadata("sha256", content_hash.clone())
            .send()
            .await
            .map_err(backend("put object"))?;
        debug!(bucket, name, bytes = body.len(), "stored object");
        Ok(StoredObject {
            bucket: bucket.to_string(),
            name: name.to_string(),
            content_hash,
            byte_size: body.len(),
        })
    }

    async fn get(&self, bucket: &str, name: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let output = match self.client.get_object().bucket(bucket).key(name).send().await {
            Ok(output) => output,
            Err(err) if err.as_service_error().is_some_and(|e| e.is_no_such_key()) => {
                return Err(ObjectStoreError::NotFound {
                    bucket: bucket.to_string(),
                    name: name.to_string(),
                });
            }
            Err(err) => return Err(backend("get object")(err)),
        };
        let data = output
            .body
            .collect()
            .await
            .map_err(backend("read object body"))?;
        Ok(data.into_bytes().to_vec())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<String>, ObjectStoreError> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .set_prefix(prefix.map(str::to_string))
            .into_paginator()
            .send();

        let mut names = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(backend("list objects"))?;
            names.extend(
                page.contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );
        }
        names.sort();
        Ok(names)
    }

    async fn tags(&self, bucket: &str, name: &str) -> Result<Tags, ObjectStoreError> {
        let output = self
            .client
            .get_object_tagging()
            .bucket(bucket)
            .key(name)
            .send()
            .await
            .map_err(backend("get object tags"))?;
        Ok(output
            .tag_set()
            .iter()
            .map(|tag| (tag.key().to_string(), tag.value().to_string()))
            .collect())
    }

    async fn set_tags(&self, bucket: &str, name: &str, tags: &Tags) -> Result<(), ObjectStoreError> {
        let tag_set = tags
            .iter()
            .map(|(key, value)| Tag::builder().key(key).value(value).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend("build tag"))?;
        let tagging = Tagging::builder()
            .set_tag_set(Some(tag_set))
            .build()
            .map_err(backend("build tagging"))?;
        self.client
            .put_object_tagging()
            .bucket(bucket)
            .key(name)
            .tagging(tagging)
            .send()
            .await
            .map_err(backend("put object tags"))?;
        Ok(())
    }
}
