use async_trait::async_trait;
use aws_sdk_s3::primitives::{AggregatedBytes, ByteStream};
use aws_sdk_s3::types::{Delete, ObjectIdentifier};

use crate::{validate_key, BlobStore, BlobStoreError};

const DELETE_BATCH: usize = 1000;

/// S3/MinIO-backed blob store.
///
/// MinIO environment:
/// - `VIX_MINIO_ADDRESS` — endpoint host:port; implies path-style addressing.
/// - `VIX_MINIO_ACCESS_KEY_ID` / `VIX_MINIO_SECRET_ACCESS_KEY`
/// - `VIX_MINIO_USE_SSL` — scheme of the endpoint URL (default off).
/// - `VIX_MINIO_BUCKET` — default bucket for `from_env`.
#[derive(Debug, Clone)]
pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
}

impl S3BlobStore {
    /// Create from a `s3://bucket/prefix` URL with the scheme stripped
    /// (i.e. pass `bucket/prefix`).
    pub async fn from_env_url(rest: &str) -> Result<Self, BlobStoreError> {
        let (bucket, prefix) = parse_bucket_prefix(rest)?;
        Self::open(bucket, prefix).await
    }

    /// Create against the bucket named by `VIX_MINIO_BUCKET`.
    pub async fn from_env() -> Result<Self, BlobStoreError> {
        let bucket = std::env::var("VIX_MINIO_BUCKET")
            .map_err(|_| BlobStoreError::UnsupportedRoot("VIX_MINIO_BUCKET not set".to_string()))?;
        Self::open(bucket, String::new()).await
    }

    async fn open(bucket: String, prefix: String) -> Result<Self, BlobStoreError> {
        let client = client_from_env().await?;

        // Best-effort bucket creation (ignore "already exists/owned" errors).
        let _ = client.create_bucket().bucket(&bucket).send().await;

        Ok(Self {
            client,
            bucket,
            prefix,
        })
    }

    fn object_key(&self, key: &str) -> Result<String, BlobStoreError> {
        validate_key(key)?;
        Ok(self.join_key(key))
    }

    fn join_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{key}", self.prefix.trim_matches('/'))
        }
    }

    fn strip_key(&self, full: &str) -> String {
        if self.prefix.is_empty() {
            return full.to_string();
        }
        full.strip_prefix(&format!("{}/", self.prefix.trim_matches('/')))
            .unwrap_or(full)
            .to_string()
    }

    async fn list_full_keys(&self, prefix: &str) -> Result<Vec<String>, BlobStoreError> {
        let full_prefix = self.join_key(prefix);
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix);
            if let Some(token) = continuation.take() {
                req = req.continuation_token(token);
            }
            let out = req
                .send()
                .await
                .map_err(|e| BlobStoreError::Runtime(format!("s3 list_objects_v2 failed: {e:?}")))?;
            for obj in out.contents() {
                if let Some(key) = obj.key() {
                    keys.push(key.to_string());
                }
            }
            match out.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), BlobStoreError> {
        let object_key = self.object_key(key)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(object_key)
            .body(ByteStream::from(bytes.to_vec()))
            .send()
            .await
            .map_err(|e| BlobStoreError::Runtime(format!("s3 put_object failed: {e:?}")))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobStoreError> {
        let object_key = self.object_key(key)?;
        let out = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await
            .map_err(|err| match &err {
                aws_sdk_s3::error::SdkError::ServiceError(se) if se.err().is_no_such_key() => {
                    BlobStoreError::NotFound(key.to_string())
                }
                _ => BlobStoreError::Runtime(format!("s3 get_object failed: {err:?}")),
            })?;
        let bytes: AggregatedBytes = out
            .body
            .collect()
            .await
            .map_err(|e| BlobStoreError::Runtime(format!("s3 body collect failed: {e:?}")))?;
        Ok(bytes.into_bytes().to_vec())
    }

    async fn list_with_prefix(&self, prefix: &str) -> Result<Vec<String>, BlobStoreError> {
        let keys = self.list_full_keys(prefix).await?;
        Ok(keys.into_iter().map(|k| self.strip_key(&k)).collect())
    }

    async fn remove_with_prefix(&self, prefix: &str) -> Result<(), BlobStoreError> {
        let keys = self.list_full_keys(prefix).await?;
        for chunk in keys.chunks(DELETE_BATCH) {
            let mut objects = Vec::with_capacity(chunk.len());
            for key in chunk {
                let id = ObjectIdentifier::builder()
                    .key(key)
                    .build()
                    .map_err(|e| BlobStoreError::Runtime(format!("bad object key: {e}")))?;
                objects.push(id);
            }
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .build()
                .map_err(|e| BlobStoreError::Runtime(format!("bad delete request: {e}")))?;
            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| {
                    BlobStoreError::Runtime(format!("s3 delete_objects failed: {e:?}"))
                })?;
        }
        Ok(())
    }
}

fn parse_bucket_prefix(rest: &str) -> Result<(String, String), BlobStoreError> {
    let s = rest.trim().trim_matches('/');
    let mut it = s.splitn(2, '/');
    let bucket = it.next().unwrap_or("").trim();
    if bucket.is_empty() {
        return Err(BlobStoreError::UnsupportedRoot(format!(
            "invalid s3 blob_store root: s3://{rest}"
        )));
    }
    let prefix = it.next().unwrap_or("").trim_matches('/').to_string();
    Ok((bucket.to_string(), prefix))
}

async fn client_from_env() -> Result<aws_sdk_s3::Client, BlobStoreError> {
    let cfg = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let mut b = aws_sdk_s3::config::Builder::from(&cfg);

    if let Ok(address) = std::env::var("VIX_MINIO_ADDRESS") {
        let use_ssl = parse_env_bool("VIX_MINIO_USE_SSL")?.unwrap_or(false);
        let scheme = if use_ssl { "https" } else { "http" };
        b = b
            .endpoint_url(format!("{scheme}://{}", address.trim()))
            .force_path_style(true);
    }

    let access_key = std::env::var("VIX_MINIO_ACCESS_KEY_ID").ok();
    let secret_key = std::env::var("VIX_MINIO_SECRET_ACCESS_KEY").ok();
    if let (Some(access_key), Some(secret_key)) = (access_key, secret_key) {
        b = b.credentials_provider(aws_sdk_s3::config::Credentials::new(
            access_key, secret_key, None, None, "vix-minio",
        ));
    }

    Ok(aws_sdk_s3::Client::from_conf(b.build()))
}

fn parse_env_bool(key: &str) -> Result<Option<bool>, BlobStoreError> {
    match std::env::var(key) {
        Ok(v) => {
            let s = v.trim().to_ascii_lowercase();
            let b = match s.as_str() {
                "1" | "true" | "yes" | "y" | "on" => true,
                "0" | "false" | "no" | "n" | "off" => false,
                _ => {
                    return Err(BlobStoreError::Runtime(format!(
                        "invalid boolean env var {key}={v:?} (expected true/false/1/0)"
                    )))
                }
            };
            Ok(Some(b))
        }
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(BlobStoreError::Runtime(format!(
            "read env var {key} failed: {e}"
        ))),
    }
}

#[cfg(test)]
mod parse_tests {
    use super::*;

    #[test]
    fn parse_bucket_prefix_ok() -> anyhow::Result<()> {
        let (b, p) = parse_bucket_prefix("vix-index/files")?;
        assert_eq!(b, "vix-index");
        assert_eq!(p, "files");
        Ok(())
    }

    #[test]
    fn parse_bucket_only() -> anyhow::Result<()> {
        let (b, p) = parse_bucket_prefix("vix-index")?;
        assert_eq!(b, "vix-index");
        assert_eq!(p, "");
        Ok(())
    }

    #[test]
    fn parse_rejects_empty_bucket() {
        let err = parse_bucket_prefix("/").unwrap_err();
        assert!(matches!(err, BlobStoreError::UnsupportedRoot(_)));
    }
}
