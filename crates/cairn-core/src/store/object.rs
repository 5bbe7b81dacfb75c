use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;

use crate::error::{Error, Result};
use crate::store::backend::{matches_listing, Backend};

/// S3-compatible destination via [`object_store`]. Serves the `s3` scheme
/// with credentials from the usual `AWS_*` environment, and the `b2` scheme
/// against Backblaze's S3-compatible endpoint (`B2_ENDPOINT`, `B2_KEY_ID`,
/// `B2_APP_KEY`, optional `B2_REGION`).
pub struct ObjectStoreFs {
    store: Arc<dyn ObjectStore>,
    label: String,
}

impl ObjectStoreFs {
    pub fn s3(bucket: &str) -> Result<Self> {
        let store = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .build()
            .map_err(|e| Error::Config(format!("s3:{bucket}: {e}")))?;
        Ok(ObjectStoreFs {
            store: Arc::new(store),
            label: format!("s3:{bucket}"),
        })
    }

    pub fn b2(bucket: &str) -> Result<Self> {
        let endpoint = std::env::var("B2_ENDPOINT")
            .map_err(|_| Error::Config("b2 destinations require B2_ENDPOINT".into()))?;
        let key_id = std::env::var("B2_KEY_ID")
            .map_err(|_| Error::Config("b2 destinations require B2_KEY_ID".into()))?;
        let app_key = std::env::var("B2_APP_KEY")
            .map_err(|_| Error::Config("b2 destinations require B2_APP_KEY".into()))?;
        let region = std::env::var("B2_REGION").unwrap_or_else(|_| "auto".into());

        let store = AmazonS3Builder::new()
            .with_bucket_name(bucket)
            .with_endpoint(endpoint)
            .with_access_key_id(key_id)
            .with_secret_access_key(app_key)
            .with_region(region)
            .build()
            .map_err(|e| Error::Config(format!("b2:{bucket}: {e}")))?;
        Ok(ObjectStoreFs {
            store: Arc::new(store),
            label: format!("b2:{bucket}"),
        })
    }

    fn err(&self, op: &str, remote: &str, e: object_store::Error) -> Error {
        Error::Store(format!("{} {op} {remote}: {e}", self.label))
    }
}

#[async_trait]
impl Backend for ObjectStoreFs {
    async fn exists(&self, remote: &str) -> Result<bool> {
        match self.store.head(&ObjectPath::from(remote)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(self.err("head", remote, e)),
        }
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        let bytes = tokio::fs::read(local)
            .await
            .map_err(|e| Error::io(local, e))?;
        self.store
            .put(&ObjectPath::from(remote), bytes.into())
            .await
            .map_err(|e| self.err("put", remote, e))?;
        Ok(())
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<()> {
        let result = match self.store.get(&ObjectPath::from(remote)).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(Error::Integrity(remote.to_string()))
            }
            Err(e) => return Err(self.err("get", remote, e)),
        };
        let bytes = result
            .bytes()
            .await
            .map_err(|e| self.err("get", remote, e))?;
        tokio::fs::write(local, &bytes)
            .await
            .map_err(|e| Error::io(local, e))?;
        Ok(())
    }

    async fn remove(&self, remote: &str) -> Result<()> {
        self.store
            .delete(&ObjectPath::from(remote))
            .await
            .map_err(|e| self.err("delete", remote, e))
    }

    async fn list(
        &self,
        prefix: &str,
        recursive: bool,
        pattern: Option<&str>,
    ) -> Result<Vec<String>> {
        let pattern = pattern
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|e| Error::Config(format!("bad list pattern: {e}")))?;
        let path = (!prefix.is_empty()).then(|| ObjectPath::from(prefix));
        let mut out = Vec::new();

        if recursive {
            let mut entries = self.store.list(path.as_ref());
            while let Some(meta) = entries.next().await {
                let meta = meta.map_err(|e| self.err("list", prefix, e))?;
                let name = meta.location.to_string();
                if matches_listing(&name, pattern.as_ref()) {
                    out.push(name);
                }
            }
        } else {
            let listing = self
                .store
                .list_with_delimiter(path.as_ref())
                .await
                .map_err(|e| self.err("list", prefix, e))?;
            for dir in listing.common_prefixes {
                out.push(format!("{dir}/"));
            }
            for meta in listing.objects {
                let name = meta.location.to_string();
                if matches_listing(&name, pattern.as_ref()) {
                    out.push(name);
                }
            }
        }
        out.sort();
        Ok(out)
    }
}
