//! Content-addressed filesystem store for uploads and run artifacts
//!
//! Layout: `<root>/uploads/<id>/` and `<root>/artifacts/<id>/`, each id-named
//! directory holding the payload under its declared filename plus a
//! `meta.json` sidecar. Fresh random ids make directory creation the only
//! synchronization needed.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use runbox_core::{file_id, ArtifactDescriptor, Error, Result, StoredFile};

use crate::signing::{unix_now, UrlSigner};

const META_FILE: &str = "meta.json";
const COPY_CHUNK: usize = 64 * 1024;

/// Content type recorded for collected artifacts. Uploads keep the type the
/// client declared.
const ARTIFACT_CONTENT_TYPE: &str = "application/octet-stream";

pub struct ArtifactStore {
    root: PathBuf,
    signer: UrlSigner,
}

impl ArtifactStore {
    /// Open the store, creating `uploads/` and `artifacts/` under the root.
    pub async fn open(root: impl Into<PathBuf>, signer: UrlSigner) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("uploads")).await?;
        fs::create_dir_all(root.join("artifacts")).await?;
        Ok(Self { root, signer })
    }

    pub fn signer(&self) -> &UrlSigner {
        &self.signer
    }

    /// Persist an uploaded file. The SHA-256 is computed here, once; the
    /// stored payload is immutable afterwards.
    pub async fn store_upload(
        &self,
        name: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<StoredFile> {
        let name = safe_name(name)?;
        let id = file_id();
        let dir = self.root.join("uploads").join(&id);
        fs::create_dir_all(&dir).await?;

        let path = dir.join(&name);
        fs::write(&path, bytes).await?;

        let file = StoredFile {
            id: id.clone(),
            name,
            size: bytes.len() as u64,
            sha256: hex::encode(Sha256::digest(bytes)),
            content_type: content_type.to_string(),
            path,
        };
        write_sidecar(&dir, &file).await?;
        debug!(file_id = %file.id, size = file.size, "stored upload");
        Ok(file)
    }

    /// Look up an uploaded file by id.
    pub async fn lookup_upload(&self, id: &str) -> Result<StoredFile> {
        self.load(self.root.join("uploads").join(id), id).await
    }

    /// Resolve an id for download, checking artifacts first, then uploads.
    pub async fn resolve(&self, id: &str) -> Result<StoredFile> {
        let artifact_dir = self.root.join("artifacts").join(id);
        if fs::try_exists(artifact_dir.join(META_FILE)).await? {
            return self.load(artifact_dir, id).await;
        }
        self.lookup_upload(id).await
    }

    /// Move a produced file out of a run workdir into the store: copy while
    /// hashing, write the sidecar, delete the source, sign a download URL.
    pub async fn ingest_artifact(&self, src: &Path, name: &str) -> Result<ArtifactDescriptor> {
        let name = safe_name(name)?;
        let id = file_id();
        let dir = self.root.join("artifacts").join(&id);
        let dest = dir.join(&name);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        let (size, sha256) = copy_hashing(src, &dest).await?;
        let file = StoredFile {
            id: id.clone(),
            name: name.clone(),
            size,
            sha256: sha256.clone(),
            content_type: ARTIFACT_CONTENT_TYPE.to_string(),
            path: dest,
        };
        write_sidecar(&dir, &file).await?;
        fs::remove_file(src).await?;

        let (url, expires_at) = self.signer.sign(&format!("/v1/files/{id}"), unix_now())?;
        debug!(file_id = %id, size, "ingested artifact");
        Ok(ArtifactDescriptor {
            name,
            size,
            sha256,
            url,
            expires_at,
            content_type: ARTIFACT_CONTENT_TYPE.to_string(),
        })
    }

    async fn load(&self, dir: PathBuf, id: &str) -> Result<StoredFile> {
        let raw = fs::read(dir.join(META_FILE))
            .await
            .map_err(|_| Error::NotFound(format!("unknown file {id}")))?;
        let mut file: StoredFile = serde_json::from_slice(&raw)?;
        file.path = dir.join(&file.name);
        Ok(file)
    }
}

/// Reject names that would escape an id directory. Nested relative names
/// (artifacts keep their path under `outputs/`) are allowed.
fn safe_name(name: &str) -> Result<String> {
    let path = Path::new(name);
    let escapes = path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir));
    if name.is_empty() || escapes {
        return Err(Error::Validation(format!("invalid file name {name:?}")));
    }
    Ok(name.to_string())
}

async fn write_sidecar(dir: &Path, file: &StoredFile) -> Result<()> {
    let json = serde_json::to_vec_pretty(file)?;
    fs::write(dir.join(META_FILE), json).await?;
    Ok(())
}

/// Stream `src` into `dest`, returning size and hex SHA-256.
async fn copy_hashing(src: &Path, dest: &Path) -> Result<(u64, String)> {
    let mut reader = fs::File::open(src).await?;
    let mut writer = fs::File::create(dest).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut size = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n]).await?;
        size += n as u64;
    }
    writer.flush().await?;
    Ok((size, hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn signer() -> UrlSigner {
        UrlSigner::new(b"store-test-key".to_vec(), "http://localhost:8080", 600)
    }

    #[tokio::test]
    async fn test_upload_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::open(tmp.path(), signer()).await.unwrap();

        let file = store
            .store_upload("input.txt", "text/plain", b"hello")
            .await
            .unwrap();
        assert!(file.id.starts_with("file_"));
        assert_eq!(file.size, 5);

        let loaded = store.lookup_upload(&file.id).await.unwrap();
        assert_eq!(loaded.name, "input.txt");
        assert_eq!(loaded.sha256, file.sha256);
        assert_eq!(loaded.content_type, "text/plain");
        let body = fs::read(&loaded.path).await.unwrap();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::open(tmp.path(), signer()).await.unwrap();
        assert!(matches!(
            store.lookup_upload("file_missing00000").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_ingest_moves_and_hashes() {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::open(tmp.path(), signer()).await.unwrap();

        let src = tmp.path().join("report.txt");
        fs::write(&src, b"ok").await.unwrap();

        let artifact = store.ingest_artifact(&src, "report.txt").await.unwrap();
        assert_eq!(artifact.size, 2);
        assert_eq!(
            artifact.sha256,
            hex::encode(Sha256::digest(b"ok")),
        );
        assert!(artifact.url.contains("payload="));
        assert!(artifact.url.contains("sig="));
        // source deleted after the move
        assert!(!src.exists());
    }

    #[tokio::test]
    async fn test_ingested_artifact_resolves_for_download() {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::open(tmp.path(), signer()).await.unwrap();

        let src = tmp.path().join("out.bin");
        fs::write(&src, b"data").await.unwrap();
        let artifact = store.ingest_artifact(&src, "out.bin").await.unwrap();

        let id = artifact
            .url
            .split("/v1/files/")
            .nth(1)
            .unwrap()
            .split('?')
            .next()
            .unwrap();
        let resolved = store.resolve(id).await.unwrap();
        assert_eq!(resolved.name, "out.bin");
        let body = fs::read(&resolved.path).await.unwrap();
        assert_eq!(body, b"data");
    }

    #[tokio::test]
    async fn test_escaping_names_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::open(tmp.path(), signer()).await.unwrap();
        assert!(store
            .store_upload("../escape", "text/plain", b"x")
            .await
            .is_err());
        assert!(store
            .store_upload("/etc/passwd", "text/plain", b"x")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_nested_artifact_names_allowed() {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::open(tmp.path(), signer()).await.unwrap();
        let src = tmp.path().join("nested.txt");
        fs::write(&src, b"n").await.unwrap();
        let artifact = store
            .ingest_artifact(&src, "charts/plot.png")
            .await
            .unwrap();
        assert_eq!(artifact.name, "charts/plot.png");
    }
}
