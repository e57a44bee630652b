use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::crypto;
use crate::error::{AcmeMdError, Result};
use crate::json::Json;

use super::{Group, IterControl, Store, StoreValue, VType, name_matches};

const DIR_MODE: u32 = 0o700;
const FILE_MODE: u32 = 0o600;
const CREATE_RETRIES: u32 = 8;

/// Filesystem-backed store: `<base>/<group-dir>/<name>/<aspect>`.
/// Every mutation goes through `atomic_write`: write to a temp sibling
/// with exclusive create, retry on collision, then rename over the
/// final path, so readers never observe a partial write (spec §4.1).
#[derive(Clone)]
pub struct FsStore {
    base: PathBuf,
}

impl FsStore {
    pub async fn open(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        tokio::fs::create_dir_all(&base).await?;
        Ok(Self { base })
    }

    fn entry_dir(&self, group: Group, name: &str) -> PathBuf {
        self.base.join(group.dir_name()).join(name)
    }

    fn aspect_path(&self, group: Group, name: &str, aspect: &str) -> PathBuf {
        self.entry_dir(group, name).join(aspect)
    }

    async fn ensure_entry_dir(&self, group: Group, name: &str) -> Result<PathBuf> {
        let dir = self.entry_dir(group, name);
        tokio::fs::create_dir_all(&dir).await?;
        set_dir_mode(&dir).await?;
        Ok(dir)
    }

    async fn read_bytes(&self, path: &Path) -> Result<Vec<u8>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(AcmeMdError::NotFound(path.display().to_string()))
            }
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                Err(AcmeMdError::PermissionDenied {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    fn decode(path: &Path, vtype: VType, bytes: Vec<u8>) -> Result<StoreValue> {
        Ok(match vtype {
            VType::Text => StoreValue::Text(String::from_utf8(bytes).map_err(|e| {
                AcmeMdError::Corruption {
                    path: path.to_path_buf(),
                    detail: e.to_string(),
                }
            })?),
            VType::Json => StoreValue::Json(Json::parse(&bytes).map_err(|_| {
                AcmeMdError::Corruption {
                    path: path.to_path_buf(),
                    detail: "invalid JSON".to_string(),
                }
            })?),
            VType::Cert => {
                StoreValue::Cert(crypto::decode_certificate(&bytes).map_err(|_| {
                    AcmeMdError::Corruption {
                        path: path.to_path_buf(),
                        detail: "invalid certificate PEM".to_string(),
                    }
                })?)
            }
            VType::Pkey => {
                StoreValue::Pkey(crypto::decode_private_key(&bytes).map_err(|_| {
                    AcmeMdError::Corruption {
                        path: path.to_path_buf(),
                        detail: "invalid private key PEM".to_string(),
                    }
                })?)
            }
            VType::Chain => {
                StoreValue::Chain(crypto::decode_chain(&bytes).map_err(|_| {
                    AcmeMdError::Corruption {
                        path: path.to_path_buf(),
                        detail: "invalid certificate chain PEM".to_string(),
                    }
                })?)
            }
        })
    }

    fn encode(value: &StoreValue) -> Result<Vec<u8>> {
        let bytes = match value {
            StoreValue::Text(s) => s.clone().into_bytes(),
            StoreValue::Json(j) => j.write(crate::json::Format::Indent).into_bytes(),
            StoreValue::Cert(c) => crypto::encode_certificate(c)?,
            StoreValue::Pkey(k) => crypto::encode_private_key(k)?,
            StoreValue::Chain(c) => crypto::encode_chain(c)?,
        };
        Ok(bytes)
    }

    async fn atomic_write(&self, path: &Path, bytes: &[u8], create_only: bool) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| AcmeMdError::General("store path has no parent directory".into()))?;

        if create_only && tokio::fs::metadata(path).await.is_ok() {
            return Err(AcmeMdError::AlreadyExists(path.display().to_string()));
        }

        let mut last_err = None;
        for attempt in 0..CREATE_RETRIES {
            let tmp = dir.join(format!(".tmp-{}-{}", std::process::id(), attempt));
            let opened = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp)
                .await;
            let mut file = match opened {
                Ok(f) => f,
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    last_err = Some(err);
                    tokio::time::sleep(std::time::Duration::from_millis(10 * u64::from(attempt + 1)))
                        .await;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let result: Result<()> = async {
                file.write_all(bytes).await?;
                file.flush().await?;
                tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(FILE_MODE)).await?;
                Ok(())
            }
            .await;

            if let Err(err) = result {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(err);
            }

            return match tokio::fs::rename(&tmp, path).await {
                Ok(()) => Ok(()),
                Err(err) => {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    Err(err.into())
                }
            };
        }

        Err(AcmeMdError::General(format!(
            "could not create temp file after {CREATE_RETRIES} attempts: {:?}",
            last_err
        )))
    }
}

async fn set_dir_mode(dir: &Path) -> Result<()> {
    tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(DIR_MODE)).await?;
    Ok(())
}

#[async_trait::async_trait]
impl Store for FsStore {
    async fn load(&self, group: Group, name: &str, aspect: &str, vtype: VType) -> Result<StoreValue> {
        let path = self.aspect_path(group, name, aspect);
        let bytes = self.read_bytes(&path).await?;
        Self::decode(&path, vtype, bytes)
    }

    async fn save(
        &self,
        group: Group,
        name: &str,
        aspect: &str,
        value: StoreValue,
        create_only: bool,
    ) -> Result<()> {
        self.ensure_entry_dir(group, name).await?;
        let path = self.aspect_path(group, name, aspect);
        let bytes = Self::encode(&value)?;
        self.atomic_write(&path, &bytes, create_only).await
    }

    async fn remove(&self, group: Group, name: &str, aspect: &str, force: bool) -> Result<()> {
        let path = self.aspect_path(group, name, aspect);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && force => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(AcmeMdError::NotFound(path.display().to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn purge(&self, group: Group, name: &str) -> Result<()> {
        let dir = self.entry_dir(group, name);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn iterate(
        &self,
        group: Group,
        name_pattern: &str,
        aspect: &str,
        vtype: VType,
        inspect: &mut (dyn FnMut(&str, &StoreValue) -> IterControl + Send),
    ) -> Result<()> {
        let group_dir = self.base.join(group.dir_name());
        let mut read_dir = match tokio::fs::read_dir(&group_dir).await {
            Ok(rd) => rd,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if name_matches(name_pattern, name) {
                        names.push(name.to_string());
                    }
                }
            }
        }
        names.sort();

        for name in names {
            let path = self.aspect_path(group, &name, aspect);
            let bytes = match tokio::fs::read(&path).await {
                Ok(b) => b,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            let value = Self::decode(&path, vtype, bytes)?;
            if matches!(inspect(&name, &value), IterControl::Stop) {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json::Format;

    async fn store() -> (tempfile::TempDir, FsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn save_then_load_round_trips_json() {
        let (_dir, store) = store().await;
        let mut j = Json::new();
        j.set_string(&crate::json::Path::single("name"), "example.org");
        store
            .save(Group::Domains, "example.org", "md.json", StoreValue::Json(j), false)
            .await
            .unwrap();

        let loaded = store
            .load(Group::Domains, "example.org", "md.json", VType::Json)
            .await
            .unwrap();
        let loaded = loaded.into_json().unwrap();
        assert_eq!(
            loaded.get_string(&crate::json::Path::single("name")),
            Some("example.org".to_string())
        );
    }

    #[tokio::test]
    async fn load_missing_aspect_is_not_found() {
        let (_dir, store) = store().await;
        let err = store
            .load(Group::Domains, "nope", "md.json", VType::Json)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn create_only_rejects_existing_aspect() {
        let (_dir, store) = store().await;
        store
            .save(
                Group::Accounts,
                "acc-1",
                "acct.json",
                StoreValue::Text("{}".to_string()),
                false,
            )
            .await
            .unwrap();
        let err = store
            .save(
                Group::Accounts,
                "acc-1",
                "acct.json",
                StoreValue::Text("{}".to_string()),
                true,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AcmeMdError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn private_key_aspects_are_owner_only() {
        let (_dir, store) = store().await;
        let key = crypto::generate_rsa(2048).unwrap();
        store
            .save(Group::Accounts, "acc-1", "acct.pem", StoreValue::Pkey(key), false)
            .await
            .unwrap();
        let path = store.aspect_path(Group::Accounts, "acc-1", "acct.pem");
        let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, FILE_MODE);
    }

    #[tokio::test]
    async fn non_sensitive_aspects_are_also_owner_only() {
        let (_dir, store) = store().await;
        store
            .save(
                Group::Domains,
                "example.org",
                "md.json",
                StoreValue::Text("{}".to_string()),
                false,
            )
            .await
            .unwrap();
        let path = store.aspect_path(Group::Domains, "example.org", "md.json");
        let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, FILE_MODE);
    }

    #[tokio::test]
    async fn remove_without_force_on_missing_aspect_is_not_found() {
        let (_dir, store) = store().await;
        let err = store
            .remove(Group::Domains, "x", "cert.pem", false)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        store
            .remove(Group::Domains, "x", "cert.pem", true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn purge_removes_every_aspect_under_name() {
        let (_dir, store) = store().await;
        store
            .save(Group::Domains, "example.org", "a", StoreValue::Text("1".into()), false)
            .await
            .unwrap();
        store
            .save(Group::Domains, "example.org", "b", StoreValue::Text("2".into()), false)
            .await
            .unwrap();
        store.purge(Group::Domains, "example.org").await.unwrap();
        let err = store
            .load(Group::Domains, "example.org", "a", VType::Text)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn iterate_visits_every_matching_name_and_can_stop_early() {
        let (_dir, store) = store().await;
        for name in ["a.com", "b.com", "c.com"] {
            store
                .save(Group::Domains, name, "md.json", StoreValue::Text("{}".into()), false)
                .await
                .unwrap();
        }

        let mut visited = Vec::new();
        store
            .iterate(Group::Domains, "*", "md.json", VType::Text, &mut |name, _| {
                visited.push(name.to_string());
                IterControl::Continue
            })
            .await
            .unwrap();
        assert_eq!(visited, vec!["a.com", "b.com", "c.com"]);

        let mut visited = Vec::new();
        store
            .iterate(Group::Domains, "*", "md.json", VType::Text, &mut |name, _| {
                visited.push(name.to_string());
                IterControl::Stop
            })
            .await
            .unwrap();
        assert_eq!(visited, vec!["a.com"]);
    }

    #[tokio::test]
    async fn crash_between_tempwrite_and_rename_never_exposes_partial_file() {
        let (_dir, store) = store().await;
        store
            .save(
                Group::Domains,
                "example.org",
                "cert.pem",
                StoreValue::Text("original".to_string()),
                false,
            )
            .await
            .unwrap();

        let dir = store.entry_dir(Group::Domains, "example.org");
        let tmp = dir.join(".tmp-crash-test");
        tokio::fs::write(&tmp, b"PARTIAL-GARBAGE").await.unwrap();
        // Simulated crash: rename never happens, temp file is abandoned.

        let value = store
            .load(Group::Domains, "example.org", "cert.pem", VType::Text)
            .await
            .unwrap();
        assert_eq!(value.into_text().unwrap(), "original");
        let _ = tokio::fs::remove_file(&tmp).await;
    }

    #[allow(dead_code)]
    fn compact(j: &Json) -> String {
        j.write(Format::Compact)
    }
}
