//! File-backed profile store.
//!
//! ```text
//! <data_dir>/configs/users/<owner-segment>/
//!     config_<name>.json   one profile (temp file + rename)
//!     last_used.txt        name of the profile used last
//! ```
//!
//! Nothing is cached; every call reads the owner's directory.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::domain::{ConfigProfile, Owner, VigilError, validate_profile_name};
use crate::ports::ProfileStore;

const PROFILE_PREFIX: &str = "config_";
const PROFILE_SUFFIX: &str = ".json";
const LAST_USED_FILE: &str = "last_used.txt";

pub struct FileProfileStore {
    root: PathBuf,
}

impl FileProfileStore {
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self, VigilError> {
        let root = data_dir.as_ref().join("configs").join("users");
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn owner_dir(&self, owner: &Owner) -> PathBuf {
        self.root.join(owner.storage_segment())
    }

    fn profile_path(&self, owner: &Owner, name: &str) -> PathBuf {
        self.owner_dir(owner)
            .join(format!("{PROFILE_PREFIX}{name}{PROFILE_SUFFIX}"))
    }
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), VigilError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, VigilError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ProfileStore for FileProfileStore {
    async fn list(&self, owner: &Owner) -> Result<Vec<String>, VigilError> {
        let mut entries = match fs::read_dir(self.owner_dir(owner)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(name) = file_name
                .to_str()
                .and_then(|f| f.strip_prefix(PROFILE_PREFIX))
                .and_then(|f| f.strip_suffix(PROFILE_SUFFIX))
            else {
                continue;
            };
            if validate_profile_name(name).is_ok() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn get(&self, owner: &Owner, name: &str) -> Result<Option<ConfigProfile>, VigilError> {
        match read_optional(&self.profile_path(owner, name)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn save(
        &self,
        owner: &Owner,
        name: &str,
        profile: &ConfigProfile,
    ) -> Result<(), VigilError> {
        fs::create_dir_all(self.owner_dir(owner)).await?;
        let bytes = serde_json::to_vec_pretty(profile)?;
        write_atomically(&self.profile_path(owner, name), &bytes).await
    }

    async fn delete(&self, owner: &Owner, name: &str) -> Result<bool, VigilError> {
        match fs::remove_file(self.profile_path(owner, name)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn last_used(&self, owner: &Owner) -> Result<Option<String>, VigilError> {
        let Some(bytes) = read_optional(&self.owner_dir(owner).join(LAST_USED_FILE)).await? else {
            return Ok(None);
        };
        let name = String::from_utf8_lossy(&bytes).trim().to_string();
        // 手で壊された中身は無視する
        Ok(validate_profile_name(&name).is_ok().then_some(name))
    }

    async fn set_last_used(&self, owner: &Owner, name: Option<&str>) -> Result<(), VigilError> {
        let path = self.owner_dir(owner).join(LAST_USED_FILE);
        match name {
            Some(name) => {
                fs::create_dir_all(self.owner_dir(owner)).await?;
                write_atomically(&path, name.as_bytes()).await
            }
            None => match fs::remove_file(&path).await {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            },
        }
    }
}
