//! 配置 Profile 存储
//!
//! Profile = 一份持久化的核心配置来源（订阅或本地导入）。
//! 磁盘布局：`<dir>/profiles.json` 为索引，每个 profile 的配置内容
//! 存为 `<dir>/<id>.yaml`。全集中同一时刻至多一个 active。

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::common::{Error, Result};

const INDEX_FILE: &str = "profiles.json";
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub name: String,
    /// 订阅来源；本地导入的 profile 为 None
    #[serde(default)]
    pub subscription_url: Option<String>,
    /// 最近一次刷新/导入的 unix 秒
    #[serde(default)]
    pub updated_at: Option<u64>,
    #[serde(default)]
    pub active: bool,
}

pub struct ProfileStore {
    dir: PathBuf,
    profiles: Vec<Profile>,
    http: reqwest::Client,
}

impl ProfileStore {
    pub async fn load(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let index = dir.join(INDEX_FILE);
        let profiles = match tokio::fs::read(&index).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::Config(format!("corrupt profile index: {}", e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            dir: dir.to_path_buf(),
            profiles,
            http: reqwest::Client::new(),
        })
    }

    pub fn profiles(&self) -> &[Profile] {
        &self.profiles
    }

    pub fn get(&self, id: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    pub fn active(&self) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.active)
    }

    /// active profile 对应的配置文件路径；无 active 或文件缺失时
    /// 返回 `ConfigNotFound`。
    pub fn active_config_path(&self) -> Result<PathBuf> {
        let profile = self.active().ok_or(Error::ConfigNotFound)?;
        let path = self.config_path(&profile.id);
        if path.is_file() {
            Ok(path)
        } else {
            Err(Error::ConfigNotFound)
        }
    }

    pub fn config_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.yaml", id))
    }

    /// 导入本地配置内容。首个 profile 自动成为 active。
    pub async fn add_local(&mut self, name: &str, content: &str) -> Result<Profile> {
        self.add(name, None, content).await
    }

    /// 从订阅地址拉取并导入
    pub async fn import_url(&mut self, name: &str, url: &str) -> Result<Profile> {
        let content = self.fetch(url).await?;
        self.add(name, Some(url.to_string()), &content).await
    }

    /// 重新拉取订阅内容，覆盖本地文件。非订阅 profile 拒绝。
    /// 失败原样上抛，从不自动重试。
    pub async fn refresh(&mut self, id: &str) -> Result<()> {
        let url = self
            .get(id)
            .ok_or_else(|| Error::Config(format!("unknown profile '{}'", id)))?
            .subscription_url
            .clone()
            .ok_or_else(|| Error::Config(format!("profile '{}' has no subscription", id)))?;

        let content = self.fetch(&url).await?;
        tokio::fs::write(self.config_path(id), content).await?;
        if let Some(p) = self.profiles.iter_mut().find(|p| p.id == id) {
            p.updated_at = Some(unix_now());
        }
        self.save().await?;
        info!(profile = id, "subscription refreshed");
        Ok(())
    }

    /// 激活一个 profile，同时取消其它所有 profile 的激活。
    pub async fn activate(&mut self, id: &str) -> Result<()> {
        if self.get(id).is_none() {
            return Err(Error::Config(format!("unknown profile '{}'", id)));
        }
        for p in &mut self.profiles {
            p.active = p.id == id;
        }
        self.save().await?;
        info!(profile = id, "profile activated");
        Ok(())
    }

    /// 删除 profile 及其配置内容
    pub async fn remove(&mut self, id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.config_path(id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.profiles.retain(|p| p.id != id);
        self.save().await
    }

    async fn add(&mut self, name: &str, subscription_url: Option<String>, content: &str) -> Result<Profile> {
        let profile = Profile {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            subscription_url,
            updated_at: Some(unix_now()),
            active: self.profiles.is_empty(),
        };
        tokio::fs::write(self.config_path(&profile.id), content).await?;
        self.profiles.push(profile.clone());
        self.save().await?;
        Ok(profile)
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        let resp = self.http.get(url).timeout(FETCH_TIMEOUT).send().await?;
        let status = resp.status();
        if !status.is_success() {
            warn!(url, status = status.as_u16(), "subscription fetch failed");
            return Err(Error::Api { status: status.as_u16() });
        }
        Ok(resp.text().await?)
    }

    async fn save(&self) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.profiles)
            .map_err(|e| Error::Config(e.to_string()))?;
        tokio::fs::write(self.dir.join(INDEX_FILE), bytes).await?;
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_profile_becomes_active() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ProfileStore::load(dir.path()).await.unwrap();
        let p = store.add_local("main", "mode: rule\n").await.unwrap();
        assert!(p.active);
        assert_eq!(store.active().map(|p| p.name.as_str()), Some("main"));
        assert!(store.active_config_path().unwrap().is_file());
    }

    #[tokio::test]
    async fn activate_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ProfileStore::load(dir.path()).await.unwrap();
        let a = store.add_local("a", "mode: rule\n").await.unwrap();
        let b = store.add_local("b", "mode: global\n").await.unwrap();
        assert!(store.get(&a.id).unwrap().active);

        store.activate(&b.id).await.unwrap();
        assert!(!store.get(&a.id).unwrap().active);
        assert!(store.get(&b.id).unwrap().active);
        // 再激活一次保持幂等
        store.activate(&b.id).await.unwrap();
        assert_eq!(store.profiles().iter().filter(|p| p.active).count(), 1);
    }

    #[tokio::test]
    async fn activate_unknown_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ProfileStore::load(dir.path()).await.unwrap();
        assert!(store.activate("nope").await.is_err());
    }

    #[tokio::test]
    async fn remove_deletes_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ProfileStore::load(dir.path()).await.unwrap();
        let p = store.add_local("main", "mode: rule\n").await.unwrap();
        let path = store.config_path(&p.id);
        assert!(path.is_file());

        store.remove(&p.id).await.unwrap();
        assert!(!path.exists());
        assert!(store.profiles().is_empty());
        assert!(matches!(store.active_config_path(), Err(Error::ConfigNotFound)));
    }

    #[tokio::test]
    async fn index_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let mut store = ProfileStore::load(dir.path()).await.unwrap();
            store.add_local("persisted", "mode: rule\n").await.unwrap().id
        };
        let store = ProfileStore::load(dir.path()).await.unwrap();
        assert_eq!(store.profiles().len(), 1);
        assert_eq!(store.get(&id).unwrap().name, "persisted");
        assert!(store.get(&id).unwrap().active);
    }

    #[tokio::test]
    async fn refresh_requires_subscription() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ProfileStore::load(dir.path()).await.unwrap();
        let p = store.add_local("local-only", "mode: rule\n").await.unwrap();
        let err = store.refresh(&p.id).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn no_active_resolves_to_config_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::load(dir.path()).await.unwrap();
        assert!(matches!(store.active_config_path(), Err(Error::ConfigNotFound)));
    }
}
