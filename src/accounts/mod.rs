use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::Credential;
use crate::error::LoadTestError;

/// accounts.jsonのルート構造
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountsFile {
    pub accounts: Vec<AccountEntry>,
}

/// ログイン用アカウント
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountEntry {
    pub email: String,
    pub password: String,
}

impl AccountsFile {
    /// accounts.jsonファイルからロード（空ファイルはエラー）
    pub fn load_from_file(path: &Path) -> Result<Self, LoadTestError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            LoadTestError::ConfigError(format!(
                "Failed to read accounts file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let file: AccountsFile = serde_json::from_str(&content).map_err(|e| {
            LoadTestError::ConfigError(format!("Failed to parse accounts file: {}", e))
        })?;
        if file.accounts.is_empty() {
            return Err(LoadTestError::EmptyAccountPool);
        }
        Ok(file)
    }
}

/// ログイン済み資格情報のプール（セッション間で共有）
pub struct CredentialPool {
    credentials: Vec<Credential>,
    index: AtomicUsize,
}

impl std::fmt::Debug for CredentialPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialPool")
            .field("credentials", &self.credentials.len())
            .field("index", &self.index.load(Ordering::Relaxed))
            .finish()
    }
}

impl CredentialPool {
    pub fn new(credentials: Vec<Credential>) -> Result<Self, LoadTestError> {
        if credentials.is_empty() {
            return Err(LoadTestError::EmptyAccountPool);
        }
        Ok(Self {
            credentials,
            index: AtomicUsize::new(0),
        })
    }

    /// ラウンドロビンで次の資格情報を取得
    pub fn next_credential(&self) -> &Credential {
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % self.credentials.len();
        &self.credentials[idx]
    }

    /// 先頭の資格情報（ルーム解決に使う）
    pub fn primary(&self) -> &Credential {
        &self.credentials[0]
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

/// アカウントファイル生成
pub struct AccountGenerator;

impl AccountGenerator {
    /// 指定パラメータでアカウントリストを生成
    ///
    /// - Email format: `{prefix}{index:04}@{domain}`
    /// - Password: replace `{index}` in password_pattern with the zero-padded index
    pub fn generate(
        prefix: &str,
        start: u32,
        count: u32,
        domain: &str,
        password_pattern: &str,
    ) -> AccountsFile {
        let accounts = (0..count)
            .map(|i| {
                let padded = format!("{:04}", start + i);
                AccountEntry {
                    email: format!("{}{}@{}", prefix, padded, domain),
                    password: password_pattern.replace("{index}", &padded),
                }
            })
            .collect();
        AccountsFile { accounts }
    }

    /// ファイルに書き出し（新規作成）
    pub fn write_to_file(accounts: &AccountsFile, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(accounts)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// 既存ファイルに追記（既存アカウントを保持）
    pub fn append_to_file(new_accounts: &AccountsFile, path: &Path) -> anyhow::Result<()> {
        let mut merged = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str::<AccountsFile>(&content)?
        } else {
            AccountsFile { accounts: vec![] }
        };
        merged.accounts.extend(new_accounts.accounts.iter().cloned());
        let json = serde_json::to_string_pretty(&merged)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
