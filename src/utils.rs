use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use std::process::Command;

/// ユーザーホームディレクトリのパスを取得
pub fn get_home_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .ok_or_else(|| anyhow::anyhow!("Failed to determine home directory"))
}

/// XDG設定ディレクトリを取得
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(dir)
    } else {
        get_home_dir()?.join(".config")
    };

    let app_config_dir = config_dir.join("schedule_agent_rs");

    if !app_config_dir.exists() {
        fs::create_dir_all(&app_config_dir)
            .context("Failed to create config directory")?;
    }

    Ok(app_config_dir)
}

/// ネット接続状態をチェック
pub fn check_internet_connection() -> bool {
    // Googleのパブリックなサーバーに接続してネット状態をチェック
    let output = Command::new("ping")
        .args(["-c", "1", "-W", "1", "8.8.8.8"])
        .output();

    match output {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}
