//! frps binary provisioning
//!
//! Ensures the pinned frps version is installed under `<root>/bin`. When the
//! binary is missing or reports a different version, the official release
//! archive for the current OS/arch is downloaded, the `frps` entry extracted
//! and installed executable.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

use crate::logger::log;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

pub fn binary_name() -> &'static str {
    if cfg!(windows) {
        "frps.exe"
    } else {
        "frps"
    }
}

pub fn binary_path(bin_dir: &Path) -> PathBuf {
    bin_dir.join(binary_name())
}

fn release_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}

fn release_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

/// Official archive URL for a given version on the current platform.
pub fn archive_url(version: &str) -> String {
    let os = release_os();
    let arch = release_arch();
    let ext = if os == "windows" { "zip" } else { "tar.gz" };
    format!(
        "https://github.com/fatedier/frp/releases/download/v{version}/frp_{version}_{os}_{arch}.{ext}"
    )
}

/// Archive-internal directory prefix for the same release.
fn archive_dir(version: &str) -> String {
    format!("frp_{}_{}_{}", version, release_os(), release_arch())
}

/// Check `frps --version` output against the pinned version.
pub async fn installed_version(binary: &Path) -> Option<String> {
    if !binary.exists() {
        return None;
    }
    let output = Command::new(binary).arg("--version").output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Make sure `<bin_dir>/frps` exists and matches `version`; download and
/// install it otherwise. Returns the binary path.
pub async fn ensure_binary(bin_dir: &Path, version: &str) -> Result<PathBuf> {
    let binary = binary_path(bin_dir);

    if let Some(installed) = installed_version(&binary).await {
        if installed == version {
            log::debug!(version = %version, "frps binary up to date");
            return Ok(binary);
        }
        log::info!(installed = %installed, pinned = %version, "frps version mismatch, reprovisioning");
    } else {
        log::info!(version = %version, "frps binary missing, provisioning");
    }

    std::fs::create_dir_all(bin_dir)
        .with_context(|| format!("create {}", bin_dir.display()))?;

    let url = archive_url(version);
    log::info!(url = %url, "Downloading frps release archive");

    let client = reqwest::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()?;
    let response = client.get(&url).send().await?.error_for_status()?;
    let archive = response.bytes().await?;

    let entry = format!("{}/{}", archive_dir(version), binary_name());
    let data = if url.ends_with(".zip") {
        extract_zip_entry(&archive, &entry)?
    } else {
        extract_tar_gz_entry(&archive, &entry)?
    };

    let staged = binary.with_extension("download");
    std::fs::write(&staged, data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o755))?;
    }
    std::fs::rename(&staged, &binary)?;

    log::info!(path = %binary.display(), version = %version, "frps installed");
    Ok(binary)
}

fn extract_tar_gz_entry(archive: &[u8], entry: &str) -> Result<Vec<u8>> {
    let gz = flate2::read::GzDecoder::new(archive);
    let mut tar = tar::Archive::new(gz);
    for file in tar.entries()? {
        let mut file = file?;
        let path = file.path()?.to_string_lossy().to_string();
        if path == entry {
            let mut data = Vec::new();
            file.read_to_end(&mut data)?;
            return Ok(data);
        }
    }
    Err(anyhow!("archive missing entry {}", entry))
}

fn extract_zip_entry(archive: &[u8], entry: &str) -> Result<Vec<u8>> {
    let reader = std::io::Cursor::new(archive);
    let mut zip = zip::ZipArchive::new(reader)?;
    let mut file = zip
        .by_name(entry)
        .map_err(|_| anyhow!("archive missing entry {}", entry))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    Ok(data)
}
