//! Self-update
//!
//! Queries the release feed, picks the newest release matching the effective
//! channel, downloads the platform asset, and replaces an allow-list of paths
//! atomically file by file. A marker file records the new version; the next
//! startup turns it into a broadcast, then deletes it. The process exits with
//! status 0 afterwards so an external supervisor relaunches the new binary.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::UpdateChannel;
use crate::logger::log;

const FEED_TIMEOUT: Duration = Duration::from_secs(15);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);
const RELEASE_FEED: &str = "https://api.github.com/repos/lieyan-work/FireFrp/releases";
pub const MARKER_FILE: &str = ".just_updated";

/// Paths inside the release archive that get installed over the current
/// installation. Everything else in the archive is ignored.
const REPLACE_PATHS: &[&str] = &["firefrp-server", "firefrp-server.exe"];
/// Never touched by an update.
const PRESERVE_PATHS: &[&str] = &["config.json", "data", "bin"];

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

impl Release {
    pub fn version(&self) -> &str {
        self.tag_name.strip_prefix('v').unwrap_or(&self.tag_name)
    }
}

/// Dotted numeric version with an optional prerelease suffix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    parts: Vec<u64>,
    /// Stable sorts after any prerelease of the same numbers.
    stable: bool,
}

impl Version {
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.strip_prefix('v').unwrap_or(s);
        let (numbers, pre) = match s.split_once('-') {
            Some((n, p)) => (n, Some(p)),
            None => (s, None),
        };
        let parts: Option<Vec<u64>> = numbers.split('.').map(|p| p.parse().ok()).collect();
        Some(Self {
            parts: parts?,
            stable: pre.is_none(),
        })
    }

    pub fn is_dev(s: &str) -> bool {
        s.contains("-dev") || s.contains("-alpha") || s.contains("-beta") || s.contains("-rc")
    }
}

pub struct UpdateService {
    root_dir: PathBuf,
    current_version: String,
    feed_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// Already newest.
    UpToDate,
    /// Installed; caller should exit so the supervisor relaunches.
    Updated(String),
}

impl UpdateService {
    pub fn new(root_dir: PathBuf) -> Self {
        Self {
            root_dir,
            current_version: env!("CARGO_PKG_VERSION").to_string(),
            feed_url: RELEASE_FEED.to_string(),
        }
    }

    #[cfg(test)]
    fn with_version(root_dir: PathBuf, version: &str) -> Self {
        Self {
            root_dir,
            current_version: version.to_string(),
            feed_url: RELEASE_FEED.to_string(),
        }
    }

    /// `auto` resolves through the running version's suffix.
    pub fn effective_channel(&self, channel: UpdateChannel) -> UpdateChannel {
        match channel {
            UpdateChannel::Auto => {
                if Version::is_dev(&self.current_version) {
                    UpdateChannel::Dev
                } else {
                    UpdateChannel::Stable
                }
            }
            other => other,
        }
    }

    /// Fetch the feed and pick the newest release on the effective channel
    /// that is newer than the running version and has an asset for this
    /// platform.
    pub async fn check(
        &self,
        channel: UpdateChannel,
        github_token: &str,
    ) -> Result<Option<(Release, ReleaseAsset)>> {
        let channel = self.effective_channel(channel);

        let client = reqwest::Client::builder().timeout(FEED_TIMEOUT).build()?;
        let mut request = client
            .get(&self.feed_url)
            .header(reqwest::header::USER_AGENT, "firefrp-server");
        if !github_token.is_empty() {
            request = request.bearer_auth(github_token);
        }
        let releases: Vec<Release> = request
            .send()
            .await
            .context("release feed request")?
            .error_for_status()?
            .json()
            .await
            .context("release feed parse")?;

        let current = Version::parse(&self.current_version)
            .ok_or_else(|| anyhow!("unparseable running version {}", self.current_version))?;

        let candidate = releases
            .into_iter()
            .filter(|r| match channel {
                UpdateChannel::Dev => true,
                _ => !r.prerelease && !Version::is_dev(r.version()),
            })
            .filter_map(|r| Version::parse(r.version()).map(|v| (v, r)))
            .filter(|(v, _)| *v > current)
            .max_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, r)| r);

        let Some(release) = candidate else {
            return Ok(None);
        };
        let Some(asset) = platform_asset(&release) else {
            log::warn!(
                version = release.version(),
                "Release has no asset for this platform"
            );
            return Ok(None);
        };
        Ok(Some((release, asset)))
    }

    /// Download, unpack, replace, write the marker.
    pub async fn apply(
        &self,
        release: &Release,
        asset: &ReleaseAsset,
        github_token: &str,
        progress: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<()> {
        progress(&format!("下载 {} ...", asset.name));

        let client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()?;
        let mut request = client
            .get(&asset.browser_download_url)
            .header(reqwest::header::USER_AGENT, "firefrp-server");
        if !github_token.is_empty() {
            request = request.bearer_auth(github_token);
        }
        let archive = request
            .send()
            .await
            .context("asset download")?
            .error_for_status()?
            .bytes()
            .await?;

        progress("解包并替换文件 ...");
        let staging = tempfile::tempdir()?;
        unpack_archive(&asset.name, &archive, staging.path())?;
        let replaced = self.install_from(staging.path())?;
        if replaced == 0 {
            return Err(anyhow!("archive contained none of the updatable paths"));
        }

        fs::write(
            self.root_dir.join("data").join(MARKER_FILE),
            release.version(),
        )?;
        progress(&format!("已更新到 v{}，即将重启", release.version()));
        Ok(())
    }

    /// Full flow used by `--update` and the bot `update` command.
    pub async fn run(
        &self,
        channel: UpdateChannel,
        github_token: &str,
        progress: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<UpdateOutcome> {
        progress("正在检查更新 ...");
        match self.check(channel, github_token).await? {
            None => {
                progress(&format!("已是最新版本 (v{})", self.current_version));
                Ok(UpdateOutcome::UpToDate)
            }
            Some((release, asset)) => {
                self.apply(&release, &asset, github_token, progress).await?;
                Ok(UpdateOutcome::Updated(release.version().to_string()))
            }
        }
    }

    /// Move every allow-listed file from `staging` into the root, rename per
    /// file so each replacement is atomic. Returns how many files landed.
    fn install_from(&self, staging: &Path) -> Result<usize> {
        let mut replaced = 0;
        for entry in walk_files(staging)? {
            let rel = entry
                .strip_prefix(staging)
                .unwrap_or(&entry)
                .to_string_lossy()
                .to_string();
            let name = Path::new(&rel)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();

            if PRESERVE_PATHS.iter().any(|p| rel.starts_with(p)) {
                continue;
            }
            if !REPLACE_PATHS.contains(&name.as_str()) {
                continue;
            }

            let target = self.root_dir.join(&name);
            let staged = target.with_extension("update");
            fs::copy(&entry, &staged)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&staged, fs::Permissions::from_mode(0o755))?;
            }
            fs::rename(&staged, &target)?;
            log::info!(path = %target.display(), "Updated file installed");
            replaced += 1;
        }
        Ok(replaced)
    }

    /// Startup handling of the post-update marker: returns the version to
    /// announce when the marker matches the running binary. A stale marker is
    /// deleted silently.
    pub fn take_update_marker(&self) -> Option<String> {
        let marker = self.root_dir.join("data").join(MARKER_FILE);
        let content = fs::read_to_string(&marker).ok()?;
        let version = content.trim().to_string();
        let _ = fs::remove_file(&marker);
        if version == self.current_version {
            Some(version)
        } else {
            log::warn!(marker = %version, running = %self.current_version, "Stale update marker");
            None
        }
    }

    pub fn current_version(&self) -> &str {
        &self.current_version
    }
}

fn walk_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    Ok(files)
}

fn unpack_archive(name: &str, data: &[u8], dest: &Path) -> Result<()> {
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        let gz = flate2::read::GzDecoder::new(data);
        let mut tar = tar::Archive::new(gz);
        tar.unpack(dest)?;
        Ok(())
    } else if name.ends_with(".zip") {
        let mut zip = zip::ZipArchive::new(std::io::Cursor::new(data))?;
        for i in 0..zip.len() {
            let mut file = zip.by_index(i)?;
            let Some(rel) = file.enclosed_name().map(|p| p.to_path_buf()) else {
                continue;
            };
            let out = dest.join(rel);
            if file.is_dir() {
                fs::create_dir_all(&out)?;
            } else {
                if let Some(parent) = out.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut content = Vec::new();
                file.read_to_end(&mut content)?;
                fs::write(&out, content)?;
            }
        }
        Ok(())
    } else {
        Err(anyhow!("unsupported archive format: {}", name))
    }
}

/// Pick the asset matching the current OS and architecture.
fn platform_asset(release: &Release) -> Option<ReleaseAsset> {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    };
    let arch_names: &[&str] = match std::env::consts::ARCH {
        "x86_64" => &["amd64", "x86_64"],
        "aarch64" => &["arm64", "aarch64"],
        other => return release
            .assets
            .iter()
            .find(|a| a.name.contains(os) && a.name.contains(other))
            .cloned(),
    };
    release
        .assets
        .iter()
        .find(|a| a.name.contains(os) && arch_names.iter().any(|arch| a.name.contains(arch)))
        .cloned()
}
