use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::process::Command;

use crate::BootError;
use crate::payload::RunnerInstall;

/// File that marks a complete runner installation.
pub const RUNNER_ENTRYPOINT: &str = "run.sh";

const ARCHIVE_NAME: &str = "runner.tar.gz";

#[derive(Debug, PartialEq, Eq)]
pub enum InstallOutcome {
    /// The runner was baked into the image.
    AlreadyInstalled,
    Installed,
}

pub fn is_installed(install_dir: &Path) -> bool {
    install_dir.join(RUNNER_ENTRYPOINT).is_file()
}

/// Checks that `data` hashes to the hex encoded SHA-256 `expected`.
pub fn verify_checksum(data: &[u8], expected: &str) -> crate::Result<()> {
    let actual = hex::encode(Sha256::digest(data));
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(BootError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Makes sure that the runner is present in its install directory.
///
/// The archive is only extracted after its checksum was verified. A mismatch is returned as
/// [`BootError::ChecksumMismatch`] and nothing is written into the install directory.
pub async fn ensure_runner(
    install: &RunnerInstall,
    client: &reqwest::Client,
) -> crate::Result<InstallOutcome> {
    if is_installed(&install.install_dir) {
        log::info!(
            "Runner found in {}, skipping installation",
            install.install_dir.display()
        );
        return Ok(InstallOutcome::AlreadyInstalled);
    }

    log::info!(
        "Downloading runner {} from {}",
        install.version,
        install.download_url
    );
    let archive = client
        .get(&install.download_url)
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;

    verify_checksum(&archive, &install.sha256)?;
    log::debug!("Runner archive checksum verified");

    tokio::fs::create_dir_all(&install.install_dir).await?;
    let download_dir = tempfile::TempDir::with_prefix_in("download", &install.install_dir)?;
    let archive_path = download_dir.path().join(ARCHIVE_NAME);
    tokio::fs::write(&archive_path, &archive).await?;

    let output = Command::new("tar")
        .arg("xzf")
        .arg(&archive_path)
        .arg("-C")
        .arg(&install.install_dir)
        .output()
        .await?;
    if !output.status.success() {
        return Err(BootError::GenericError(format!(
            "Runner extraction failed with exit code {}: {}",
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    if !is_installed(&install.install_dir) {
        return Err(BootError::GenericError(format!(
            "Runner archive does not contain {RUNNER_ENTRYPOINT}"
        )));
    }
    Ok(InstallOutcome::Installed)
}
