//! `--install` / `--uninstall` autostart registration (spec.md §6 CLI surface).
//!
//! Linux: an XDG autostart `.desktop` entry. Other platforms: not yet
//! implemented, returns an error (exit code 1 per §6).

use anyhow::{bail, Context, Result};
use std::path::PathBuf;

const DESKTOP_FILE_NAME: &str = "wellcom-agent.desktop";

#[cfg(target_os = "linux")]
fn autostart_dir() -> Result<PathBuf> {
    let base = dirs::config_dir().context("could not determine XDG config directory")?;
    Ok(base.join("autostart"))
}

#[cfg(target_os = "linux")]
pub fn install() -> Result<()> {
    let dir = autostart_dir()?;
    std::fs::create_dir_all(&dir)?;
    let exe = std::env::current_exe().context("could not determine current executable path")?;
    let contents = format!(
        "[Desktop Entry]\nType=Application\nName=wellcom-agent\nExec={}\nX-GNOME-Autostart-enabled=true\n",
        exe.display()
    );
    std::fs::write(dir.join(DESKTOP_FILE_NAME), contents)?;
    log::info!("autostart: installed {}", dir.join(DESKTOP_FILE_NAME).display());
    Ok(())
}

#[cfg(target_os = "linux")]
pub fn uninstall() -> Result<()> {
    let path = autostart_dir()?.join(DESKTOP_FILE_NAME);
    if path.exists() {
        std::fs::remove_file(&path)?;
    }
    log::info!("autostart: removed {}", path.display());
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn install() -> Result<()> {
    bail!("autostart installation is not implemented on this platform");
}

#[cfg(not(target_os = "linux"))]
pub fn uninstall() -> Result<()> {
    bail!("autostart removal is not implemented on this platform");
}
