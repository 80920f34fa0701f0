use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

use zip::ZipArchive;

use crate::error::{NovaError, Result};

use super::helpers::{parse_version, validate_plugin_id};
use super::manifest::{parse_manifest, PluginManifest, MANIFEST_FILE};

/// Result of extracting an archive into the plugins directory.
#[derive(Debug, Clone)]
pub struct InstalledArchive {
    pub dir: PathBuf,
    pub manifest: PluginManifest,
}

/// Extracts plugin archives under one directory, one sub-directory per ID.
#[derive(Debug, Clone)]
pub struct PluginInstaller {
    plugins_dir: PathBuf,
}

impl PluginInstaller {
    pub fn new(plugins_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugins_dir: plugins_dir.into(),
        }
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    pub fn plugin_dir(&self, plugin_id: &str) -> PathBuf {
        self.plugins_dir.join(plugin_id)
    }

    /// Validates and extracts `archive` into a staging directory, then swaps
    /// it over any existing install of the same plugin.
    pub async fn install(
        &self,
        plugin_id: &str,
        version: &str,
        archive: Vec<u8>,
    ) -> Result<InstalledArchive> {
        validate_plugin_id(plugin_id)?;
        let plugins_dir = self.plugins_dir.clone();
        let plugin_id = plugin_id.to_string();
        let version = version.to_string();
        tokio::task::spawn_blocking(move || install_blocking(&plugins_dir, &plugin_id, &version, &archive))
            .await
            .map_err(|e| NovaError::internal(format!("Install task failed: {}", e)))?
    }

    pub async fn uninstall(&self, plugin_id: &str) -> Result<()> {
        validate_plugin_id(plugin_id)?;
        let dir = self.plugin_dir(plugin_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn install_blocking(
    plugins_dir: &Path,
    plugin_id: &str,
    version: &str,
    archive: &[u8],
) -> Result<InstalledArchive> {
    let requested = parse_version(version)?;
    fs::create_dir_all(plugins_dir)?;

    let staging = plugins_dir.join(format!(".staging-{}-{}", plugin_id, version));
    remove_if_exists(&staging)?;
    fs::create_dir_all(&staging)?;

    let staged = extract_archive(archive, &staging).and_then(|()| {
        let root = content_root(&staging)?;
        let manifest = parse_manifest(&fs::read(root.join(MANIFEST_FILE))?)?;
        if manifest.id != plugin_id {
            return Err(NovaError::validation_error(format!(
                "Archive contains plugin {} but {} was requested",
                manifest.id, plugin_id
            )));
        }
        if parse_version(&manifest.info.version)? != requested {
            return Err(NovaError::validation_error(format!(
                "Archive contains version {} but {} was requested",
                manifest.info.version, version
            )));
        }
        Ok((root, manifest))
    });

    let (root, manifest) = match staged {
        Ok(staged) => staged,
        Err(err) => {
            let _ = fs::remove_dir_all(&staging);
            return Err(err);
        }
    };

    let target = plugins_dir.join(plugin_id);
    let backup = plugins_dir.join(format!(".previous-{}", plugin_id));
    remove_if_exists(&backup)?;
    let had_previous = target.exists();
    if had_previous {
        fs::rename(&target, &backup)?;
    }
    if let Err(err) = fs::rename(&root, &target) {
        if had_previous {
            let _ = fs::rename(&backup, &target);
        }
        let _ = fs::remove_dir_all(&staging);
        return Err(err.into());
    }
    if had_previous {
        let _ = fs::remove_dir_all(&backup);
    }
    let _ = fs::remove_dir_all(&staging);

    Ok(InstalledArchive {
        dir: target,
        manifest,
    })
}

fn extract_archive(archive: &[u8], dest: &Path) -> Result<()> {
    let mut zip = ZipArchive::new(Cursor::new(archive))?;
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let relative = entry.enclosed_name().map(Path::to_path_buf).ok_or_else(|| {
            NovaError::validation_error(format!(
                "Archive entry escapes the plugin directory: {}",
                entry.name()
            ))
        })?;
        let out_path = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&out_path)?;
        io::copy(&mut entry, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            // owner must keep read/write so upgrades can replace the file
            let mode = (mode & 0o777) | 0o600;
            fs::set_permissions(&out_path, fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(())
}

/// Archives often wrap everything in one top-level folder.
fn content_root(staging: &Path) -> Result<PathBuf> {
    if staging.join(MANIFEST_FILE).is_file() {
        return Ok(staging.to_path_buf());
    }
    let entries = fs::read_dir(staging)?
        .collect::<io::Result<Vec<_>>>()?;
    if let [only] = entries.as_slice() {
        let path = only.path();
        if path.is_dir() && path.join(MANIFEST_FILE).is_file() {
            return Ok(path);
        }
    }
    Err(NovaError::validation_error(
        "Archive does not contain a plugin.json",
    ))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
