use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::app::adb::runner::run_command_with_timeout;
use crate::app::error::AppError;

const BADGING_TIMEOUT: Duration = Duration::from_secs(5);

/// APK files to hand to one `install`/`install-multiple` call, base first.
pub struct ApkArtifact {
    pub app_name: String,
    pub apk_paths: Vec<String>,
    /// Extracted bundles live here until the artifact is dropped.
    #[allow(dead_code)]
    temp_dir: Option<TempDir>,
}

impl ApkArtifact {
    pub fn is_split(&self) -> bool {
        self.apk_paths.len() > 1
    }

    pub fn base_apk(&self) -> Option<&str> {
        self.apk_paths.first().map(String::as_str)
    }
}

pub fn is_split_bundle(path: &Path) -> bool {
    let lower = path.to_string_lossy().to_lowercase();
    lower.ends_with(".apks") || lower.ends_with(".xapk")
}

fn is_apk(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("apk"))
}

fn sort_base_first(paths: &mut [String]) {
    paths.sort_by_key(|path| {
        let name = Path::new(path)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("")
            .to_lowercase();
        (!name.starts_with("base"), name)
    });
}

/// Every non-hidden sub-folder of `apks_dir` holding at least one `.apk` is an app.
pub fn scan_apk_folders(apks_dir: &Path) -> BTreeMap<String, Vec<String>> {
    let mut apps = BTreeMap::new();
    let Ok(entries) = fs::read_dir(apks_dir) else {
        warn!(dir = %apks_dir.display(), "apk directory missing");
        return apps;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if !path.is_dir() || name.starts_with('.') {
            continue;
        }
        let mut apk_files: Vec<String> = fs::read_dir(&path)
            .into_iter()
            .flatten()
            .flatten()
            .map(|file| file.path())
            .filter(|file| file.is_file() && is_apk(file))
            .map(|file| file.to_string_lossy().to_string())
            .collect();
        if apk_files.is_empty() {
            continue;
        }
        sort_base_first(&mut apk_files);
        debug!(app = %name, files = apk_files.len(), "found app folder");
        apps.insert(name, apk_files);
    }
    apps
}

pub fn extract_split_apks(path: &Path, trace_id: &str) -> Result<ApkArtifact, AppError> {
    let file = File::open(path)
        .map_err(|err| AppError::validation(format!("Failed to open bundle: {err}"), trace_id))?;
    let mut archive = ZipArchive::new(file)
        .map_err(|err| AppError::validation(format!("Invalid bundle: {err}"), trace_id))?;
    let temp_dir = TempDir::new()
        .map_err(|err| AppError::system(format!("Failed to create temp dir: {err}"), trace_id))?;
    let mut extracted = Vec::new();

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|err| AppError::validation(format!("Failed to read bundle: {err}"), trace_id))?;
        let name = entry.name().to_string();
        if !name.to_lowercase().ends_with(".apk") {
            continue;
        }
        let file_name = Path::new(&name)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| AppError::validation("Invalid apk name in bundle", trace_id))?;
        let target = temp_dir.path().join(file_name);
        let mut buffer = Vec::new();
        entry
            .read_to_end(&mut buffer)
            .map_err(|err| AppError::system(format!("Failed to read apk: {err}"), trace_id))?;
        File::create(&target)
            .and_then(|mut output| output.write_all(&buffer))
            .map_err(|err| AppError::system(format!("Failed to extract apk: {err}"), trace_id))?;
        extracted.push(target.to_string_lossy().to_string());
    }

    if extracted.is_empty() {
        return Err(AppError::validation(
            format!("Bundle {} contains no apk files", path.display()),
            trace_id,
        ));
    }
    sort_base_first(&mut extracted);

    let app_name = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();
    Ok(ApkArtifact {
        app_name,
        apk_paths: extracted,
        temp_dir: Some(temp_dir),
    })
}

/// Looks up `app` under `apks_dir`: a folder of `.apk` files, a folder holding one bundle, or
/// a bundle file named after the app.
pub fn resolve_app_artifact(
    apks_dir: &Path,
    app: &str,
    trace_id: &str,
) -> Result<ApkArtifact, AppError> {
    let app = app.trim();
    if app.is_empty() {
        return Err(AppError::validation("App name is required", trace_id));
    }

    if let Some(apk_paths) = scan_apk_folders(apks_dir).remove(app) {
        return Ok(ApkArtifact {
            app_name: app.to_string(),
            apk_paths,
            temp_dir: None,
        });
    }

    let folder = apks_dir.join(app);
    if folder.is_dir() {
        let bundle = fs::read_dir(&folder)
            .into_iter()
            .flatten()
            .flatten()
            .map(|entry| entry.path())
            .find(|path| path.is_file() && is_split_bundle(path));
        if let Some(bundle) = bundle {
            let mut artifact = extract_split_apks(&bundle, trace_id)?;
            artifact.app_name = app.to_string();
            return Ok(artifact);
        }
    }

    for extension in ["apks", "xapk"] {
        let bundle = apks_dir.join(format!("{app}.{extension}"));
        if bundle.is_file() {
            let mut artifact = extract_split_apks(&bundle, trace_id)?;
            artifact.app_name = app.to_string();
            return Ok(artifact);
        }
    }

    Err(AppError::validation(
        format!("No APK files found for '{app}' in {}", apks_dir.display()),
        trace_id,
    ))
}

/// `package: name='com.example' versionCode=...` from `aapt dump badging`.
pub fn parse_badging_package(output: &str) -> Option<String> {
    output
        .lines()
        .find(|line| line.starts_with("package:"))?
        .split_whitespace()
        .find_map(|part| part.strip_prefix("name="))
        .map(|value| value.trim_matches('\'').to_string())
        .filter(|value| !value.is_empty())
}

/// Best effort: tries `aapt` then `aapt2`. `None` when neither is installed.
pub fn probe_package_name(apk_path: &str, trace_id: &str) -> Option<String> {
    let args = vec!["dump".to_string(), "badging".to_string(), apk_path.to_string()];
    for tool in ["aapt", "aapt2"] {
        match run_command_with_timeout(tool, &args, BADGING_TIMEOUT, trace_id) {
            Ok(output) if output.success() => {
                if let Some(package) = parse_badging_package(&output.stdout) {
                    return Some(package);
                }
            }
            Ok(_) => {}
            Err(err) => debug!(trace_id = %trace_id, tool, error = %err, "badging probe failed"),
        }
    }
    None
}

pub fn normalize_apk_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
