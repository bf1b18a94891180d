use std::path::{Path, PathBuf};

const DEFAULT_ADB: &str = "adb";
const SDK_ROOT_VARS: [&str; 2] = ["ANDROID_HOME", "ANDROID_SDK_ROOT"];

pub fn normalize_command_path(value: &str) -> String {
    let trimmed = value.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = trimmed
            .strip_prefix(quote)
            .and_then(|candidate| candidate.strip_suffix(quote))
        {
            return inner.trim().to_string();
        }
    }
    trimmed.to_string()
}

fn adb_file_name() -> &'static str {
    if cfg!(windows) {
        "adb.exe"
    } else {
        DEFAULT_ADB
    }
}

/// Configured path first, then `$ANDROID_HOME/platform-tools`, then `adb` from `PATH`.
pub fn resolve_adb_program(config_command_path: &str) -> String {
    let normalized = normalize_command_path(config_command_path);
    if !normalized.is_empty() {
        return normalized;
    }
    for var in SDK_ROOT_VARS {
        let Some(root) = std::env::var_os(var) else {
            continue;
        };
        let candidate = PathBuf::from(root)
            .join("platform-tools")
            .join(adb_file_name());
        if candidate.is_file() {
            return candidate.to_string_lossy().to_string();
        }
    }
    DEFAULT_ADB.to_string()
}

pub fn find_on_path(program: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .flat_map(|dir| {
            let plain = dir.join(program);
            let exe = dir.join(format!("{program}.exe"));
            [plain, exe]
        })
        .find(|candidate| candidate.is_file())
}

pub fn validate_adb_program(program: &str) -> Result<(), String> {
    if program.trim().is_empty() {
        return Err("ADB command is empty".to_string());
    }
    if program == DEFAULT_ADB {
        return match find_on_path(program) {
            Some(_) => Ok(()),
            None => Err("ADB is not installed or not in PATH".to_string()),
        };
    }
    let path = Path::new(program);
    if path.is_dir() {
        return Err("ADB path must point to an executable file".to_string());
    }
    if !path.exists() {
        return Err("ADB executable not found at the configured path".to_string());
    }
    Ok(())
}
