use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chaos_agent_core::{ExperimentError, Uid};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cancel::Cancellation;
use crate::fault::{Fault, HandlerEnv};

const CHUNK: usize = 1 << 20;
const FILL_PREFIX: &str = "chaos_agent_fill_";
const PAYLOAD_PREFIX: &str = "chaos_agent_payload_";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum DiskAction {
    Fill,
    WritePayload,
    ReadPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DiskAttack {
    pub action: DiskAction,
    /// Target directory, or the file to read for `read-payload`.
    pub path: String,
    pub size: String,
    #[serde(default = "default_process_num")]
    pub payload_process_num: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fill_file: String,
}

fn default_process_num() -> u32 {
    1
}

impl DiskAttack {
    #[must_use]
    pub fn new(action: DiskAction, path: impl Into<String>, size: impl Into<String>) -> Self {
        Self {
            action,
            path: path.into(),
            size: size.into(),
            payload_process_num: default_process_num(),
            fill_file: String::new(),
        }
    }

    fn payload_dir(&self) -> PathBuf {
        let path = Path::new(&self.path);
        match self.action {
            DiskAction::ReadPayload => path.parent().map(Path::to_path_buf).unwrap_or_default(),
            DiskAction::Fill | DiskAction::WritePayload => path.to_path_buf(),
        }
    }
}

/// Parses sizes such as `512`, `10K`, `64M`, `2G` or `1GiB` into bytes.
///
/// # Errors
/// Returns [`ExperimentError::BadConfig`] for malformed input.
pub fn parse_size(raw: &str) -> Result<u64, ExperimentError> {
    let trimmed = raw.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let value: u64 = number
        .parse()
        .map_err(|_| ExperimentError::BadConfig(format!("size MUST be a number with unit, got {raw:?}")))?;
    let scale: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        "T" | "TB" | "TIB" => 1 << 40,
        _ => {
            return Err(ExperimentError::BadConfig(format!(
                "size unit of {raw:?} is not supported"
            )))
        }
    };
    value
        .checked_mul(scale)
        .ok_or_else(|| ExperimentError::BadConfig(format!("size {raw:?} is out of range")))
}

fn io_error(action: &str, path: &Path, err: &std::io::Error) -> ExperimentError {
    ExperimentError::Transient(format!("failed to {action} {}: {err}", path.display()))
}

fn write_zeros(path: &Path, size: u64, sync_each: bool, cancel: &Cancellation) -> Result<(), ExperimentError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|err| io_error("create", path, &err))?;
    let zeros = vec![0_u8; CHUNK];
    let mut remaining = size;
    while remaining > 0 {
        if cancel.is_cancelled() {
            return Err(ExperimentError::Transient(format!(
                "writing {} was cancelled",
                path.display()
            )));
        }
        let step = usize::try_from(remaining.min(CHUNK as u64)).unwrap_or(CHUNK);
        file.write_all(&zeros[..step])
            .map_err(|err| io_error("write", path, &err))?;
        if sync_each {
            file.sync_data().map_err(|err| io_error("sync", path, &err))?;
        }
        remaining -= step as u64;
    }
    file.sync_all().map_err(|err| io_error("sync", path, &err))
}

fn read_through(path: &Path, size: u64, cancel: &Cancellation) -> Result<(), ExperimentError> {
    let mut file = File::open(path).map_err(|err| io_error("open", path, &err))?;
    let mut buffer = vec![0_u8; CHUNK];
    let mut remaining = size;
    while remaining > 0 && !cancel.is_cancelled() {
        let read = file
            .read(&mut buffer)
            .map_err(|err| io_error("read", path, &err))?;
        if read == 0 {
            break;
        }
        remaining = remaining.saturating_sub(read as u64);
    }
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<(), ExperimentError> {
    match fs::remove_file(path) {
        Ok(()) => {
            info!(path = %path.display(), "removed disk attack file");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_error("remove", path, &err)),
    }
}

fn payload_path(dir: &Path, uid: Uid, index: u32) -> PathBuf {
    dir.join(format!("{PAYLOAD_PREFIX}{uid}_{index}"))
}

impl Fault for DiskAttack {
    fn action(&self) -> &'static str {
        match self.action {
            DiskAction::Fill => "fill",
            DiskAction::WritePayload => "write-payload",
            DiskAction::ReadPayload => "read-payload",
        }
    }

    fn validate(&self) -> Result<(), ExperimentError> {
        if self.path.trim().is_empty() {
            return Err(ExperimentError::BadConfig("path MUST be set".to_string()));
        }
        if parse_size(&self.size)? == 0 {
            return Err(ExperimentError::BadConfig("size MUST be positive".to_string()));
        }
        if self.payload_process_num == 0 {
            return Err(ExperimentError::BadConfig(
                "payload_process_num MUST be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn apply(&mut self, env: &HandlerEnv<'_>) -> Result<(), ExperimentError> {
        let size = parse_size(&self.size)?;
        let path = PathBuf::from(&self.path);
        match self.action {
            DiskAction::Fill => {
                let target = path.join(format!("{FILL_PREFIX}{}.dat", env.uid));
                self.fill_file = target.display().to_string();
                write_zeros(&target, size, false, env.cancel)?;
                info!(path = %target.display(), size, "filled disk");
            }
            DiskAction::WritePayload => {
                for index in 0..self.payload_process_num {
                    let target = payload_path(&path, env.uid, index);
                    let written = write_zeros(&target, size, true, env.cancel);
                    remove_if_present(&target)?;
                    written?;
                }
            }
            DiskAction::ReadPayload => {
                for _ in 0..self.payload_process_num {
                    read_through(&path, size, env.cancel)?;
                }
            }
        }
        Ok(())
    }

    fn revert(&self, env: &HandlerEnv<'_>) -> Result<(), ExperimentError> {
        match self.action {
            DiskAction::Fill if self.fill_file.is_empty() => Ok(()),
            DiskAction::Fill => remove_if_present(Path::new(&self.fill_file)),
            DiskAction::WritePayload | DiskAction::ReadPayload => {
                let dir = self.payload_dir();
                let prefix = format!("{PAYLOAD_PREFIX}{}_", env.uid);
                let Ok(entries) = fs::read_dir(&dir) else {
                    warn!(dir = %dir.display(), "payload directory is gone");
                    return Ok(());
                };
                for entry in entries.flatten() {
                    if entry.file_name().to_string_lossy().starts_with(&prefix) {
                        remove_if_present(&entry.path())?;
                    }
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::tests_support::with_env;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }

    #[test]
    fn sizes_use_binary_units() {
        assert_eq!(must_ok(parse_size("512")), 512);
        assert_eq!(must_ok(parse_size("10K")), 10 * 1024);
        assert_eq!(must_ok(parse_size("64m")), 64 << 20);
        assert_eq!(must_ok(parse_size("1GiB")), 1 << 30);
        assert!(parse_size("ten").is_err());
        assert!(parse_size("5X").is_err());
    }

    #[test]
    fn fill_then_revert_removes_filler() {
        let dir = must_ok(tempfile::tempdir());
        let mut attack = DiskAttack::new(DiskAction::Fill, dir.path().display().to_string(), "3M");
        must_ok(attack.validate());

        with_env(|env| {
            must_ok(attack.apply(env));
            let filler = PathBuf::from(&attack.fill_file);
            assert_eq!(must_ok(fs::metadata(&filler)).len(), 3 << 20);

            must_ok(attack.revert(env));
            assert!(!filler.exists());
            must_ok(attack.revert(env));
        });
    }

    #[test]
    fn write_payload_leaves_nothing_behind() {
        let dir = must_ok(tempfile::tempdir());
        let mut attack =
            DiskAttack::new(DiskAction::WritePayload, dir.path().display().to_string(), "1M");
        attack.payload_process_num = 2;

        with_env(|env| must_ok(attack.apply(env)));
        assert_eq!(must_ok(fs::read_dir(dir.path())).count(), 0);
    }

    #[test]
    fn read_payload_requires_existing_file() {
        let dir = must_ok(tempfile::tempdir());
        let target = dir.path().join("data.bin");
        let mut missing =
            DiskAttack::new(DiskAction::ReadPayload, target.display().to_string(), "1K");
        assert!(with_env(|env| missing.apply(env)).is_err());

        must_ok(fs::write(&target, vec![7_u8; 4096]));
        let mut present = DiskAttack::new(DiskAction::ReadPayload, target.display().to_string(), "1K");
        assert!(with_env(|env| present.apply(env)).is_ok());
    }
}
