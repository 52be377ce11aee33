use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chaos_agent_core::{ExperimentError, Uid};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::fault::{Fault, HandlerEnv};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum FileAction {
    Create,
    Modify,
    Delete,
    Rename,
    Append,
    Replace,
}

/// Filesystem faults. Captured recovery data lives in `backup_file`,
/// `original_mode` and `created`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FileAttack {
    pub action: FileAction,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dir_name: String,
    /// Octal digits as written by the operator, e.g. `644`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privilege: Option<u32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dest_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
    #[serde(default = "default_count")]
    pub count: u32,
    /// 1-based line to restrict `replace` to; 0 means every line.
    #[serde(default)]
    pub line_no: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub origin_str: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dest_str: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub backup_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_mode: Option<u32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created: String,
}

fn default_count() -> u32 {
    1
}

fn bad(message: impl Into<String>) -> ExperimentError {
    ExperimentError::BadConfig(message.into())
}

fn io_error(action: &str, path: &Path, err: &std::io::Error) -> ExperimentError {
    ExperimentError::Transient(format!("failed to {action} {}: {err}", path.display()))
}

/// Converts operator-written octal digits (`755`) into a mode.
///
/// # Errors
/// Returns [`ExperimentError::BadConfig`] when a digit is not octal.
pub fn octal_mode(digits: u32) -> Result<u32, ExperimentError> {
    let mode = u32::from_str_radix(&digits.to_string(), 8)
        .map_err(|_| bad(format!("privilege MUST be octal digits, got {digits}")))?;
    if mode > 0o7777 {
        return Err(bad(format!("privilege {digits} is out of range")));
    }
    Ok(mode)
}

fn backup_path(target: &Path, uid: Uid) -> PathBuf {
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.chaos-agent-{uid}.bak"))
}

impl FileAttack {
    #[must_use]
    pub fn new(action: FileAction) -> Self {
        Self {
            action,
            file_name: String::new(),
            dir_name: String::new(),
            privilege: None,
            dest_name: String::new(),
            data: String::new(),
            count: default_count(),
            line_no: 0,
            origin_str: String::new(),
            dest_str: String::new(),
            backup_file: String::new(),
            original_mode: None,
            created: String::new(),
        }
    }

    fn target(&self) -> PathBuf {
        if self.file_name.is_empty() {
            PathBuf::from(&self.dir_name)
        } else {
            PathBuf::from(&self.file_name)
        }
    }

    /// Copies the target aside once; later runs keep the first backup.
    fn ensure_backup(&mut self, uid: Uid) -> Result<(), ExperimentError> {
        if !self.backup_file.is_empty() && Path::new(&self.backup_file).exists() {
            return Ok(());
        }
        let target = self.target();
        let backup = backup_path(&target, uid);
        fs::copy(&target, &backup).map_err(|err| io_error("back up", &target, &err))?;
        self.backup_file = backup.display().to_string();
        Ok(())
    }

    fn restore_backup(&self) -> Result<(), ExperimentError> {
        let backup = Path::new(&self.backup_file);
        if !backup.exists() {
            warn!(backup = %backup.display(), "backup is gone, nothing to restore");
            return Ok(());
        }
        let target = self.target();
        fs::rename(backup, &target).map_err(|err| io_error("restore", &target, &err))?;
        info!(path = %target.display(), "restored file from backup");
        Ok(())
    }

    fn append(&mut self, uid: Uid) -> Result<(), ExperimentError> {
        self.ensure_backup(uid)?;
        let target = self.target();
        let mut file = OpenOptions::new()
            .append(true)
            .open(&target)
            .map_err(|err| io_error("open", &target, &err))?;
        let mut chunk = String::new();
        for _ in 0..self.count {
            chunk.push_str(&self.data);
            chunk.push('\n');
        }
        file.write_all(chunk.as_bytes())
            .map_err(|err| io_error("append to", &target, &err))
    }

    fn replace(&mut self, uid: Uid) -> Result<(), ExperimentError> {
        self.ensure_backup(uid)?;
        let target = self.target();
        let content =
            fs::read_to_string(&target).map_err(|err| io_error("read", &target, &err))?;

        let replaced = if self.line_no == 0 {
            content.replace(&self.origin_str, &self.dest_str)
        } else {
            let wanted = usize::try_from(self.line_no - 1).unwrap_or(usize::MAX);
            content
                .split_inclusive('\n')
                .enumerate()
                .map(|(index, line)| {
                    if index == wanted {
                        line.replace(&self.origin_str, &self.dest_str)
                    } else {
                        line.to_string()
                    }
                })
                .collect()
        };
        fs::write(&target, replaced).map_err(|err| io_error("write", &target, &err))
    }
}

impl Fault for FileAttack {
    fn action(&self) -> &'static str {
        match self.action {
            FileAction::Create => "create",
            FileAction::Modify => "modify",
            FileAction::Delete => "delete",
            FileAction::Rename => "rename",
            FileAction::Append => "append",
            FileAction::Replace => "replace",
        }
    }

    fn validate(&self) -> Result<(), ExperimentError> {
        let has_file = !self.file_name.trim().is_empty();
        let has_dir = !self.dir_name.trim().is_empty();
        match self.action {
            FileAction::Create | FileAction::Delete => {
                if has_file == has_dir {
                    return Err(bad("exactly one of file_name or dir_name MUST be set"));
                }
            }
            FileAction::Modify | FileAction::Rename | FileAction::Append | FileAction::Replace => {
                if !has_file {
                    return Err(bad("file_name MUST be set"));
                }
            }
        }
        match self.action {
            FileAction::Modify => {
                let privilege = self.privilege.ok_or_else(|| bad("privilege MUST be set"))?;
                octal_mode(privilege)?;
            }
            FileAction::Rename if self.dest_name.trim().is_empty() => {
                return Err(bad("dest_name MUST be set"));
            }
            FileAction::Append if self.data.is_empty() || self.count == 0 => {
                return Err(bad("data MUST be non-empty and count at least 1"));
            }
            FileAction::Replace if self.origin_str.is_empty() => {
                return Err(bad("origin_str MUST be non-empty"));
            }
            _ => {}
        }
        Ok(())
    }

    fn apply(&mut self, env: &HandlerEnv<'_>) -> Result<(), ExperimentError> {
        let target = self.target();
        match self.action {
            FileAction::Create => {
                if target.exists() {
                    return Err(bad(format!("{} already exists", target.display())));
                }
                self.created = target.display().to_string();
                if self.file_name.is_empty() {
                    fs::create_dir_all(&target)
                        .map_err(|err| io_error("create directory", &target, &err))?;
                } else {
                    OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .open(&target)
                        .map_err(|err| io_error("create", &target, &err))?;
                }
            }
            FileAction::Modify => {
                let mode = octal_mode(self.privilege.unwrap_or_default())?;
                let metadata =
                    fs::metadata(&target).map_err(|err| io_error("stat", &target, &err))?;
                if self.original_mode.is_none() {
                    self.original_mode = Some(metadata.permissions().mode() & 0o7777);
                }
                fs::set_permissions(&target, fs::Permissions::from_mode(mode))
                    .map_err(|err| io_error("chmod", &target, &err))?;
            }
            FileAction::Delete => {
                let backup = backup_path(&target, env.uid);
                self.backup_file = backup.display().to_string();
                fs::rename(&target, &backup).map_err(|err| io_error("delete", &target, &err))?;
            }
            FileAction::Rename => {
                let dest = Path::new(&self.dest_name);
                if dest.exists() {
                    return Err(bad(format!("{} already exists", dest.display())));
                }
                fs::rename(&target, dest).map_err(|err| io_error("rename", &target, &err))?;
            }
            FileAction::Append => self.append(env.uid)?,
            FileAction::Replace => self.replace(env.uid)?,
        }
        info!(path = %target.display(), action = self.action(), "file attack applied");
        Ok(())
    }

    fn revert(&self, _env: &HandlerEnv<'_>) -> Result<(), ExperimentError> {
        let target = self.target();
        match self.action {
            FileAction::Create => {
                if self.created.is_empty() || !target.exists() {
                    return Ok(());
                }
                let removed = if target.is_dir() {
                    fs::remove_dir_all(&target)
                } else {
                    fs::remove_file(&target)
                };
                removed.map_err(|err| io_error("remove", &target, &err))
            }
            FileAction::Modify => match self.original_mode {
                Some(mode) => fs::set_permissions(&target, fs::Permissions::from_mode(mode))
                    .map_err(|err| io_error("chmod", &target, &err)),
                None => Ok(()),
            },
            FileAction::Delete if self.backup_file.is_empty() => Ok(()),
            FileAction::Delete => {
                let backup = Path::new(&self.backup_file);
                if !backup.exists() {
                    warn!(backup = %backup.display(), "backup is gone, nothing to restore");
                    return Ok(());
                }
                fs::rename(backup, &target).map_err(|err| io_error("restore", &target, &err))
            }
            FileAction::Rename => {
                let dest = Path::new(&self.dest_name);
                if !dest.exists() || target.exists() {
                    return Ok(());
                }
                fs::rename(dest, &target).map_err(|err| io_error("rename back", dest, &err))
            }
            FileAction::Append | FileAction::Replace if self.backup_file.is_empty() => Ok(()),
            FileAction::Append | FileAction::Replace => self.restore_backup(),
        }
    }

    /// File changes stay in place between scheduled runs; `Recover` undoes
    /// them all at once.
    fn end_run(&self, _env: &HandlerEnv<'_>) -> Result<(), ExperimentError> {
        Ok(())
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

    fn file_attack(action: FileAction, path: &Path) -> FileAttack {
        let mut attack = FileAttack::new(action);
        attack.file_name = path.display().to_string();
        attack
    }

    #[test]
    fn octal_digits_convert_to_mode() {
        assert_eq!(must_ok(octal_mode(644)), 0o644);
        assert_eq!(must_ok(octal_mode(4755)), 0o4755);
        assert!(octal_mode(678).is_err());
    }

    #[test]
    fn append_accumulates_and_revert_restores_original() {
        let dir = must_ok(tempfile::tempdir());
        let path = dir.path().join("app.log");
        must_ok(fs::write(&path, "original\n"));

        let mut attack = file_attack(FileAction::Append, &path);
        attack.data = "x".to_string();
        must_ok(attack.validate());

        with_env(|env| {
            must_ok(attack.apply(env));
            must_ok(attack.end_run(env));
            must_ok(attack.apply(env));
            assert_eq!(must_ok(fs::read_to_string(&path)), "original\nx\nx\n");

            must_ok(attack.revert(env));
        });
        assert_eq!(must_ok(fs::read_to_string(&path)), "original\n");
        assert!(!Path::new(&attack.backup_file).exists());
    }

    #[test]
    fn replace_limited_to_one_line() {
        let dir = must_ok(tempfile::tempdir());
        let path = dir.path().join("config.ini");
        must_ok(fs::write(&path, "port=80\nport=80\n"));

        let mut attack = file_attack(FileAction::Replace, &path);
        attack.origin_str = "80".to_string();
        attack.dest_str = "81".to_string();
        attack.line_no = 2;

        with_env(|env| {
            must_ok(attack.apply(env));
            assert_eq!(must_ok(fs::read_to_string(&path)), "port=80\nport=81\n");
            must_ok(attack.revert(env));
        });
        assert_eq!(must_ok(fs::read_to_string(&path)), "port=80\nport=80\n");
    }

    #[test]
    fn delete_and_rename_are_reversible() {
        let dir = must_ok(tempfile::tempdir());
        let path = dir.path().join("data.txt");
        let moved = dir.path().join("moved.txt");
        must_ok(fs::write(&path, "payload"));

        let mut delete = file_attack(FileAction::Delete, &path);
        with_env(|env| {
            must_ok(delete.apply(env));
            assert!(!path.exists());
            must_ok(delete.revert(env));
        });
        assert_eq!(must_ok(fs::read_to_string(&path)), "payload");

        let mut rename = file_attack(FileAction::Rename, &path);
        rename.dest_name = moved.display().to_string();
        with_env(|env| {
            must_ok(rename.apply(env));
            assert!(moved.exists() && !path.exists());
            must_ok(rename.revert(env));
        });
        assert!(path.exists() && !moved.exists());
    }

    #[test]
    fn modify_restores_previous_mode() {
        let dir = must_ok(tempfile::tempdir());
        let path = dir.path().join("secret");
        must_ok(fs::write(&path, ""));
        must_ok(fs::set_permissions(&path, fs::Permissions::from_mode(0o640)));

        let mut attack = file_attack(FileAction::Modify, &path);
        attack.privilege = Some(777);
        with_env(|env| {
            must_ok(attack.apply(env));
            assert_eq!(must_ok(fs::metadata(&path)).permissions().mode() & 0o7777, 0o777);
            must_ok(attack.revert(env));
        });
        assert_eq!(attack.original_mode, Some(0o640));
        assert_eq!(must_ok(fs::metadata(&path)).permissions().mode() & 0o7777, 0o640);
    }

    #[test]
    fn create_refuses_existing_and_revert_removes() {
        let dir = must_ok(tempfile::tempdir());
        let created = dir.path().join("new-dir");
        let mut attack = FileAttack::new(FileAction::Create);
        attack.dir_name = created.display().to_string();
        must_ok(attack.validate());

        with_env(|env| {
            must_ok(attack.apply(env));
            assert!(created.is_dir());
            assert!(attack.clone().apply(env).is_err());
            must_ok(attack.revert(env));
        });
        assert!(!created.exists());
    }

    #[test]
    fn validation_checks_action_fields() {
        let mut create = FileAttack::new(FileAction::Create);
        assert!(create.validate().is_err());
        create.file_name = "/tmp/a".to_string();
        create.dir_name = "/tmp/b".to_string();
        assert!(create.validate().is_err());

        let mut append = FileAttack::new(FileAction::Append);
        append.file_name = "/tmp/a".to_string();
        assert!(append.validate().is_err());
        append.data = "x".to_string();
        assert!(append.validate().is_ok());

        let mut modify = FileAttack::new(FileAction::Modify);
        modify.file_name = "/tmp/a".to_string();
        assert!(modify.validate().is_err());
        modify.privilege = Some(999);
        assert!(modify.validate().is_err());
    }
}
