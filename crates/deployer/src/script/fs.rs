//! Filesystem calls behind the scripts' built-in `fs` module
//!
//! Scripts run on a blocking thread, so plain `std::fs` is used. Relative
//! paths resolve against the workspace root. Replies are JSON: `{"ok": ..}`
//! or `{"error": {"code", "message"}}` with a Node-style error code.

use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde_json::{Value, json};

/// Run filesystem operation `op` with JSON-encoded positional `args`
pub fn call(root: &Path, op: &str, args: &str) -> String {
    let result = serde_json::from_str::<Vec<Value>>(args)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
        .and_then(|args| Call { root, op, args }.run());

    match result {
        Ok(value) => json!({ "ok": value }).to_string(),
        Err(e) => {
            tracing::debug!(%op, error = %e, "Script fs call failed");
            json!({ "error": { "code": error_code(&e), "message": format!("{op}: {e}") } }).to_string()
        }
    }
}

struct Call<'a> {
    root: &'a Path,
    op: &'a str,
    args: Vec<Value>,
}

impl Call<'_> {
    fn run(&self) -> io::Result<Value> {
        match self.op {
            "readFile" => Ok(json!(std::fs::read_to_string(self.path(0)?)?)),
            "writeFile" => {
                std::fs::write(self.path(0)?, self.text(1))?;
                Ok(Value::Null)
            }
            "appendFile" => {
                use std::io::Write;
                let mut file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.path(0)?)?;
                file.write_all(self.text(1).as_bytes())?;
                Ok(Value::Null)
            }
            "copyFile" => {
                std::fs::copy(self.path(0)?, self.path(1)?)?;
                Ok(Value::Null)
            }
            "rename" => {
                std::fs::rename(self.path(0)?, self.path(1)?)?;
                Ok(Value::Null)
            }
            "mkdir" => {
                let path = self.path(0)?;
                if self.flag(1) {
                    std::fs::create_dir_all(path)?;
                } else {
                    std::fs::create_dir(path)?;
                }
                Ok(Value::Null)
            }
            "exists" => Ok(json!(self.path(0)?.exists())),
            "readdir" => {
                let mut names = std::fs::read_dir(self.path(0)?)?
                    .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
                    .collect::<io::Result<Vec<_>>>()?;
                names.sort();
                Ok(json!(names))
            }
            "stat" => {
                let meta = std::fs::metadata(self.path(0)?)?;
                let modified = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as u64);
                Ok(json!({
                    "size": meta.len(),
                    "file": meta.is_file(),
                    "directory": meta.is_dir(),
                    "mtimeMs": modified,
                }))
            }
            "rm" => {
                let path = self.path(0)?;
                let removed = if path.is_dir() {
                    if self.flag(1) {
                        std::fs::remove_dir_all(&path)
                    } else {
                        std::fs::remove_dir(&path)
                    }
                } else {
                    std::fs::remove_file(&path)
                };
                match removed {
                    Err(e) if e.kind() == io::ErrorKind::NotFound && self.flag(2) => Ok(Value::Null),
                    other => other.map(|_| Value::Null),
                }
            }
            other => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unknown operation '{other}'"),
            )),
        }
    }

    fn path(&self, index: usize) -> io::Result<PathBuf> {
        let raw = self.args.get(index).and_then(Value::as_str).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("argument {index} must be a path"))
        })?;
        let path = Path::new(raw);
        Ok(if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        })
    }

    fn text(&self, index: usize) -> &str {
        self.args.get(index).and_then(Value::as_str).unwrap_or_default()
    }

    fn flag(&self, index: usize) -> bool {
        self.args.get(index).and_then(Value::as_bool).unwrap_or(false)
    }
}

fn error_code(error: &io::Error) -> &'static str {
    match error.kind() {
        io::ErrorKind::NotFound => "ENOENT",
        io::ErrorKind::AlreadyExists => "EEXIST",
        io::ErrorKind::PermissionDenied => "EACCES",
        io::ErrorKind::InvalidInput => "EINVAL",
        io::ErrorKind::Unsupported => "ENOSYS",
        io::ErrorKind::DirectoryNotEmpty => "ENOTEMPTY",
        _ => "EIO",
    }
}
