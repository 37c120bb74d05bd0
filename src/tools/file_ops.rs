// File operations behind READ, WRITE and APPEND.
//
// Every function takes a `ResolvedPath`, so nothing here can be reached with a
// path the guard has not approved.

use std::io;
use std::path::{Path, PathBuf};

use tokio::io::AsyncReadExt;

use super::path_guard::ResolvedPath;
use crate::error::ToolError;

/// Bytes shown when a file is not text.
const HEX_PREVIEW_BYTES: usize = 256;

/// Outcome of a WRITE or APPEND.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReport {
    /// Size of the file after the write.
    pub bytes: usize,
    /// Where the previous version was copied, if there was one.
    pub backup: Option<PathBuf>,
    /// Set when the previous version existed but could not be backed up.
    pub backup_warning: Option<String>,
}

/// Reads and writes files inside the sandbox.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    backup_dir: PathBuf,
    max_read_bytes: u64,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>, max_read_bytes: u64) -> Self {
        Self {
            root: root.into(),
            backup_dir: backup_dir.into(),
            max_read_bytes,
        }
    }

    fn display(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel.display().to_string(),
            _ => path.display().to_string(),
        }
    }

    // ── Read ────────────────────────────────────────────────────────────────

    /// Read up to the byte cap. Directories are listed; undecodable content is
    /// shown as a hex preview.
    pub async fn read(&self, path: &ResolvedPath) -> Result<String, ToolError> {
        let target = path.as_path();
        let shown = self.display(target);
        let metadata = tokio::fs::metadata(target)
            .await
            .map_err(|e| ToolError::io(format!("reading {shown}"), e))?;
        if metadata.is_dir() {
            return list_dir(target, &shown).await;
        }

        let file = tokio::fs::File::open(target)
            .await
            .map_err(|e| ToolError::io(format!("reading {shown}"), e))?;
        let total = metadata.len();
        let mut bytes = Vec::with_capacity(total.min(self.max_read_bytes) as usize);
        file.take(self.max_read_bytes)
            .read_to_end(&mut bytes)
            .await
            .map_err(|e| ToolError::io(format!("reading {shown}"), e))?;
        let truncated = total > bytes.len() as u64;

        if bytes.is_empty() {
            return Ok("(empty file)".to_string());
        }

        let mut output = match decode_text(&bytes, truncated) {
            Some(text) => text.to_string(),
            None => {
                let preview = &bytes[..bytes.len().min(HEX_PREVIEW_BYTES)];
                format!(
                    "(binary file, {total} bytes; hex preview of the first {} bytes)\n{}",
                    preview.len(),
                    hex_preview(preview)
                )
            }
        };
        if truncated {
            output.push_str(&format!(
                "\n\n[truncated: showing the first {} of {} bytes]",
                bytes.len(),
                total
            ));
        }
        Ok(output)
    }

    // ── Write ───────────────────────────────────────────────────────────────

    /// Write `content`, creating parent directories and backing up any
    /// previous version first.
    pub async fn write(&self, path: &ResolvedPath, content: &str) -> Result<WriteReport, ToolError> {
        self.write_bytes(path, content.as_bytes()).await
    }

    /// Append `content` by reading the current file and rewriting it through
    /// [`FileStore::write`]'s path.
    pub async fn append(&self, path: &ResolvedPath, content: &str) -> Result<WriteReport, ToolError> {
        let target = path.as_path();
        let mut combined = match tokio::fs::read(target).await {
            Ok(existing) => existing,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(ToolError::io(
                    format!("reading {}", self.display(target)),
                    e,
                ))
            }
        };
        combined.extend_from_slice(content.as_bytes());
        self.write_bytes(path, &combined).await
    }

    async fn write_bytes(&self, path: &ResolvedPath, bytes: &[u8]) -> Result<WriteReport, ToolError> {
        let target = path.as_path();
        let shown = self.display(target);

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::io(format!("creating directory for {shown}"), e))?;
        }

        let mut report = WriteReport {
            bytes: bytes.len(),
            backup: None,
            backup_warning: None,
        };
        let previous = tokio::fs::metadata(target).await.ok();
        if let Some(meta) = &previous {
            if meta.is_dir() {
                return Err(ToolError::io(
                    format!("writing {shown}"),
                    io::Error::other("target is a directory"),
                ));
            }
            match self.backup(target).await {
                Ok(dest) => report.backup = Some(dest),
                Err(e) => {
                    tracing::warn!(path = %shown, error = %e, "backup failed, writing anyway");
                    report.backup_warning = Some(format!("could not back up {shown}: {e}"));
                }
            }
        }

        atomic_write(target, bytes, previous.map(|m| m.permissions()))
            .await
            .map_err(|e| ToolError::io(format!("writing {shown}"), e))?;
        Ok(report)
    }

    /// Copy `target` to `<backup_dir>/<flattened relative path>.<timestamp>.bak`.
    async fn backup(&self, target: &Path) -> io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.backup_dir).await?;
        let relative = target.strip_prefix(&self.root).unwrap_or(target);
        let flat = relative
            .to_string_lossy()
            .trim_start_matches('/')
            .replace('/', "__");
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.6fZ");
        let dest = self.backup_dir.join(format!("{flat}.{stamp}.bak"));
        tokio::fs::copy(target, &dest).await?;
        Ok(dest)
    }
}

/// Atomic file write: write to a temp file in the same directory, then rename.
async fn atomic_write(
    path: &Path,
    bytes: &[u8],
    permissions: Option<std::fs::Permissions>,
) -> io::Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let temp_name = format!(
        ".{}.{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy(),
        uuid::Uuid::new_v4()
    );
    let temp_path = dir.join(temp_name);

    tokio::fs::write(&temp_path, bytes).await?;
    if let Some(permissions) = permissions {
        if let Err(e) = tokio::fs::set_permissions(&temp_path, permissions).await {
            tracing::debug!(error = %e, "could not carry file permissions over");
        }
    }

    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        // Clean up temp file on rename failure.
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e);
    }
    Ok(())
}

/// UTF-8 text of `bytes`, tolerating a character cut by the read cap.
fn decode_text(bytes: &[u8], truncated: bool) -> Option<&str> {
    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) if truncated && e.error_len().is_none() => {
            std::str::from_utf8(&bytes[..e.valid_up_to()]).ok()?
        }
        Err(_) => return None,
    };
    (!text.contains('\0')).then_some(text)
}

fn hex_preview(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (i, chunk) in bytes.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| {
                if b.is_ascii_graphic() || b == b' ' {
                    b as char
                } else {
                    '.'
                }
            })
            .collect();
        out.push_str(&format!("{:08x}  {:<47}  |{}|\n", i * 16, hex.join(" "), ascii));
    }
    out
}

async fn list_dir(path: &Path, shown: &str) -> Result<String, ToolError> {
    let mut entries = tokio::fs::read_dir(path)
        .await
        .map_err(|e| ToolError::io(format!("listing {shown}"), e))?;
    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ToolError::io(format!("listing {shown}"), e))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        names.push(if is_dir { format!("{name}/") } else { name });
    }
    if names.is_empty() {
        return Ok(format!("{shown}: (empty directory)"));
    }
    names.sort();
    Ok(format!(
        "{shown}: directory with {} entries\n{}",
        names.len(),
        names.join("\n")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::path_guard::{AccessMode, PathGuard};
    use crate::tools::policy::PolicyConfig;
    use tempfile::TempDir;

    fn setup(max_read_bytes: u64) -> (TempDir, PathGuard, FileStore) {
        let dir = TempDir::new().unwrap();
        let guard = PathGuard::new(dir.path(), &PolicyConfig::default()).unwrap();
        let root = guard.root().to_path_buf();
        let store = FileStore::new(&root, root.join(".toolgate/backups"), max_read_bytes);
        (dir, guard, store)
    }

    fn resolve(guard: &PathGuard, path: &str, mode: AccessMode) -> ResolvedPath {
        guard.resolve(path, mode).into_result().unwrap()
    }

    #[tokio::test]
    async fn test_write_creates_parents_and_reads_back() {
        let (_dir, guard, store) = setup(1000);
        let target = resolve(&guard, "a/b/c.txt", AccessMode::Write);
        let report = store.write(&target, "hello\n").await.unwrap();
        assert_eq!(report.bytes, 6);
        assert!(report.backup.is_none());

        let read = resolve(&guard, "a/b/c.txt", AccessMode::Read);
        assert_eq!(store.read(&read).await.unwrap(), "hello\n");
    }

    #[tokio::test]
    async fn test_overwrite_backs_up_previous_version() {
        let (_dir, guard, store) = setup(1000);
        let target = resolve(&guard, "notes.md", AccessMode::Write);
        store.write(&target, "v1").await.unwrap();
        let report = store.write(&target, "v2").await.unwrap();

        let backup = report.backup.expect("backup path");
        assert!(backup.starts_with(guard.root().join(".toolgate/backups")));
        assert_eq!(std::fs::read_to_string(backup).unwrap(), "v1");
        assert_eq!(std::fs::read_to_string(target.as_path()).unwrap(), "v2");
    }

    #[tokio::test]
    async fn test_backup_failure_does_not_block_write() {
        let dir = TempDir::new().unwrap();
        let guard = PathGuard::new(dir.path(), &PolicyConfig::default()).unwrap();
        let root = guard.root().to_path_buf();
        // A file where the backup directory should be.
        std::fs::write(root.join("blocker"), "x").unwrap();
        let store = FileStore::new(&root, root.join("blocker/backups"), 1000);

        let target = resolve(&guard, "f.txt", AccessMode::Write);
        store.write(&target, "old").await.unwrap();
        let report = store.write(&target, "new").await.unwrap();
        assert!(report.backup.is_none());
        assert!(report.backup_warning.is_some());
        assert_eq!(std::fs::read_to_string(target.as_path()).unwrap(), "new");
    }

    #[tokio::test]
    async fn test_append_reuses_write() {
        let (_dir, guard, store) = setup(1000);
        let target = resolve(&guard, "log.md", AccessMode::Write);
        let first = store.append(&target, "- one\n").await.unwrap();
        assert!(first.backup.is_none());
        let second = store.append(&target, "- two\n").await.unwrap();
        assert_eq!(second.bytes, 12);
        assert!(second.backup.is_some());
        assert_eq!(
            std::fs::read_to_string(target.as_path()).unwrap(),
            "- one\n- two\n"
        );
    }

    #[tokio::test]
    async fn test_read_truncates_at_cap() {
        let (_dir, guard, store) = setup(10);
        std::fs::write(guard.root().join("big.txt"), "0123456789abcdef").unwrap();
        let out = store
            .read(&resolve(&guard, "big.txt", AccessMode::Read))
            .await
            .unwrap();
        assert!(out.starts_with("0123456789\n"));
        assert!(out.contains("[truncated: showing the first 10 of 16 bytes]"));
    }

    #[tokio::test]
    async fn test_read_cap_inside_multibyte_char() {
        let (_dir, guard, store) = setup(2);
        std::fs::write(guard.root().join("u.txt"), "hé").unwrap();
        let out = store
            .read(&resolve(&guard, "u.txt", AccessMode::Read))
            .await
            .unwrap();
        assert!(out.starts_with("h\n"));
        assert!(out.contains("[truncated"));
    }

    #[tokio::test]
    async fn test_read_binary_hex_preview() {
        let (_dir, guard, store) = setup(1000);
        std::fs::write(guard.root().join("bin"), [0x7f, b'E', b'L', b'F', 0, 0xff]).unwrap();
        let out = store
            .read(&resolve(&guard, "bin", AccessMode::Read))
            .await
            .unwrap();
        assert!(out.starts_with("(binary file, 6 bytes"));
        assert!(out.contains("7f 45 4c 46 00 ff"));
        assert!(out.contains("|.ELF..|"));
    }

    #[tokio::test]
    async fn test_read_directory_lists_entries() {
        let (_dir, guard, store) = setup(1000);
        std::fs::create_dir(guard.root().join("src")).unwrap();
        std::fs::write(guard.root().join("b.txt"), "").unwrap();
        std::fs::write(guard.root().join("a.txt"), "").unwrap();
        let out = store
            .read(&resolve(&guard, ".", AccessMode::Read))
            .await
            .unwrap();
        assert!(out.ends_with("a.txt\nb.txt\nsrc/"));
    }

    #[tokio::test]
    async fn test_read_missing_file_is_io_error() {
        let (_dir, guard, store) = setup(1000);
        let err = store
            .read(&resolve(&guard, "missing.txt", AccessMode::Read))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Io { .. }));
        assert!(err.to_string().starts_with("reading missing.txt"));
    }

    #[tokio::test]
    async fn test_write_onto_directory_fails() {
        let (_dir, guard, store) = setup(1000);
        std::fs::create_dir(guard.root().join("out")).unwrap();
        let err = store
            .write(&resolve(&guard, "out", AccessMode::Write), "x")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("target is a directory"));
    }
}
