// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Blocking NAR serialization of a path on disk.
//!
//! The layout follows Nix exactly: every token is a string framed by its
//! little-endian `u64` length and zero-padded to eight bytes, directory
//! entries are sorted by the bytes of their names and symlinks are never
//! followed.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tracing::trace;
use walkdir::WalkDir;

use crate::engine::{EngineError, EngineResult};

pub const NAR_VERSION_MAGIC: &[u8] = b"nix-archive-1";

/// Serialize the file system object at `root` into `sink`.
pub fn dump(root: &Path, sink: &mut dyn Write) -> EngineResult<()> {
    let mut writer = NarWriter { sink };
    writer
        .token(NAR_VERSION_MAGIC)
        .map_err(|e| EngineError::io("writing archive", e))?;

    // depths of the directories whose node is still open
    let mut open_dirs: Vec<usize> = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .follow_root_links(false)
        .sort_by(|a, b| {
            a.file_name()
                .as_encoded_bytes()
                .cmp(b.file_name().as_encoded_bytes())
        });

    for entry in walker {
        let entry = entry.map_err(|e| {
            let context = match e.path() {
                Some(path) => format!("reading {}", path.display()),
                None => format!("reading {}", root.display()),
            };
            EngineError::io(context, e.into())
        })?;
        let depth = entry.depth();
        let path = entry.path();

        while let Some(&open) = open_dirs.last().filter(|&&d| d >= depth) {
            open_dirs.pop();
            writer
                .close_directory(open)
                .map_err(|e| EngineError::io("writing archive", e))?;
        }

        if depth > 0 {
            writer
                .open_entry(entry.file_name().as_encoded_bytes())
                .map_err(|e| EngineError::io("writing archive", e))?;
        }

        let file_type = entry.file_type();
        if file_type.is_dir() {
            trace!("archiving directory {}", path.display());
            writer
                .open_directory()
                .map_err(|e| EngineError::io("writing archive", e))?;
            open_dirs.push(depth);
            continue;
        }

        if file_type.is_symlink() {
            let target = std::fs::read_link(path)
                .map_err(|e| EngineError::io(format!("reading link {}", path.display()), e))?;
            writer
                .symlink(target.as_os_str().as_encoded_bytes())
                .map_err(|e| EngineError::io("writing archive", e))?;
        } else if file_type.is_file() {
            let metadata = entry
                .metadata()
                .map_err(|e| EngineError::io(format!("stat {}", path.display()), e.into()))?;
            let executable = metadata.permissions().mode() & 0o100 != 0;
            writer.regular(path, executable, metadata.len())?;
        } else {
            return Err(EngineError::Unsupported(format!(
                "file '{}' has an unsupported type",
                path.display()
            )));
        }

        if depth > 0 {
            writer
                .close_entry()
                .map_err(|e| EngineError::io("writing archive", e))?;
        }
    }

    while let Some(open) = open_dirs.pop() {
        writer
            .close_directory(open)
            .map_err(|e| EngineError::io("writing archive", e))?;
    }
    Ok(())
}

struct NarWriter<'a> {
    sink: &'a mut dyn Write,
}

impl NarWriter<'_> {
    fn token(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.sink.write_all(&(bytes.len() as u64).to_le_bytes())?;
        self.sink.write_all(bytes)?;
        self.pad(bytes.len() as u64)
    }

    fn pad(&mut self, len: u64) -> io::Result<()> {
        let padding = (8 - len % 8) % 8;
        self.sink.write_all(&[0u8; 8][..padding as usize])
    }

    fn open_entry(&mut self, name: &[u8]) -> io::Result<()> {
        self.token(b"entry")?;
        self.token(b"(")?;
        self.token(b"name")?;
        self.token(name)?;
        self.token(b"node")
    }

    fn close_entry(&mut self) -> io::Result<()> {
        self.token(b")")
    }

    fn open_directory(&mut self) -> io::Result<()> {
        self.token(b"(")?;
        self.token(b"type")?;
        self.token(b"directory")
    }

    /// Close a directory node; `depth > 0` also closes the entry holding it.
    fn close_directory(&mut self, depth: usize) -> io::Result<()> {
        self.token(b")")?;
        if depth > 0 {
            self.close_entry()?;
        }
        Ok(())
    }

    fn symlink(&mut self, target: &[u8]) -> io::Result<()> {
        self.token(b"(")?;
        self.token(b"type")?;
        self.token(b"symlink")?;
        self.token(b"target")?;
        self.token(target)?;
        self.token(b")")
    }

    fn regular(&mut self, path: &Path, executable: bool, size: u64) -> EngineResult<()> {
        let header = |w: &mut Self| -> io::Result<()> {
            w.token(b"(")?;
            w.token(b"type")?;
            w.token(b"regular")?;
            if executable {
                w.token(b"executable")?;
                w.token(b"")?;
            }
            w.token(b"contents")?;
            w.sink.write_all(&size.to_le_bytes())
        };
        header(self).map_err(|e| EngineError::io("writing archive", e))?;

        let file = File::open(path)
            .map_err(|e| EngineError::io(format!("opening {}", path.display()), e))?;
        let copied = io::copy(&mut file.take(size), &mut *self.sink)
            .map_err(|e| EngineError::io(format!("archiving {}", path.display()), e))?;
        if copied != size {
            return Err(EngineError::io(
                format!("archiving {}", path.display()),
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("file shrank from {size} to {copied} bytes while reading"),
                ),
            ));
        }

        self.pad(size)
            .and_then(|()| self.token(b")"))
            .map_err(|e| EngineError::io("writing archive", e))
    }
}
