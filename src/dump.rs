//! Output file created on first write, so an existing dump is only replaced
//! once the device is actually being read.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct LazyFile {
    path: PathBuf,
    file: Option<File>,
}

impl LazyFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self { path: path.as_ref().to_owned(), file: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file has been created (and truncated)
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn file(&mut self) -> io::Result<&mut File> {
        let file = match self.file.take() {
            Some(f) => f,
            None => {
                debug!("Creating {}", self.path.display());
                File::create(&self.path)?
            }
        };

        Ok(self.file.insert(file))
    }
}

impl Write for LazyFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.file()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.file {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("zigate-uart-loader-{}-{}", std::process::id(), name))
    }

    #[test]
    fn existing_file_kept_until_written() {
        let path = temp_path("kept");
        fs::write(&path, b"previous dump").unwrap();

        {
            let mut f = LazyFile::new(&path);
            f.write_all(&[]).unwrap();
            f.flush().unwrap();
            assert!(!f.is_open());
        }

        assert_eq!(fs::read(&path).unwrap(), b"previous dump");
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn first_write_replaces_file() {
        let path = temp_path("replaced");
        fs::write(&path, b"previous dump").unwrap();

        {
            let mut f = LazyFile::new(&path);
            f.write_all(&[0x07, 0x03]).unwrap();
            f.write_all(&[0x00, 0x08]).unwrap();
            f.flush().unwrap();
            assert!(f.is_open());
        }

        assert_eq!(fs::read(&path).unwrap(), vec![0x07, 0x03, 0x00, 0x08]);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_file_not_created_without_writes() {
        let path = temp_path("missing");
        let _ = fs::remove_file(&path);

        let mut f = LazyFile::new(&path);
        f.flush().unwrap();
        drop(f);

        assert!(!path.exists());
    }
}
