//! On-disk identity bundle.
//!
//! Three files per device live in one directory:
//! `<id>_certificate.pem.crt`, `<id>_private.pem.key` and
//! `<id>_AmazonRootCA1.pem`. Files are written through a temporary sibling
//! and renamed into place, with mode 0600 inside a 0700 directory.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::error::AgentError;

const PEM_HEADER: &str = "-----BEGIN CERTIFICATE-----";
const PEM_FOOTER: &str = "-----END CERTIFICATE-----";
const PEM_LINE_LEN: usize = 64;

/// Decrypted certificate payload.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CertificateBundle {
    pub device_id: String,
    pub cert_arn: String,
    pub certificate_pem: String,
    pub certificate_key: String,
    #[serde(rename = "privateCA")]
    pub private_ca: String,
    pub aws_endpoint_url: String,
}

// Never print key material.
impl std::fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("device_id", &self.device_id)
            .field("cert_arn", &self.cert_arn)
            .field("aws_endpoint_url", &self.aws_endpoint_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePaths {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
    pub root_ca: PathBuf,
}

/// Outcome of [`CertificateStore::write_bundle`].
#[derive(Debug, Default)]
pub struct WriteReport {
    pub written: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, io::Error)>,
    pub skipped_ca: bool,
}

impl WriteReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && !self.skipped_ca
    }
}

#[derive(Debug, Clone)]
pub struct CertificateStore {
    dir: PathBuf,
}

impl CertificateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn paths(&self, device_id: &str) -> CertificatePaths {
        CertificatePaths {
            certificate: self.dir.join(format!("{device_id}_certificate.pem.crt")),
            private_key: self.dir.join(format!("{device_id}_private.pem.key")),
            root_ca: self.dir.join(format!("{device_id}_AmazonRootCA1.pem")),
        }
    }

    /// All three files of `device_id` are present.
    pub fn has_identity(&self, device_id: &str) -> bool {
        let paths = self.paths(device_id);
        [paths.certificate, paths.private_key, paths.root_ca]
            .iter()
            .all(|p| p.is_file())
    }

    /// Writes the bundle's files. A file that fails is logged and reported;
    /// the remaining files are still written. Only failing to create the
    /// directory is an error.
    pub fn write_bundle(&self, bundle: &CertificateBundle) -> Result<WriteReport, AgentError> {
        self.ensure_dir()?;

        let paths = self.paths(&bundle.device_id);
        let mut report = WriteReport::default();

        let mut files = vec![
            (paths.certificate, bundle.certificate_pem.clone()),
            (paths.private_key, bundle.certificate_key.clone()),
        ];
        if bundle.private_ca.trim().is_empty() {
            warn!(device_id = %bundle.device_id, "Bundle carries no private CA, skipping CA file");
            report.skipped_ca = true;
        } else {
            files.push((paths.root_ca, format_pem(&bundle.private_ca)));
        }

        for (path, contents) in files {
            match write_private(&path, contents.as_bytes()) {
                Ok(()) => {
                    debug!(path = %path.display(), "Wrote identity file");
                    report.written.push(path);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to write identity file");
                    report.failed.push((path, e));
                }
            }
        }

        info!(
            dir = %self.dir.display(),
            written = report.written.len(),
            failed = report.failed.len(),
            "Identity bundle stored"
        );
        Ok(report)
    }

    /// Removes every regular file in the directory. A missing directory is
    /// a no-op.
    pub fn remove_all(&self) -> Result<(), AgentError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(AgentError::file_system(&self.dir, e)),
        };

        let mut removed = 0usize;
        for entry in entries {
            let entry = entry.map_err(|e| AgentError::file_system(&self.dir, e))?;
            let path = entry.path();
            if !entry.file_type().is_ok_and(|t| t.is_file()) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove identity file"),
            }
        }
        info!(dir = %self.dir.display(), removed, "Purged identity files");
        Ok(())
    }

    fn ensure_dir(&self) -> Result<(), AgentError> {
        let fail = |source: io::Error| AgentError::IdentityDirectory {
            path: self.dir.clone(),
            source,
        };

        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder.create(&self.dir).map_err(fail)?;

        // an existing directory keeps its mode otherwise
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700)).map_err(fail)?;
        }
        Ok(())
    }
}

/// Writes through a temporary sibling, syncs, then renames into place.
fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp_path = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

    let result = (|| {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp_path)?;
        file.write_all(contents)?;
        file.flush()?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

/// Canonical PEM: header, base64 body wrapped at 64 columns, footer.
///
/// Existing markers and all whitespace are dropped first, so the function
/// is idempotent and accepts a single unwrapped line.
pub fn format_pem(pem: &str) -> String {
    let body: String = pem
        .replace(PEM_HEADER, "")
        .replace(PEM_FOOTER, "")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    let mut out = String::with_capacity(body.len() + body.len() / PEM_LINE_LEN + 64);
    out.push_str(PEM_HEADER);
    out.push('\n');
    // base64 is ASCII, so byte chunks are char boundaries
    for line in body.as_bytes().chunks(PEM_LINE_LEN) {
        out.push_str(&String::from_utf8_lossy(line));
        out.push('\n');
    }
    out.push_str(PEM_FOOTER);
    out.push('\n');
    out
}
