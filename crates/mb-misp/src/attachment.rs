//! Remote attachment handling.
//!
//! Downloads attribute payloads into the temp store and unwraps MISP
//! malware samples, which arrive as password-protected ZIP archives
//! containing a `*.filename.txt` metadata entry next to the sample bytes.
//! Archive failures degrade to the original download instead of failing the
//! observable.

use crate::client::MispApi;
use crate::error::{SyncError, SyncResult};
use mb_core::{ArtifactDescriptor, ArtifactValue, AttachmentHandle, TempStore};
use regex::Regex;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::warn;

/// Password every MISP instance uses for malware-sample archives.
const SAMPLE_PASSWORD: &[u8] = b"infected";
const DEFAULT_FILENAME: &str = "noname";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

fn filename_regex() -> &'static Regex {
    static INSTANCE: OnceLock<Regex> = OnceLock::new();
    INSTANCE.get_or_init(|| Regex::new(r#"attachment;\s*filename="(.*)""#).unwrap())
}

/// Downloads and unwraps remote attachments.
#[derive(Clone)]
pub struct AttachmentHandler {
    temp: Arc<TempStore>,
}

impl AttachmentHandler {
    pub fn new(temp: Arc<TempStore>) -> Self {
        Self { temp }
    }

    /// Fetches `attributes/download/{id}` into a temp file. The filename
    /// comes from `Content-Disposition`, the MIME type from `Content-Type`;
    /// both have defaults when the server omits them.
    pub async fn download(
        &self,
        api: &dyn MispApi,
        attachment_id: &str,
    ) -> SyncResult<AttachmentHandle> {
        let raw = api.download_attribute(attachment_id).await?;
        let name = raw
            .content_disposition
            .as_deref()
            .and_then(filename_from_disposition)
            .unwrap_or_else(|| DEFAULT_FILENAME.to_string());
        let content_type = raw
            .content_type
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        Ok(AttachmentHandle {
            name,
            content_type,
            path: raw.path,
        })
    }

    /// Unwraps a malware-sample archive: the `*.filename.txt` entry names
    /// the sample, the other entry is the sample itself. On any archive
    /// problem the original download is returned unchanged.
    pub async fn extract_malware_sample(&self, handle: AttachmentHandle) -> AttachmentHandle {
        let destination = match self.temp.new_temporary_file("misp-sample", &handle.name) {
            Ok(path) => path,
            Err(err) => {
                warn!(%err, "could not allocate temp file, keeping archive as-is");
                return handle;
            }
        };

        let source = handle.path.clone();
        let extraction = tokio::task::spawn_blocking({
            let destination = destination.clone();
            move || extract_sample(&source, &destination)
        })
        .await;

        match extraction {
            Ok(Ok(filename)) => AttachmentHandle {
                name: filename,
                content_type: DEFAULT_CONTENT_TYPE.to_string(),
                path: destination,
            },
            Ok(Err(err)) => {
                warn!(%err, file = %handle.name, "sample archive unreadable, keeping original");
                handle
            }
            Err(err) => {
                warn!(%err, "sample extraction task failed, keeping original");
                handle
            }
        }
    }

    /// Resolves a remote-attachment descriptor into a local file, unwrapping
    /// malware samples. Non-remote descriptors pass through unchanged.
    pub async fn materialize(
        &self,
        api: &dyn MispApi,
        descriptor: &ArtifactDescriptor,
    ) -> SyncResult<ArtifactDescriptor> {
        let ArtifactValue::Remote {
            filename,
            reference,
            attachment_type,
        } = &descriptor.value
        else {
            return Ok(descriptor.clone());
        };

        let mut handle = self.download(api, reference).await?;
        if attachment_type == "malware-sample" {
            handle = self.extract_malware_sample(handle).await;
        }
        if handle.name == DEFAULT_FILENAME && !filename.is_empty() {
            handle.name = filename.clone();
        }

        let mut materialized = descriptor.clone();
        materialized.value = ArtifactValue::File { handle };
        Ok(materialized)
    }
}

fn filename_from_disposition(disposition: &str) -> Option<String> {
    filename_regex()
        .captures(disposition)
        .map(|captures| captures[1].to_string())
}

/// Blocking ZIP work: locate the metadata and content entries, read the
/// true filename from the first 128 bytes of the metadata entry, extract the
/// content entry to `destination`.
fn extract_sample(source: &Path, destination: &Path) -> SyncResult<String> {
    let file = std::fs::File::open(source).map_err(|e| SyncError::Archive(e.to_string()))?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| SyncError::Archive(e.to_string()))?;

    let names: Vec<String> = archive.file_names().map(String::from).collect();
    let metadata_index = names
        .iter()
        .position(|n| n.ends_with(".filename.txt"))
        .ok_or_else(|| SyncError::Archive("no filename metadata entry".to_string()))?;
    let content_index = names
        .iter()
        .position(|n| !n.ends_with(".filename.txt"))
        .ok_or_else(|| SyncError::Archive("no content entry".to_string()))?;

    let filename = {
        let mut entry = open_entry(&mut archive, metadata_index)?;
        let mut head = Vec::with_capacity(128);
        (&mut entry)
            .take(128)
            .read_to_end(&mut head)
            .map_err(|e| SyncError::Archive(e.to_string()))?;
        String::from_utf8_lossy(&head)
            .trim_matches(|c: char| c == '\0' || c.is_whitespace())
            .to_string()
    };
    if filename.is_empty() {
        return Err(SyncError::Archive("empty filename metadata".to_string()));
    }

    let mut output =
        std::fs::File::create(destination).map_err(|e| SyncError::Archive(e.to_string()))?;
    let mut entry = open_entry(&mut archive, content_index)?;
    std::io::copy(&mut entry, &mut output).map_err(|e| SyncError::Archive(e.to_string()))?;

    Ok(filename)
}

/// Opens a ZIP entry, retrying with the standard sample password when the
/// archive is encrypted.
fn open_entry(
    archive: &mut zip::ZipArchive<std::fs::File>,
    index: usize,
) -> SyncResult<impl Read + '_> {
    let encrypted = archive.by_index(index).is_err();
    if encrypted {
        archive
            .by_index_decrypt(index, SAMPLE_PASSWORD)
            .map_err(|e| SyncError::Archive(e.to_string()))
    } else {
        archive
            .by_index(index)
            .map_err(|e| SyncError::Archive(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::unstable::write::FileOptionsExt;
    use zip::write::SimpleFileOptions;

    fn encrypted_sample_zip(metadata_name: &str, filename: &str, content: &[u8]) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Stored)
                .with_deprecated_encryption(SAMPLE_PASSWORD);
            writer.start_file(metadata_name, options).unwrap();
            writer.write_all(filename.as_bytes()).unwrap();
            writer.start_file("sample", options).unwrap();
            writer.write_all(content).unwrap();
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    fn handle_for(bytes: &[u8], temp: &TempStore) -> AttachmentHandle {
        let path = temp.new_temporary_file("test", "archive.zip").unwrap();
        std::fs::write(&path, bytes).unwrap();
        AttachmentHandle {
            name: "archive.zip".to_string(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            path,
        }
    }

    #[test]
    fn filename_is_parsed_from_content_disposition() {
        assert_eq!(
            filename_from_disposition(r#"attachment; filename="orig.exe""#).as_deref(),
            Some("orig.exe")
        );
        assert_eq!(filename_from_disposition("inline"), None);
    }

    #[tokio::test]
    async fn encrypted_sample_is_unwrapped() {
        let temp = Arc::new(TempStore::new().unwrap());
        let handler = AttachmentHandler::new(Arc::clone(&temp));

        let bytes = encrypted_sample_zip("sample.filename.txt", "evil.exe", b"MZ-payload");
        let handle = handle_for(&bytes, &temp);

        let extracted = handler.extract_malware_sample(handle).await;
        assert_eq!(extracted.name, "evil.exe");
        assert_eq!(extracted.content_type, DEFAULT_CONTENT_TYPE);
        assert_eq!(std::fs::read(&extracted.path).unwrap(), b"MZ-payload");
    }

    #[tokio::test]
    async fn unreadable_archive_degrades_to_original() {
        let temp = Arc::new(TempStore::new().unwrap());
        let handler = AttachmentHandler::new(Arc::clone(&temp));

        let handle = handle_for(b"this is not a zip archive", &temp);
        let original_path = handle.path.clone();

        let result = handler.extract_malware_sample(handle).await;
        assert_eq!(result.name, "archive.zip");
        assert_eq!(result.path, original_path);
    }

    #[tokio::test]
    async fn archive_without_metadata_degrades_to_original() {
        let temp = Arc::new(TempStore::new().unwrap());
        let handler = AttachmentHandler::new(Arc::clone(&temp));

        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Stored);
            writer.start_file("content-only", options).unwrap();
            writer.write_all(b"bytes").unwrap();
            writer.finish().unwrap();
        }
        let handle = handle_for(&cursor.into_inner(), &temp);

        let result = handler.extract_malware_sample(handle).await;
        assert_eq!(result.name, "archive.zip");
    }

    #[test]
    fn metadata_filename_is_limited_to_128_bytes() {
        let temp = TempStore::new().unwrap();
        let long_name = "a".repeat(300);
        let bytes = encrypted_sample_zip("x.filename.txt", &long_name, b"payload");
        let source = temp.new_temporary_file("test", "long.zip").unwrap();
        std::fs::write(&source, bytes).unwrap();
        let destination = temp.new_temporary_file("test", "out").unwrap();

        let filename = extract_sample(&source, &destination).unwrap();
        assert_eq!(filename.len(), 128);
    }
}
