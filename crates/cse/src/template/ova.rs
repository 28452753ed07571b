//! OVA archives and their upload into a catalog.
//!
//! An OVA is a tar archive holding one `.ovf` descriptor and the files it
//! references. vCD takes the descriptor first, then hands out an upload
//! link for each referenced file.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use serde_json::json;
use sha2::Digest;
use sha2::Sha256;
use tracing::debug;
use tracing::info;
use vcd_client::VcdClient;

use super::catalog::Catalog;
use super::catalog::CatalogItem;
use super::error::TemplateError;
use super::error::TemplateResult;

const FILE_LINK_POLL_INTERVAL: Duration = Duration::from_secs(2);
const FILE_LINK_ATTEMPTS: u32 = 60;
const UPLOAD_REL: &str = "upload:default";

/// One regular file of the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OvaEntry {
    pub name: String,
    pub size: u64,
}

/// Index of an OVA on disk.
#[derive(Debug, Clone)]
pub struct OvaFile {
    path: PathBuf,
    descriptor: String,
    entries: Vec<OvaEntry>,
}

impl OvaFile {
    /// Reads the archive index. Fails when there is no `.ovf` descriptor.
    pub fn open(path: &Path) -> TemplateResult<Self> {
        let io_error = || TemplateError::Io {
            path: path.display().to_string(),
        };
        let file = File::open(path).change_context_lazy(io_error)?;
        let mut archive = tar::Archive::new(file);
        let mut entries = Vec::new();
        for entry in archive.entries().change_context_lazy(io_error)? {
            let entry = entry.change_context_lazy(io_error)?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = entry
                .path()
                .change_context_lazy(io_error)?
                .to_string_lossy()
                .into_owned();
            entries.push(OvaEntry {
                name,
                size: entry.header().size().change_context_lazy(io_error)?,
            });
        }

        let descriptor = entries
            .iter()
            .find(|e| e.name.ends_with(".ovf"))
            .map(|e| e.name.clone())
            .ok_or_else(|| {
                Report::new(TemplateError::InvalidOva {
                    path: path.display().to_string(),
                    reason: "no .ovf descriptor".to_string(),
                })
            })?;
        debug!(path = %path.display(), files = entries.len(), "Opened OVA");
        Ok(Self {
            path: path.to_path_buf(),
            descriptor,
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn descriptor_name(&self) -> &str {
        &self.descriptor
    }

    pub fn entries(&self) -> &[OvaEntry] {
        &self.entries
    }

    /// Reads one archived file into memory.
    pub fn read_entry(&self, name: &str) -> TemplateResult<Vec<u8>> {
        let io_error = || TemplateError::Io {
            path: format!("{}:{name}", self.path.display()),
        };
        let file = File::open(&self.path).change_context_lazy(io_error)?;
        let mut archive = tar::Archive::new(file);
        for entry in archive.entries().change_context_lazy(io_error)? {
            let mut entry = entry.change_context_lazy(io_error)?;
            if entry.path().change_context_lazy(io_error)?.to_string_lossy() == name {
                let mut bytes = Vec::new();
                entry.read_to_end(&mut bytes).change_context_lazy(io_error)?;
                return Ok(bytes);
            }
        }
        Err(Report::new(TemplateError::InvalidOva {
            path: self.path.display().to_string(),
            reason: format!("no entry named {name}"),
        }))
    }
}

/// Hex encoded SHA-256 of a file.
pub fn sha256_file(path: &Path) -> TemplateResult<String> {
    let io_error = || TemplateError::Io {
        path: path.display().to_string(),
    };
    let mut file = File::open(path).change_context_lazy(io_error)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 16];
    loop {
        let n = file.read(&mut buf).change_context_lazy(io_error)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// No-op when `expected` is empty.
pub fn verify_checksum(path: &Path, expected: &str) -> TemplateResult<()> {
    if expected.is_empty() {
        return Ok(());
    }
    let actual = sha256_file(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(Report::new(TemplateError::Checksum {
            name: path.display().to_string(),
            expected: expected.to_string(),
            actual,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct Link {
    #[serde(default)]
    rel: String,
    href: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransferFile {
    name: String,
    #[serde(default)]
    bytes_transferred: i64,
    #[serde(default)]
    link: Vec<Link>,
}

impl TransferFile {
    fn upload_href(&self) -> Option<&str> {
        self.link
            .iter()
            .find(|l| l.rel == UPLOAD_REL)
            .map(|l| l.href.as_str())
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileList {
    #[serde(default)]
    file: Vec<TransferFile>,
}

#[derive(Debug, Deserialize)]
struct UploadTask {
    href: String,
}

#[derive(Debug, Default, Deserialize)]
struct UploadTasks {
    #[serde(default)]
    task: Vec<UploadTask>,
}

#[derive(Debug, Deserialize)]
struct TransferTemplate {
    #[serde(default)]
    files: Option<FileList>,
    #[serde(default)]
    tasks: Option<UploadTasks>,
}

impl TransferTemplate {
    fn pending_files(&self) -> impl Iterator<Item = &TransferFile> {
        self.files
            .iter()
            .flat_map(|f| f.file.iter())
            .filter(|f| f.bytes_transferred == 0 && f.upload_href().is_some())
    }
}

async fn read_entry_blocking(ova: &OvaFile, name: &str) -> TemplateResult<Vec<u8>> {
    let ova = ova.clone();
    let name = name.to_string();
    tokio::task::spawn_blocking(move || ova.read_entry(&name))
        .await
        .change_context(TemplateError::Io {
            path: "OVA reader task".to_string(),
        })?
}

/// Uploads `ova` as catalog item `item_name` and waits until vCD has
/// imported it. Returns the new catalog item.
pub async fn upload_ova(
    catalog: &Catalog,
    ova: &OvaFile,
    item_name: &str,
    description: &str,
) -> TemplateResult<CatalogItem> {
    let client = catalog.client();
    let item: CatalogItem = client
        .post_json(
            &format!("{}/action/upload", catalog.href()),
            &json!({"name": item_name, "description": description}),
        )
        .await
        .change_context(TemplateError::vcd(format!("start upload of {item_name}")))?;
    let template_href = item
        .entity
        .as_ref()
        .map(|e| e.href.clone())
        .ok_or_else(|| Report::new(TemplateError::vcd("upload answered without a vApp template")))?;

    let template = get_template(client, &template_href).await?;
    let descriptor_href = template
        .pending_files()
        .find(|f| f.name.ends_with(".ovf"))
        .and_then(TransferFile::upload_href)
        .map(str::to_string)
        .ok_or_else(|| Report::new(TemplateError::vcd("no upload link for the OVF descriptor")))?;
    let descriptor = read_entry_blocking(ova, ova.descriptor_name()).await?;
    client
        .put_bytes(&descriptor_href, descriptor)
        .await
        .change_context(TemplateError::vcd("upload OVF descriptor"))?;

    // vCD parses the descriptor before it lists the referenced files.
    let mut attempts = 0;
    let template = loop {
        let template = get_template(client, &template_href).await?;
        if template.pending_files().next().is_some() || attempts >= FILE_LINK_ATTEMPTS {
            break template;
        }
        attempts += 1;
        tokio::time::sleep(FILE_LINK_POLL_INTERVAL).await;
    };

    for file in template.pending_files() {
        let Some(href) = file.upload_href() else {
            continue;
        };
        let entry = ova
            .entries()
            .iter()
            .find(|e| e.name == file.name || e.name.ends_with(&format!("/{}", file.name)))
            .ok_or_else(|| {
                Report::new(TemplateError::InvalidOva {
                    path: ova.path().display().to_string(),
                    reason: format!("descriptor references missing file {}", file.name),
                })
            })?;
        let bytes = read_entry_blocking(ova, &entry.name).await?;
        client
            .put_bytes(href, bytes)
            .await
            .change_context(TemplateError::vcd(format!("upload {}", file.name)))?;
        debug!(file = %file.name, size = entry.size, "Uploaded OVA file");
    }

    if let Some(task) = template.tasks.as_ref().and_then(|t| t.task.first()) {
        client
            .wait_for_success(&task.href)
            .await
            .change_context(TemplateError::vcd(format!("import {item_name}")))?;
    }
    info!(catalog = catalog.name(), item = item_name, "Uploaded OVA");
    Ok(item)
}

async fn get_template(client: &VcdClient, href: &str) -> TemplateResult<TransferTemplate> {
    client
        .get_json(href)
        .await
        .change_context(TemplateError::vcd("read uploading vApp template"))
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn write_ova(dir: &Path, files: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.join("test.ova");
        let file = File::create(&path).expect("create");
        let mut builder = tar::Builder::new(file);
        for (name, content) in files {
            let mut header = tar::Header::new_ustar();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, *content)
                .expect("append");
        }
        builder.finish().expect("finish");
        path
    }

    #[test]
    fn archive_index_and_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_ova(
            dir.path(),
            &[("photon.ovf", b"<Envelope/>"), ("photon-disk1.vmdk", b"disk")],
        );
        let ova = OvaFile::open(&path).expect("open");
        assert_eq!(ova.descriptor_name(), "photon.ovf");
        assert_eq!(
            ova.entries(),
            &[
                OvaEntry {
                    name: "photon.ovf".into(),
                    size: 11
                },
                OvaEntry {
                    name: "photon-disk1.vmdk".into(),
                    size: 4
                },
            ]
        );
        assert_eq!(ova.read_entry("photon-disk1.vmdk").expect("read"), b"disk");
        assert!(ova.read_entry("missing").is_err());
    }

    #[test]
    fn archive_without_descriptor_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_ova(dir.path(), &[("disk.vmdk", b"disk")]);
        let err = OvaFile::open(&path).expect_err("no descriptor");
        assert!(matches!(err.current_context(), TemplateError::InvalidOva { .. }));
    }

    #[test]
    fn checksum_is_verified() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("f");
        std::fs::write(&path, b"abc").expect("write");
        let digest = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        assert_eq!(sha256_file(&path).expect("hash"), digest);
        verify_checksum(&path, digest).expect("match");
        verify_checksum(&path, "").expect("skipped");
        let err = verify_checksum(&path, "00").expect_err("mismatch");
        assert!(matches!(err.current_context(), TemplateError::Checksum { .. }));
    }
}
