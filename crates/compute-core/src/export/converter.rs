//! Disk image converters. Each shells out to `qemu-img`; the OVA converter
//! also writes an OVF descriptor and packs both into a tar archive.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::ovf::OvfDescriptor;
use super::{ExportError, ExportFormat, Result};

pub type ExportOptions = HashMap<String, String>;

const QEMU_IMG: &str = "qemu-img";

pub const VMDK_ADAPTERS: [&str; 4] = ["ide", "buslogic", "lsilogic", "legacyESX"];
pub const VMDK_SUBFORMATS: [&str; 4] = [
    "monolithicSparse",
    "monolithicFlat",
    "twoGbMaxExtent",
    "streamOptimized",
];
const DEFAULT_COMPRESSION: u8 = 1;

#[async_trait]
pub trait Converter: Send + Sync {
    fn format_name(&self) -> &'static str;

    /// Reject bad options before a job is queued.
    fn validate_options(&self, options: &ExportOptions) -> Result<()>;

    /// Write `dest` from `source`. Must return [`ExportError::Canceled`]
    /// promptly once `cancel` fires.
    async fn convert(
        &self,
        source: &Path,
        dest: &Path,
        options: &ExportOptions,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// The stock converter for every supported format.
pub fn default_converters(temp_dir: Option<PathBuf>) -> HashMap<ExportFormat, Arc<dyn Converter>> {
    let mut converters: HashMap<ExportFormat, Arc<dyn Converter>> = HashMap::new();
    converters.insert(ExportFormat::Qcow2, Arc::new(Qcow2Converter));
    converters.insert(ExportFormat::Vmdk, Arc::new(VmdkConverter));
    converters.insert(ExportFormat::Vdi, Arc::new(VdiConverter));
    converters.insert(ExportFormat::Raw, Arc::new(RawConverter));
    converters.insert(ExportFormat::Ova, Arc::new(OvaConverter { temp_dir }));
    converters
}

fn option<'a>(options: &'a ExportOptions, key: &str) -> Option<&'a str> {
    options.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

fn source_format(options: &ExportOptions) -> &str {
    option(options, "source_format").unwrap_or("qcow2")
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Run a tool to completion; the child is killed when `cancel` fires.
async fn run_tool(program: &str, args: &[String], cancel: &CancellationToken) -> Result<()> {
    debug!(program, ?args, "Running conversion tool");
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ExportError::Tool {
            tool: program.to_string(),
            message: e.to_string(),
        })?;

    tokio::select! {
        _ = cancel.cancelled() => Err(ExportError::Canceled),
        output = child.wait_with_output() => {
            let output = output?;
            if output.status.success() {
                Ok(())
            } else {
                Err(ExportError::Tool {
                    tool: program.to_string(),
                    message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                })
            }
        }
    }
}

pub struct Qcow2Converter;

impl Qcow2Converter {
    fn compression(options: &ExportOptions) -> Result<u8> {
        match option(options, "compression") {
            None => Ok(DEFAULT_COMPRESSION),
            Some(v) => v
                .parse::<u8>()
                .ok()
                .filter(|level| *level <= 9)
                .ok_or_else(|| {
                    ExportError::InvalidOptions(format!("invalid compression level: {v}"))
                }),
        }
    }

    pub fn args(source: &Path, dest: &Path, options: &ExportOptions) -> Result<Vec<String>> {
        let mut args = vec![
            "convert".to_string(),
            "-f".to_string(),
            source_format(options).to_string(),
            "-O".to_string(),
            "qcow2".to_string(),
        ];
        if Self::compression(options)? > 0 {
            args.push("-c".to_string());
        }
        args.push(path_arg(source));
        args.push(path_arg(dest));
        Ok(args)
    }
}

#[async_trait]
impl Converter for Qcow2Converter {
    fn format_name(&self) -> &'static str {
        "qcow2"
    }

    fn validate_options(&self, options: &ExportOptions) -> Result<()> {
        Self::compression(options).map(|_| ())
    }

    async fn convert(
        &self,
        source: &Path,
        dest: &Path,
        options: &ExportOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        run_tool(QEMU_IMG, &Self::args(source, dest, options)?, cancel).await
    }
}

pub struct VmdkConverter;

impl VmdkConverter {
    fn settings(options: &ExportOptions) -> Result<(&str, &str)> {
        let adapter = option(options, "adapter_type").unwrap_or("lsilogic");
        if !VMDK_ADAPTERS.contains(&adapter) {
            return Err(ExportError::InvalidOptions(format!(
                "invalid adapter type: {adapter}"
            )));
        }
        let subformat = option(options, "disk_type").unwrap_or("monolithicSparse");
        if !VMDK_SUBFORMATS.contains(&subformat) {
            return Err(ExportError::InvalidOptions(format!(
                "invalid disk type: {subformat}"
            )));
        }
        Ok((adapter, subformat))
    }

    pub fn args(source: &Path, dest: &Path, options: &ExportOptions) -> Result<Vec<String>> {
        let (adapter, subformat) = Self::settings(options)?;
        Ok(vec![
            "convert".to_string(),
            "-f".to_string(),
            source_format(options).to_string(),
            "-O".to_string(),
            "vmdk".to_string(),
            "-o".to_string(),
            format!("adapter_type={adapter},subformat={subformat}"),
            path_arg(source),
            path_arg(dest),
        ])
    }
}

#[async_trait]
impl Converter for VmdkConverter {
    fn format_name(&self) -> &'static str {
        "vmdk"
    }

    fn validate_options(&self, options: &ExportOptions) -> Result<()> {
        Self::settings(options).map(|_| ())
    }

    async fn convert(
        &self,
        source: &Path,
        dest: &Path,
        options: &ExportOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        run_tool(QEMU_IMG, &Self::args(source, dest, options)?, cancel).await
    }
}

pub struct VdiConverter;

impl VdiConverter {
    fn is_static(options: &ExportOptions) -> Result<bool> {
        match option(options, "static") {
            None | Some("false") | Some("0") => Ok(false),
            Some("true") | Some("1") => Ok(true),
            Some(other) => Err(ExportError::InvalidOptions(format!(
                "invalid static option: {other}"
            ))),
        }
    }

    pub fn args(source: &Path, dest: &Path, options: &ExportOptions) -> Result<Vec<String>> {
        let mut args = vec![
            "convert".to_string(),
            "-f".to_string(),
            source_format(options).to_string(),
            "-O".to_string(),
            "vdi".to_string(),
        ];
        if Self::is_static(options)? {
            args.push("-o".to_string());
            args.push("preallocation=metadata".to_string());
        }
        args.push(path_arg(source));
        args.push(path_arg(dest));
        Ok(args)
    }
}

#[async_trait]
impl Converter for VdiConverter {
    fn format_name(&self) -> &'static str {
        "vdi"
    }

    fn validate_options(&self, options: &ExportOptions) -> Result<()> {
        Self::is_static(options).map(|_| ())
    }

    async fn convert(
        &self,
        source: &Path,
        dest: &Path,
        options: &ExportOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        run_tool(QEMU_IMG, &Self::args(source, dest, options)?, cancel).await
    }
}

pub struct RawConverter;

impl RawConverter {
    pub fn args(source: &Path, dest: &Path, options: &ExportOptions) -> Vec<String> {
        vec![
            "convert".to_string(),
            "-f".to_string(),
            source_format(options).to_string(),
            "-O".to_string(),
            "raw".to_string(),
            path_arg(source),
            path_arg(dest),
        ]
    }
}

#[async_trait]
impl Converter for RawConverter {
    fn format_name(&self) -> &'static str {
        "raw"
    }

    fn validate_options(&self, _options: &ExportOptions) -> Result<()> {
        Ok(())
    }

    async fn convert(
        &self,
        source: &Path,
        dest: &Path,
        options: &ExportOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        run_tool(QEMU_IMG, &Self::args(source, dest, options), cancel).await
    }
}

/// Stream-optimised VMDK plus OVF descriptor, packed into a tar archive with
/// the descriptor first.
pub struct OvaConverter {
    pub temp_dir: Option<PathBuf>,
}

const OVA_DISK: &str = "disk.vmdk";
const OVA_DESCRIPTOR: &str = "vm.ovf";

impl OvaConverter {
    /// Pack the staged descriptor and disk into `dest`, descriptor first.
    pub fn pack(staging: &Path, dest: &Path) -> std::io::Result<()> {
        let file = std::fs::File::create(dest)?;
        let mut archive = tar::Builder::new(file);
        archive.append_path_with_name(staging.join(OVA_DESCRIPTOR), OVA_DESCRIPTOR)?;
        archive.append_path_with_name(staging.join(OVA_DISK), OVA_DISK)?;
        archive.into_inner()?.sync_all()
    }
}

#[async_trait]
impl Converter for OvaConverter {
    fn format_name(&self) -> &'static str {
        "ova"
    }

    fn validate_options(&self, options: &ExportOptions) -> Result<()> {
        if option(options, "vm_name").is_none() {
            return Err(ExportError::InvalidOptions(
                "vm_name is required for OVA export".to_string(),
            ));
        }
        Ok(())
    }

    async fn convert(
        &self,
        source: &Path,
        dest: &Path,
        options: &ExportOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("ova-export-");
        let staging = match &self.temp_dir {
            Some(dir) => builder.tempdir_in(dir)?,
            None => builder.tempdir()?,
        };

        let disk = staging.path().join(OVA_DISK);
        let mut vmdk_options = options.clone();
        vmdk_options.insert("adapter_type".to_string(), "lsilogic".to_string());
        vmdk_options.insert("disk_type".to_string(), "streamOptimized".to_string());
        run_tool(
            QEMU_IMG,
            &VmdkConverter::args(source, &disk, &vmdk_options)?,
            cancel,
        )
        .await?;

        let size = tokio::fs::metadata(&disk).await?.len();
        let descriptor = OvfDescriptor::from_options(options, OVA_DISK, size);
        tokio::fs::write(staging.path().join(OVA_DESCRIPTOR), descriptor.render()).await?;

        if cancel.is_cancelled() {
            return Err(ExportError::Canceled);
        }
        let staging_path = staging.path().to_path_buf();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || Self::pack(&staging_path, &dest))
            .await
            .map_err(|e| ExportError::Tool {
                tool: "tar".to_string(),
                message: e.to_string(),
            })??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(pairs: &[(&str, &str)]) -> ExportOptions {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_qcow2_compression() {
        let src = Path::new("/img/vm.qcow2");
        let dst = Path::new("/out/vm.qcow2");
        let args = Qcow2Converter::args(src, dst, &ExportOptions::new()).unwrap();
        assert_eq!(
            args,
            vec!["convert", "-f", "qcow2", "-O", "qcow2", "-c", "/img/vm.qcow2", "/out/vm.qcow2"]
        );

        let args = Qcow2Converter::args(src, dst, &opts(&[("compression", "0")])).unwrap();
        assert!(!args.contains(&"-c".to_string()));

        let err = Qcow2Converter.validate_options(&opts(&[("compression", "10")]));
        assert!(matches!(err, Err(ExportError::InvalidOptions(m)) if m.contains("invalid compression level")));
        assert!(Qcow2Converter.validate_options(&opts(&[("compression", "x")])).is_err());
    }

    #[test]
    fn test_vmdk_options() {
        let args = VmdkConverter::args(
            Path::new("/a"),
            Path::new("/b"),
            &opts(&[("source_format", "raw")]),
        )
        .unwrap();
        assert_eq!(args[2], "raw");
        assert!(args.contains(&"adapter_type=lsilogic,subformat=monolithicSparse".to_string()));

        let custom = opts(&[("adapter_type", "ide"), ("disk_type", "streamOptimized")]);
        let args = VmdkConverter::args(Path::new("/a"), Path::new("/b"), &custom).unwrap();
        assert!(args.contains(&"adapter_type=ide,subformat=streamOptimized".to_string()));

        assert!(VmdkConverter
            .validate_options(&opts(&[("adapter_type", "virtio")]))
            .is_err());
        assert!(VmdkConverter
            .validate_options(&opts(&[("disk_type", "sparse")]))
            .is_err());
    }

    #[test]
    fn test_vdi_static() {
        let args = VdiConverter::args(Path::new("/a"), Path::new("/b"), &opts(&[("static", "1")])).unwrap();
        assert!(args.contains(&"preallocation=metadata".to_string()));
        let args = VdiConverter::args(Path::new("/a"), Path::new("/b"), &opts(&[("static", "false")])).unwrap();
        assert!(!args.contains(&"-o".to_string()));
        assert!(VdiConverter.validate_options(&opts(&[("static", "yes")])).is_err());
    }

    #[test]
    fn test_ova_requires_vm_name_and_packs_descriptor_first() {
        assert!(OvaConverter { temp_dir: None }
            .validate_options(&ExportOptions::new())
            .is_err());
        assert!(OvaConverter { temp_dir: None }
            .validate_options(&opts(&[("vm_name", "web")]))
            .is_ok());

        let staging = tempfile::tempdir().unwrap();
        std::fs::write(staging.path().join(OVA_DESCRIPTOR), "<Envelope/>").unwrap();
        std::fs::write(staging.path().join(OVA_DISK), vec![7u8; 2048]).unwrap();
        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("web.ova");
        OvaConverter::pack(staging.path(), &dest).unwrap();

        let mut archive = tar::Archive::new(std::fs::File::open(&dest).unwrap());
        let entries: Vec<(String, u64)> = archive
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (e.path().unwrap().to_string_lossy().into_owned(), e.size())
            })
            .collect();
        assert_eq!(
            entries,
            vec![("vm.ovf".to_string(), 11), ("disk.vmdk".to_string(), 2048)]
        );
    }

    #[test]
    fn test_default_converters_cover_every_format() {
        let converters = default_converters(None);
        for format in ExportFormat::ALL {
            assert_eq!(converters[&format].format_name(), format.as_str());
        }
    }

    #[tokio::test]
    async fn test_missing_tool_is_reported() {
        let err = run_tool("definitely-not-a-real-tool", &[], &CancellationToken::new()).await;
        assert!(matches!(err, Err(ExportError::Tool { .. })));
    }
}
